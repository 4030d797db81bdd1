use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::JobSpec;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Suite has no jobs")]
    NoJobs,
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("Job {0} has a zero time budget")]
    ZeroBudget(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Serde helper for durations written as (fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// How benchmark commands are spawned on this host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Shell used for `shell` invocations
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working directory, typically the checkout of the benchmarked revision
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Extra time granted to remote agents on top of the job budget
    #[serde(default = "default_remote_grace_ms")]
    pub remote_grace_ms: u64,
    /// Extra environment for every benchmark process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_remote_grace_ms() -> u64 {
    5_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            workdir: None,
            remote_grace_ms: default_remote_grace_ms(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Interval between automatic runs; manual triggers only when null
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: Option<u64>,
    /// Hard limit for a run; stragglers are cancelled when it elapses
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    /// Triggers queued while a run is active; 0 coalesces them
    #[serde(default)]
    pub max_pending_runs: usize,
}

fn default_cadence_secs() -> Option<u64> {
    Some(24 * 60 * 60)
}

fn default_run_deadline_secs() -> u64 {
    6 * 60 * 60
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cadence_secs: default_cadence_secs(),
            run_deadline_secs: default_run_deadline_secs(),
            max_pending_runs: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn cadence(&self) -> Option<Duration> {
        self.cadence_secs.map(Duration::from_secs)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}

/// Where the revision of a run comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionConfig {
    Static(String),
    Git {
        repo: PathBuf,
        #[serde(default = "default_reference")]
        reference: String,
    },
}

fn default_reference() -> String {
    "HEAD".to_string()
}

impl Default for RevisionConfig {
    fn default() -> Self {
        RevisionConfig::Git {
            repo: PathBuf::from("."),
            reference: default_reference(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Worker slots executed by this process
    #[serde(default = "default_local_slots")]
    pub local_slots: u32,
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_local_slots() -> u32 {
    1
}

fn default_local_capacity() -> u32 {
    1
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            local_slots: default_local_slots(),
            local_capacity: default_local_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl WorkersConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Directory receiving `<run_id>.json` and `latest.json`
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Reports kept in memory for the admin API
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_history() -> usize {
    30
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            dir: None,
            history: default_history(),
        }
    }
}

/// Top-level configuration: the benchmark suite plus how to schedule it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub revision: RevisionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    pub jobs: Vec<JobSpec>,
}

impl SuiteConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: SuiteConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }
        let mut names = HashSet::new();
        for job in &self.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            if job.time_budget.is_zero() {
                return Err(ConfigError::ZeroBudget(job.name.clone()));
            }
        }
        if self.schedule.run_deadline_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "schedule.run_deadline_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.schedule.cadence_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "schedule.cadence_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.workers.local_slots > 0 && self.workers.local_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.local_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.workers.heartbeat_timeout_ms <= self.workers.heartbeat_interval_ms {
            return Err(ConfigError::Invalid {
                field: "workers.heartbeat_timeout_ms",
                reason: "must exceed heartbeat_interval_ms".to_string(),
            });
        }
        Ok(())
    }
}
