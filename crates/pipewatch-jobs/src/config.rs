use std::{env, path::PathBuf, time::Duration};

use pipewatch_common::error::{PipewatchError, Result};
use serde::{Deserialize, Serialize};

/// Program started for every job. The job's context is passed through
/// `PIPEWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Splits a whitespace-separated command line, e.g. `python -m pipeline`.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            PipewatchError::InvalidArgument("worker command must not be empty".to_string())
        })?;
        Ok(Self::new(program).with_args(parts))
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("pipewatch-worker")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSysConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub catalog_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub liveness_min_interval: Duration,
    pub liveness_workers: usize,
    pub base_progress: f64,
    pub status_channel_capacity: usize,
    pub worker: WorkerCommand,
}

impl Default for JobSysConfig {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl JobSysConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let mut config = Self {
            data_dir: PathBuf::new(),
            log_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            input_dir: PathBuf::new(),
            catalog_path: None,
            poll_interval: Duration::from_secs(3),
            liveness_min_interval: Duration::from_secs(1),
            liveness_workers: 4,
            base_progress: 0.05,
            status_channel_capacity: 1024,
            worker: WorkerCommand::default(),
        };
        config.set_data_dir(data_dir);
        config
    }

    /// Moves `logs/`, `output/` and `input/` under the new `data_dir`.
    pub fn set_data_dir(&mut self, data_dir: impl Into<PathBuf>) {
        let data_dir = data_dir.into();
        self.log_dir = data_dir.join("logs");
        self.output_dir = data_dir.join("output");
        self.input_dir = data_dir.join("input");
        self.data_dir = data_dir;
    }

    pub fn from_env() -> Result<Self> {
        let mut config = match env::var("PIPEWATCH_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Self::with_data_dir(dir.trim()),
            _ => Self::default(),
        };

        if let Ok(secs) = env::var("PIPEWATCH_POLL_INTERVAL_SECS") {
            let secs = secs.trim().parse::<u64>().map_err(|err| {
                PipewatchError::InvalidArgument(format!(
                    "invalid PIPEWATCH_POLL_INTERVAL_SECS '{secs}': {err}"
                ))
            })?;
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(workers) = env::var("PIPEWATCH_LIVENESS_WORKERS") {
            config.liveness_workers = workers.trim().parse::<usize>().map_err(|err| {
                PipewatchError::InvalidArgument(format!(
                    "invalid PIPEWATCH_LIVENESS_WORKERS '{workers}': {err}"
                ))
            })?;
        }
        if let Ok(worker) = env::var("PIPEWATCH_WORKER")
            && !worker.trim().is_empty()
        {
            config.worker = WorkerCommand::parse(&worker)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.liveness_workers == 0 {
            return Err(PipewatchError::InvalidArgument(
                "liveness_workers must be at least 1".to_string(),
            ));
        }
        if self.status_channel_capacity == 0 {
            return Err(PipewatchError::InvalidArgument(
                "status_channel_capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.base_progress) {
            return Err(PipewatchError::InvalidArgument(format!(
                "base_progress must be in [0, 1), got {}",
                self.base_progress
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{JobSysConfig, WorkerCommand};

    #[test]
    fn directories_follow_data_dir() {
        let config = JobSysConfig::with_data_dir("/srv/pipewatch");

        assert_eq!(config.log_dir, PathBuf::from("/srv/pipewatch/logs"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/pipewatch/output"));
        assert_eq!(config.input_dir, PathBuf::from("/srv/pipewatch/input"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relocating_moves_every_directory() {
        let mut config = JobSysConfig::default();
        config.set_data_dir("/var/lib/pipewatch");

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pipewatch"));
        assert_eq!(config.log_dir, PathBuf::from("/var/lib/pipewatch/logs"));
    }

    #[test]
    fn worker_command_line_is_split() {
        let worker = WorkerCommand::parse("  python3 -m pipeline.master ").unwrap();

        assert_eq!(worker.program, PathBuf::from("python3"));
        assert_eq!(worker.args, vec!["-m", "pipeline.master"]);
        assert!(WorkerCommand::parse("   ").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = JobSysConfig::default();
        config.liveness_workers = 0;
        assert!(config.validate().is_err());

        let mut config = JobSysConfig::default();
        config.base_progress = 1.5;
        assert!(config.validate().is_err());
    }
}
