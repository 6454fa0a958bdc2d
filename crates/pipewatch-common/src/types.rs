use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipewatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Idle,
    Initializing,
    Running,
    Completed,
    Error,
    Failed,
    Cancelled,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initializing => "Initializing",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Interrupted => "Interrupted",
        }
    }

    /// `Interrupted` is soft-terminal and deliberately not included.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initializing | Self::Running)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Running)
                | (Initializing, Error)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Failed)
                | (Initializing | Running, Cancelled)
                | (Initializing | Running, Interrupted)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Last computed progress in `[0.0, 1.0]`. May move backwards between passes.
    #[serde(default)]
    pub progress: f64,
    /// Display ratchet, never decreases.
    #[serde(default)]
    pub max_progress: f64,
    #[serde(default)]
    pub phase: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub input_artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub last_updated: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Idle,
            progress: 0.0,
            max_progress: 0.0,
            phase: String::new(),
            start_time: now,
            end_time: None,
            config,
            log_file_path: None,
            output_path: None,
            output_dir: None,
            error_message: None,
            input_artifacts: Vec::new(),
            pid: None,
            last_updated: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn display_progress(&self) -> f64 {
        self.max_progress
    }

    /// Moves along a single edge of the status state machine.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(PipewatchError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() || next == JobStatus::Interrupted {
            self.end_time.get_or_insert_with(Utc::now);
            self.pid = None;
        }
        if next == JobStatus::Completed {
            self.progress = 1.0;
            self.max_progress = 1.0;
        }
        self.touch();
        Ok(())
    }

    /// Like [`Job::transition`], but an `Initializing` job reaching an outcome that is
    /// only reachable from `Running` passes through `Running` first. Evidence of an
    /// outcome (a log marker, a reaped process) implies the worker did start.
    pub fn settle(&mut self, outcome: JobStatus) -> Result<()> {
        if self.status == JobStatus::Initializing
            && !self.status.can_transition_to(outcome)
            && JobStatus::Running.can_transition_to(outcome)
        {
            self.transition(JobStatus::Running)?;
        }
        self.transition(outcome)
    }

    /// Stores a freshly computed progress value and advances the display ratchet.
    /// Returns whether anything changed.
    pub fn record_progress(&mut self, computed: f64) -> bool {
        let computed = computed.clamp(0.0, 1.0);
        let mut changed = false;
        if self.progress != computed {
            self.progress = computed;
            changed = true;
        }
        if computed > self.max_progress {
            self.max_progress = computed;
            changed = true;
        }
        changed
    }

    /// `log_file_path` is write-once. Returns `false` when a different path was
    /// already assigned.
    pub fn assign_log_file_path(&mut self, path: PathBuf) -> bool {
        match &self.log_file_path {
            Some(existing) => *existing == path,
            None => {
                self.log_file_path = Some(path);
                true
            }
        }
    }
}

/// Sparse status message published on a job's status channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Job, JobStatus};

    #[test]
    fn only_listed_edges_are_allowed() {
        use JobStatus::*;

        assert!(Idle.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Initializing.can_transition_to(Interrupted));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Interrupted.can_transition_to(Running));
    }

    #[test]
    fn terminal_transition_sets_end_time_and_clears_pid() {
        let mut job = Job::new("job_1", serde_json::Value::Null);
        job.transition(JobStatus::Initializing).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.pid = Some(4242);

        job.transition(JobStatus::Completed).unwrap();

        assert!(job.end_time.is_some());
        assert_eq!(job.pid, None);
        assert_eq!(job.display_progress(), 1.0);
    }

    #[test]
    fn settle_passes_through_running() {
        let mut job = Job::new("job_1", serde_json::Value::Null);
        job.transition(JobStatus::Initializing).unwrap();

        job.settle(JobStatus::Failed).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn settle_rejects_leaving_a_terminal_state() {
        let mut job = Job::new("job_1", serde_json::Value::Null);
        job.transition(JobStatus::Initializing).unwrap();
        job.transition(JobStatus::Cancelled).unwrap();

        assert!(job.settle(JobStatus::Completed).is_err());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn display_progress_is_a_ratchet() {
        let mut job = Job::new("job_1", serde_json::Value::Null);
        assert!(job.record_progress(0.4));
        assert!(job.record_progress(0.2));

        assert_eq!(job.progress, 0.2);
        assert_eq!(job.display_progress(), 0.4);
        assert!(!job.record_progress(0.2));
    }

    #[test]
    fn log_file_path_is_write_once() {
        let mut job = Job::new("job_1", serde_json::Value::Null);
        assert!(job.assign_log_file_path("a.log".into()));
        assert!(job.assign_log_file_path("a.log".into()));
        assert!(!job.assign_log_file_path("b.log".into()));
        assert_eq!(job.log_file_path.as_deref(), Some(std::path::Path::new("a.log")));
    }
}
