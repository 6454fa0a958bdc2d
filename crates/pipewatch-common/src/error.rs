use thiserror::Error;

use crate::types::JobStatus;

#[derive(Debug, Error)]
pub enum PipewatchError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("failed to launch worker: {0}")]
    Launch(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipewatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound(_) => "JobNotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::Launch(_) => "LaunchFailed",
            Self::InternalError(_) => "InternalError",
            Self::Io(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipewatchError>;
