pub mod error;
pub mod time;
pub mod types;

pub use error::{PipewatchError, Result};
pub use types::{Job, JobStatus, StatusUpdate};
