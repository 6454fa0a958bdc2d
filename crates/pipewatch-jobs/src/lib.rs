pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod launcher;
pub mod liveness;
pub mod protocol;
pub mod state;
pub mod store;
pub mod system;
pub mod tailer;

pub use config::{JobSysConfig, WorkerCommand};
pub use system::JobSys;
