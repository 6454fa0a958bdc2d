use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use pipewatch_common::{
    Job, JobStatus,
    error::{PipewatchError, Result},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, info, warn};

use crate::{
    catalog::PhaseCatalog,
    protocol::{Batch, Directive},
    state::StateManager,
};

pub const LOG_MISSING_MESSAGE: &str = "Log file disappeared.";
pub const LOG_MISSING_PHASE: &str = "Log file missing";
pub const FINISHED_PHASE: &str = "Finished";
pub const EXITING_PHASE: &str = "Worker exiting";

/// Bytes appended to a log since some offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    /// Where the read actually started. Lower than the requested offset when
    /// the file was truncated.
    pub start: u64,
    pub bytes: Vec<u8>,
    pub end: u64,
}

#[async_trait]
pub trait LogReader: Send + Sync {
    /// Reads from `offset` to end of file. `Ok(None)` when the file is missing.
    async fn read_from(&self, path: &Path, offset: u64) -> Result<Option<LogChunk>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsLogReader;

#[async_trait]
impl LogReader for FsLogReader {
    async fn read_from(&self, path: &Path, offset: u64) -> Result<Option<LogChunk>> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata().await?.len();
        let start = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(start)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        let end = start + bytes.len() as u64;

        Ok(Some(LogChunk { start, bytes, end }))
    }
}

/// In-memory logs keyed by path.
#[derive(Debug, Default)]
pub struct MemoryLogReader {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryLogReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, path: impl Into<PathBuf>, text: &str) {
        if let Ok(mut files) = self.files.lock() {
            files
                .entry(path.into())
                .or_default()
                .extend_from_slice(text.as_bytes());
        }
    }

    pub fn replace(&self, path: impl Into<PathBuf>, text: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), text.as_bytes().to_vec());
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut files) = self.files.lock() {
            files.remove(path);
        }
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read_from(&self, path: &Path, offset: u64) -> Result<Option<LogChunk>> {
        let files = self
            .files
            .lock()
            .map_err(|_| PipewatchError::InternalError("log reader lock poisoned".to_string()))?;
        let Some(data) = files.get(path) else {
            return Ok(None);
        };

        let len = data.len() as u64;
        let start = if len < offset { 0 } else { offset };
        Ok(Some(LogChunk {
            start,
            bytes: data[start as usize..].to_vec(),
            end: len,
        }))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub offset: u64,
    /// Unterminated trailing bytes from the previous read.
    pub partial: Vec<u8>,
    pub stopped: bool,
}

/// Read positions keyed by job id.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Result<Cursor> {
        Ok(self.lock()?.get(job_id).cloned().unwrap_or_default())
    }

    pub fn put(&self, job_id: &str, cursor: Cursor) -> Result<()> {
        self.lock()?.insert(job_id.to_string(), cursor);
        Ok(())
    }

    pub fn forget(&self, job_id: &str) -> Result<()> {
        self.lock()?.remove(job_id);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Cursor>>> {
        self.cursors
            .lock()
            .map_err(|_| PipewatchError::InternalError("cursor store lock poisoned".to_string()))
    }
}

/// Incremental reader of job logs. One tailer owns all cursors, so calls for
/// the same job must not run concurrently.
pub struct LogTailer {
    reader: Arc<dyn LogReader>,
    cursors: CursorStore,
    catalog: Arc<PhaseCatalog>,
    state: Arc<StateManager>,
    base_progress: f64,
}

impl LogTailer {
    pub fn new(
        reader: Arc<dyn LogReader>,
        catalog: Arc<PhaseCatalog>,
        state: Arc<StateManager>,
        base_progress: f64,
    ) -> Self {
        Self {
            reader,
            cursors: CursorStore::new(),
            catalog,
            state,
            base_progress,
        }
    }

    /// Applies newly appended log lines to `job` and persists it when
    /// something changed.
    pub async fn tail(&self, job: &Job) -> Result<bool> {
        if !job.is_active() || self.cursors.get(&job.id)?.stopped {
            return Ok(false);
        }

        let mut updated = job.clone();
        if !self.advance(&mut updated, false).await? {
            return Ok(false);
        }
        let settled = !updated.is_active();
        self.state.set(updated).await?;
        if settled {
            self.cursors.forget(&job.id)?;
        }
        Ok(true)
    }

    /// Final read after the worker is gone. Flushes any unterminated trailing
    /// line and updates `job` in place without persisting it.
    pub async fn drain(&self, job: &mut Job) -> Result<bool> {
        if self.cursors.get(&job.id)?.stopped {
            return Ok(false);
        }
        self.advance(job, true).await
    }

    /// Drops the job's cursor. Called once the job has settled or is deleted.
    pub fn forget(&self, job_id: &str) -> Result<()> {
        self.cursors.forget(job_id)
    }

    pub fn tracked(&self) -> Result<usize> {
        Ok(self.cursors.lock()?.len())
    }

    async fn advance(&self, job: &mut Job, flush: bool) -> Result<bool> {
        let Some(path) = job.log_file_path.clone() else {
            return self.log_missing(job);
        };
        let mut cursor = self.cursors.get(&job.id)?;
        let Some(chunk) = self.reader.read_from(&path, cursor.offset).await? else {
            return self.log_missing(job);
        };

        if chunk.start < cursor.offset {
            warn!(
                job_id = %job.id,
                path = %path.display(),
                offset = cursor.offset,
                "log file shrank, reading from the start"
            );
            cursor.partial.clear();
        }
        if chunk.bytes.is_empty() && !(flush && !cursor.partial.is_empty()) {
            if cursor.offset != chunk.end {
                cursor.offset = chunk.end;
                self.cursors.put(&job.id, cursor)?;
            }
            return Ok(false);
        }

        let mut data = std::mem::take(&mut cursor.partial);
        data.extend_from_slice(&chunk.bytes);
        let complete_len = if flush {
            data.len()
        } else {
            data.iter().rposition(|byte| *byte == b'\n').map_or(0, |idx| idx + 1)
        };
        cursor.partial = data.split_off(complete_len);
        cursor.offset = chunk.end;
        self.cursors.put(&job.id, cursor)?;

        let text = String::from_utf8_lossy(&data);
        let batch = Batch::scan(text.lines());
        if batch.is_empty() {
            return Ok(false);
        }
        Ok(self.apply(job, batch))
    }

    fn apply(&self, job: &mut Job, batch: Batch) -> bool {
        let before = job.clone();

        if let Some(Directive::Progress {
            stage,
            step,
            details,
        }) = batch.progress
        {
            if job.status == JobStatus::Initializing
                && let Err(err) = job.transition(JobStatus::Running)
            {
                warn!(job_id = %job.id, error = %err, "could not mark job running");
            }
            if let Some(update) =
                self.catalog
                    .resolve(&stage, &step, details.as_deref(), self.base_progress)
            {
                job.phase = update.phase;
                job.record_progress(update.progress);
            }
        }

        if let Some(path) = batch.final_output {
            job.output_path = Some(path);
        }

        match batch.terminal {
            Some(Directive::Completed) => match job.settle(JobStatus::Completed) {
                Ok(()) => {
                    job.phase = FINISHED_PHASE.to_string();
                    info!(job_id = %job.id, "job completed");
                }
                Err(err) => warn!(job_id = %job.id, error = %err, "ignoring completion marker"),
            },
            Some(Directive::Error(message)) => match job.settle(JobStatus::Error) {
                Ok(()) => {
                    info!(job_id = %job.id, error = %message, "job reported an error");
                    job.error_message = Some(message);
                }
                Err(err) => warn!(job_id = %job.id, error = %err, "ignoring error marker"),
            },
            _ if batch.exiting => {
                debug!(job_id = %job.id, "worker announced exit");
                job.phase = EXITING_PHASE.to_string();
            }
            _ => {}
        }

        *job != before
    }

    fn log_missing(&self, job: &mut Job) -> Result<bool> {
        let mut cursor = self.cursors.get(&job.id)?;
        cursor.stopped = true;
        self.cursors.put(&job.id, cursor)?;

        if !job.is_active() {
            return Ok(false);
        }
        warn!(
            job_id = %job.id,
            path = ?job.log_file_path,
            "log file missing for active job, stopping tail"
        );
        job.error_message = Some(LOG_MISSING_MESSAGE.to_string());
        job.phase = LOG_MISSING_PHASE.to_string();
        job.transition(JobStatus::Error)?;
        Ok(true)
    }
}
