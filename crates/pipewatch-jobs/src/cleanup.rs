use std::{path::Path, sync::Arc};

use pipewatch_common::{Job, error::Result};
use tokio::fs;
use tracing::{info, warn};

use crate::{state::StateManager, tailer::LogTailer};

/// Removes a job's record together with its filesystem artifacts.
pub struct CleanupService {
    state: Arc<StateManager>,
    tailer: Arc<LogTailer>,
}

impl CleanupService {
    pub fn new(state: Arc<StateManager>, tailer: Arc<LogTailer>) -> Self {
        Self { state, tailer }
    }

    /// Artifact removal is best effort; the store deletion decides the result.
    /// An unknown job counts as already deleted.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let job = match self.state.cached(id)? {
            Some(job) => Some(job),
            None => self.state.store().get(id).await?,
        };
        let Some(job) = job else {
            info!(job_id = %id, "job already deleted");
            if let Err(err) = self.state.purge(id) {
                warn!(job_id = %id, error = %err, "failed to purge job from cache");
            }
            self.forget_cursor(id);
            return Ok(true);
        };

        remove_artifacts(&job).await;

        let deleted = self.state.remove(id).await?;
        self.forget_cursor(id);
        info!(job_id = %id, deleted, "job deleted");
        Ok(deleted)
    }

    fn forget_cursor(&self, id: &str) {
        if let Err(err) = self.tailer.forget(id) {
            warn!(job_id = %id, error = %err, "failed to drop log cursor");
        }
    }
}

async fn remove_artifacts(job: &Job) {
    if let Some(path) = &job.log_file_path {
        remove_file(&job.id, path, "log file").await;
    }
    if let Some(dir) = &job.output_dir {
        match fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                job_id = %job.id,
                path = %dir.display(),
                error = %err,
                "failed to remove output directory"
            ),
        }
    }
    for path in &job.input_artifacts {
        remove_file(&job.id, path, "input artifact").await;
    }
    if let Some(parent) = job
        .input_artifacts
        .first()
        .and_then(|path| path.parent())
        .filter(|parent| parent.file_name().is_some_and(|name| name == job.id.as_str()))
    {
        // Only succeeds once the per-job input directory is empty.
        let _ = fs::remove_dir(parent).await;
    }
}

async fn remove_file(job_id: &str, path: &Path, kind: &str) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(job_id = %job_id, path = %path.display(), "{kind} already missing");
        }
        Err(err) => warn!(
            job_id = %job_id,
            path = %path.display(),
            error = %err,
            "failed to remove {kind}"
        ),
    }
}
