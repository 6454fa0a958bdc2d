use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use pipewatch_common::{
    Job,
    error::{PipewatchError, Result},
};
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use tracing::debug;

/// Durable job records. The store is the authority on whether a job exists.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces a record. A write older than the stored record's
    /// `last_updated` is dropped.
    async fn upsert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    async fn list_all(&self) -> Result<Vec<Job>>;

    /// Returns `true` when the record was removed or was already absent.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// One pretty-printed JSON document per job under `<data_dir>/jobs`.
#[derive(Debug)]
pub struct FileJobStore {
    jobs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let jobs_dir = data_dir.as_ref().join("jobs");
        fs::create_dir_all(&jobs_dir).await?;
        Ok(Self {
            jobs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn job_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || id.contains(['/', '\\'])
            || id.starts_with('.')
        {
            return Err(PipewatchError::InvalidArgument(format!(
                "invalid job id '{id}'"
            )));
        }
        Ok(self.jobs_dir.join(format!("{id}.json")))
    }

    async fn read_json_if_exists(&self, path: &Path) -> Result<Option<Job>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let job = serde_json::from_slice(&bytes).map_err(|err| {
                    PipewatchError::InternalError(format!(
                        "failed to deserialize job record {}: {err}",
                        path.display()
                    ))
                })?;
                Ok(Some(job))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn upsert(&self, job: &Job) -> Result<()> {
        let path = self.job_path(&job.id)?;
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.read_json_if_exists(&path).await?
            && existing.last_updated > job.last_updated
        {
            debug!(job_id = %job.id, "skipping stale job record write");
            return Ok(());
        }

        let payload = serde_json::to_vec_pretty(job).map_err(|err| {
            PipewatchError::InternalError(format!(
                "failed to serialize job record {}: {err}",
                job.id
            ))
        })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        let path = self.job_path(id)?;
        self.read_json_if_exists(&path).await
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.jobs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            if !is_json {
                continue;
            }

            if let Some(job) = self.read_json_if_exists(&path).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.job_path(id)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.id)
            && existing.last_updated > job.last_updated
        {
            return Ok(());
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.jobs.write().await.remove(id);
        Ok(true)
    }
}
