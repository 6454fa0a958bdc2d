use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use pipewatch_common::{
    Job, JobStatus, StatusUpdate,
    error::{PipewatchError, Result},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::JobStore;

pub const INTERRUPTED_PHASE: &str = "Controller restarted";

/// Result of merging the cache view with the store view.
#[derive(Debug, Default, PartialEq)]
pub struct MergeOutcome {
    pub merged: HashMap<String, Job>,
    /// Records the store is missing or holds an older copy of.
    pub write_through: Vec<Job>,
}

/// Merges by id. The greater `last_updated` wins and the cache wins ties. A
/// tie with different content is written through so the store converges.
pub fn merge_jobs(cache: &HashMap<String, Job>, stored: Vec<Job>) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut stored: HashMap<String, Job> = stored
        .into_iter()
        .map(|job| (job.id.clone(), job))
        .collect();

    for (id, cached) in cache {
        match stored.remove(id) {
            Some(persisted) if persisted.last_updated > cached.last_updated => {
                outcome.merged.insert(id.clone(), persisted);
            }
            Some(persisted) => {
                if persisted != *cached {
                    outcome.write_through.push(cached.clone());
                }
                outcome.merged.insert(id.clone(), cached.clone());
            }
            None => {
                outcome.write_through.push(cached.clone());
                outcome.merged.insert(id.clone(), cached.clone());
            }
        }
    }
    outcome.merged.extend(stored);
    outcome.write_through.sort_by(|a, b| a.id.cmp(&b.id));
    outcome
}

/// Typed job collection shared by every component: an in-memory cache in
/// front of a [`JobStore`].
///
/// Every path that writes to the store holds `store_lock`, so a removal can
/// not interleave with a write-through of the cached copy.
pub struct StateManager {
    store: Arc<dyn JobStore>,
    cache: RwLock<HashMap<String, Job>>,
    store_lock: Mutex<()>,
}

impl StateManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            store_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn reconcile(&self) -> Result<()> {
        let _store = self.store_lock.lock().await;
        let stored = self.store.list_all().await?;
        let outcome = merge_jobs(&self.cache_snapshot()?, stored);

        for job in &outcome.write_through {
            self.store.upsert(job).await?;
        }
        if !outcome.write_through.is_empty() {
            debug!(count = outcome.write_through.len(), "wrote cached jobs through to store");
        }

        let mut cache = self.cache_write()?;
        for (id, job) in outcome.merged {
            match cache.get(&id) {
                Some(current) if current.last_updated > job.last_updated => {}
                _ => {
                    cache.insert(id, job);
                }
            }
        }
        Ok(())
    }

    /// Reconciles a single record and returns the winner.
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let _store = self.store_lock.lock().await;
        let stored = self.store.get(id).await?;
        let cached = self.cached(id)?;
        let cache = cached
            .map(|job| HashMap::from([(job.id.clone(), job)]))
            .unwrap_or_default();
        let outcome = merge_jobs(&cache, stored.into_iter().collect());

        for job in &outcome.write_through {
            self.store.upsert(job).await?;
        }
        let Some(job) = outcome.merged.get(id).cloned() else {
            return Ok(None);
        };
        self.cache_write()?.insert(job.id.clone(), job.clone());
        Ok(Some(job))
    }

    /// Stamps `last_updated`, caches the job and writes it to the store.
    pub async fn set(&self, mut job: Job) -> Result<Job> {
        job.touch();
        let _store = self.store_lock.lock().await;
        self.cache_write()?.insert(job.id.clone(), job.clone());
        self.store.upsert(&job).await?;
        Ok(job)
    }

    /// Deletes the stored record and drops the cached copy as one step.
    /// Returns the store's answer.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _store = self.store_lock.lock().await;
        let deleted = self.store.delete(id).await?;
        self.cache_write()?.remove(id);
        Ok(deleted)
    }

    /// Jobs newest first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.reconcile().await?;
        let mut jobs = self.cache_snapshot()?.into_values().collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }

    pub fn cached(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.cache_read()?.get(id).cloned())
    }

    pub fn purge(&self, id: &str) -> Result<()> {
        self.cache_write()?.remove(id);
        Ok(())
    }

    /// Merges a sparse status message into the job it names.
    pub async fn apply_update(&self, update: StatusUpdate) -> Result<Option<Job>> {
        let Some(mut job) = self.get(&update.job_id).await? else {
            warn!(job_id = %update.job_id, "status update for unknown job");
            return Ok(None);
        };
        if job.is_terminal() || job.status == JobStatus::Interrupted {
            debug!(job_id = %job.id, status = %job.status, "ignoring status update for settled job");
            return Ok(None);
        }

        let before = job.clone();
        let target = update.status.or(update
            .error_message
            .as_ref()
            .map(|_| JobStatus::Error));
        if let Some(target) = target
            && target != job.status
        {
            match job.settle(target) {
                Ok(()) => info!(job_id = %job.id, status = %job.status, "job status changed"),
                Err(err) => warn!(job_id = %job.id, error = %err, "ignoring status update"),
            }
        }
        if let Some(phase) = update.phase {
            job.phase = phase;
        }
        if let Some(progress) = update.progress {
            job.record_progress(progress);
        }
        if let Some(path) = update.log_file_path
            && !job.assign_log_file_path(path.clone())
        {
            warn!(job_id = %job.id, path = %path.display(), "ignoring log file path reassignment");
        }
        if let Some(path) = update.output_path {
            job.output_path = Some(path);
        }
        if let Some(message) = update.error_message
            && matches!(job.status, JobStatus::Error | JobStatus::Failed)
        {
            job.error_message = Some(message);
        }

        if job == before {
            return Ok(Some(job));
        }
        self.set(job).await.map(Some)
    }

    /// Marks every job still active in the store as `Interrupted`. Run once
    /// at startup, before any worker is launched.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.reconcile().await?;
        let active = self
            .cache_snapshot()?
            .into_values()
            .filter(Job::is_active)
            .collect::<Vec<_>>();

        let count = active.len();
        for mut job in active {
            job.transition(JobStatus::Interrupted)?;
            job.phase = INTERRUPTED_PHASE.to_string();
            info!(job_id = %job.id, "marking job interrupted after restart");
            self.set(job).await?;
        }
        Ok(count)
    }

    fn cache_snapshot(&self) -> Result<HashMap<String, Job>> {
        Ok(self.cache_read()?.clone())
    }

    fn cache_read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Job>>> {
        self.cache
            .read()
            .map_err(|_| PipewatchError::InternalError("job cache lock poisoned".to_string()))
    }

    fn cache_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Job>>> {
        self.cache
            .write()
            .map_err(|_| PipewatchError::InternalError("job cache lock poisoned".to_string()))
    }
}
