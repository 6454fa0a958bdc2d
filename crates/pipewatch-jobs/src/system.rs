use std::{sync::Arc, time::Duration};

use pipewatch_common::{
    Job, JobStatus, StatusUpdate,
    error::{PipewatchError, Result},
};
use tokio::{
    fs,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    catalog::PhaseCatalog,
    cleanup::CleanupService,
    config::JobSysConfig,
    launcher::{self, LaunchRequest, WorkerLauncher, WorkerRegistry},
    liveness::{LivenessReconciler, OsProcessProbe, ProcessProbe},
    state::StateManager,
    store::{FileJobStore, JobStore},
    tailer::{FsLogReader, LogReader, LogTailer},
};

pub const CANCELLED_PHASE: &str = "Terminated";
const MAX_EXCERPT_LINES: usize = 10_000;

/// What one polling pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub updates_applied: usize,
    pub jobs_tailed: usize,
    pub liveness_repairs: usize,
}

/// Job controller: launches workers and keeps job records in step with their
/// logs, status messages and processes.
pub struct JobSys {
    config: JobSysConfig,
    state: Arc<StateManager>,
    tailer: Arc<LogTailer>,
    liveness: LivenessReconciler,
    cleanup: CleanupService,
    launcher: WorkerLauncher,
    registry: Arc<WorkerRegistry>,
    status_rx: Mutex<mpsc::Receiver<StatusUpdate>>,
    tick_lock: Mutex<()>,
}

impl JobSys {
    /// File-backed store under `data_dir`, real log files and OS processes.
    pub async fn new(config: JobSysConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileJobStore::new(&config.data_dir).await?);
        let catalog = match &config.catalog_path {
            Some(path) => PhaseCatalog::load(path).await?,
            None => PhaseCatalog::default(),
        };
        Self::with_components(
            config,
            store,
            Arc::new(FsLogReader),
            Arc::new(OsProcessProbe),
            catalog,
        )
        .await
    }

    pub async fn with_components(
        config: JobSysConfig,
        store: Arc<dyn JobStore>,
        reader: Arc<dyn LogReader>,
        probe: Arc<dyn ProcessProbe>,
        catalog: PhaseCatalog,
    ) -> Result<Self> {
        config.validate()?;
        for dir in [&config.log_dir, &config.output_dir, &config.input_dir] {
            fs::create_dir_all(dir).await?;
        }

        let state = Arc::new(StateManager::new(store));
        let interrupted = state.recover_interrupted().await?;
        if interrupted > 0 {
            warn!(count = interrupted, "jobs interrupted by controller restart");
        }

        let tailer = Arc::new(LogTailer::new(
            reader,
            Arc::new(catalog),
            state.clone(),
            config.base_progress,
        ));
        let registry = Arc::new(WorkerRegistry::new());
        let liveness = LivenessReconciler::new(
            probe,
            tailer.clone(),
            state.clone(),
            config.liveness_min_interval,
            config.liveness_workers,
        )
        .with_registry(registry.clone());
        let cleanup = CleanupService::new(state.clone(), tailer.clone());
        let (status_tx, status_rx) = mpsc::channel(config.status_channel_capacity);
        let launcher = WorkerLauncher::new(
            config.worker.clone(),
            config.log_dir.clone(),
            config.output_dir.clone(),
            config.input_dir.clone(),
            state.clone(),
            status_tx,
            registry.clone(),
        );

        info!(data_dir = %config.data_dir.display(), "job controller ready");
        Ok(Self {
            config,
            state,
            tailer,
            liveness,
            cleanup,
            launcher,
            registry,
            status_rx: Mutex::new(status_rx),
            tick_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &JobSysConfig {
        &self.config
    }

    /// Channel for sparse status messages. Drained at the start of each tick.
    pub fn status_sender(&self) -> mpsc::Sender<StatusUpdate> {
        self.launcher.status_sender()
    }

    /// Holds the tick lock for the whole launch so a concurrent cancel or
    /// polling pass sees the job only once its pid is recorded.
    pub async fn submit(&self, request: LaunchRequest) -> Result<Job> {
        let _tick = self.tick_lock.lock().await;
        self.launcher.launch(request).await
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.state
            .get(id)
            .await?
            .ok_or_else(|| PipewatchError::JobNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.state.list().await
    }

    /// Signals the worker and marks the job cancelled without waiting for the
    /// process to exit. Returns `false` for jobs that already settled.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let _tick = self.tick_lock.lock().await;
        let mut job = self.get(id).await?;
        if !job.is_active() {
            debug!(job_id = %id, status = %job.status, "cancel ignored for settled job");
            return Ok(false);
        }

        if let Some(pid) = job.pid {
            signal_worker(&job.id, pid);
        }
        job.transition(JobStatus::Cancelled)?;
        job.phase = CANCELLED_PHASE.to_string();
        self.state.set(job).await?;
        self.tailer.forget(id)?;
        info!(job_id = %id, "job cancelled");
        Ok(true)
    }

    /// Removes the job and its artifacts. A worker still running is signalled
    /// first so it stops writing into removed paths.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _tick = self.tick_lock.lock().await;
        if let Some(job) = self.state.get(id).await?
            && job.is_active()
            && let Some(pid) = job.pid
        {
            signal_worker(&job.id, pid);
        }
        self.cleanup.delete(id).await
    }

    /// Last `lines` lines of the job's log.
    pub async fn log_excerpt(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let job = self.get(id).await?;
        let Some(path) = job.log_file_path else {
            return Ok(Vec::new());
        };
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let text = String::from_utf8_lossy(&bytes);
        let all = text.lines().collect::<Vec<_>>();
        let keep = lines.min(MAX_EXCERPT_LINES).min(all.len());
        Ok(all[all.len() - keep..]
            .iter()
            .map(|line| (*line).to_string())
            .collect())
    }

    /// One polling pass: merge status messages, reconcile cache and store,
    /// tail active logs, then check worker liveness.
    pub async fn tick(&self) -> Result<TickReport> {
        let _tick = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        let updates = {
            let mut rx = self.status_rx.lock().await;
            let mut updates = Vec::new();
            while let Ok(update) = rx.try_recv() {
                updates.push(update);
            }
            updates
        };
        for update in updates {
            if self.state.apply_update(update).await?.is_some() {
                report.updates_applied += 1;
            }
        }

        for job in self.active_jobs().await? {
            match self.tailer.tail(&job).await {
                Ok(true) => report.jobs_tailed += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, error = %err, "log tail failed"),
            }
        }

        let active = self.active_jobs().await?;
        report.liveness_repairs = self.liveness.reconcile(&active).await?;
        self.registry.prune(active.iter().map(|job| job.id.as_str()));

        if report != TickReport::default() {
            debug!(?report, live_workers = self.launcher.live_count(), "polling pass changed jobs");
        }
        Ok(report)
    }

    pub fn start_polling_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.poll_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    warn!(error = %err, "polling pass failed");
                }
            }
        })
    }

    async fn active_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .state
            .list()
            .await?
            .into_iter()
            .filter(Job::is_active)
            .collect())
    }
}

fn signal_worker(job_id: &str, pid: u32) {
    match launcher::terminate(pid) {
        Ok(true) => info!(job_id = %job_id, pid, "sent SIGTERM to worker"),
        Ok(false) => debug!(job_id = %job_id, pid, "worker already gone"),
        Err(err) => warn!(job_id = %job_id, pid, error = %err, "failed to signal worker"),
    }
}
