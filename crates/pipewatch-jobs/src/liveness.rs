use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use pipewatch_common::{
    Job, JobStatus,
    error::{PipewatchError, Result},
};
use tracing::{debug, info, warn};

use crate::{launcher::WorkerRegistry, state::StateManager, tailer::LogTailer};

pub const VANISHED_MESSAGE: &str = "Worker process exited without reporting completion.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    Dead,
}

#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn probe(&self, pid: u32) -> ProcessState;
}

/// Signal-0 probe. Zombies count as dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessProbe;

#[async_trait]
impl ProcessProbe for OsProcessProbe {
    async fn probe(&self, pid: u32) -> ProcessState {
        match tokio::task::spawn_blocking(move || probe_pid(pid)).await {
            Ok(state) => state,
            Err(err) => {
                warn!(pid, error = %err, "process probe task failed, assuming alive");
                ProcessState::Alive
            }
        }
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> ProcessState {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return ProcessState::Dead;
    };
    if raw <= 0 {
        return ProcessState::Dead;
    }

    // Safety: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return if err.raw_os_error() == Some(libc::EPERM) {
            ProcessState::Alive
        } else {
            ProcessState::Dead
        };
    }

    if is_zombie(pid) {
        ProcessState::Dead
    } else {
        ProcessState::Alive
    }
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> ProcessState {
    ProcessState::Alive
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesised and may itself contain spaces or ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Probe answering from a fixed table; unknown pids are dead.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    states: Mutex<HashMap<u32, ProcessState>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32, state: ProcessState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(pid, state);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessProbe for ScriptedProbe {
    async fn probe(&self, pid: u32) -> ProcessState {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&pid).copied())
            .unwrap_or(ProcessState::Dead)
    }
}

/// Repairs active jobs whose worker process is gone.
pub struct LivenessReconciler {
    probe: Arc<dyn ProcessProbe>,
    registry: Option<Arc<WorkerRegistry>>,
    tailer: Arc<LogTailer>,
    state: Arc<StateManager>,
    min_interval: Duration,
    workers: usize,
    last_run: Mutex<Option<Instant>>,
    in_progress: AtomicBool,
}

impl LivenessReconciler {
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        tailer: Arc<LogTailer>,
        state: Arc<StateManager>,
        min_interval: Duration,
        workers: usize,
    ) -> Self {
        Self {
            probe,
            registry: None,
            tailer,
            state,
            min_interval,
            workers: workers.max(1),
            last_run: Mutex::new(None),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Children this controller has already reaped are dead without a probe.
    pub fn with_registry(mut self, registry: Arc<WorkerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Probes every active job with a pid, at most `workers` at a time, and
    /// applies the results once all probes are back. Calls arriving within
    /// `min_interval` of the previous pass, or while a pass runs, do nothing.
    /// Returns the number of jobs changed.
    pub async fn reconcile(&self, jobs: &[Job]) -> Result<usize> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            debug!("liveness pass already running");
            return Ok(0);
        }
        let _pass = PassGuard(&self.in_progress);

        {
            let mut last_run = self
                .last_run
                .lock()
                .map_err(|_| PipewatchError::InternalError("liveness lock poisoned".to_string()))?;
            if last_run.is_some_and(|at| at.elapsed() < self.min_interval) {
                return Ok(0);
            }
            *last_run = Some(Instant::now());
        }

        let candidates = jobs
            .iter()
            .filter(|job| job.is_active())
            .filter_map(|job| job.pid.map(|pid| (job.id.clone(), pid)))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(0);
        }

        let probe = &self.probe;
        let registry = self.registry.as_deref();
        let results = stream::iter(candidates)
            .map(|(id, pid)| async move {
                if registry.is_some_and(|registry| registry.has_exited(&id, pid)) {
                    return (id, pid, ProcessState::Dead);
                }
                let process = probe.probe(pid).await;
                (id, pid, process)
            })
            .buffer_unordered(self.workers)
            .collect::<Vec<_>>()
            .await;

        let mut changed = 0;
        for (id, pid, process) in results {
            let Some(job) = self.state.get(&id).await? else {
                continue;
            };
            // Cancellation or a log marker may have settled the job meanwhile.
            if !job.is_active() || job.pid != Some(pid) {
                continue;
            }

            let updated = match process {
                ProcessState::Alive => self.confirm_started(job),
                ProcessState::Dead => Some(self.settle_dead(job).await),
            };
            if let Some(job) = updated {
                let settled = !job.is_active();
                self.state.set(job).await?;
                if settled {
                    self.tailer.forget(&id)?;
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn confirm_started(&self, mut job: Job) -> Option<Job> {
        if job.status != JobStatus::Initializing {
            return None;
        }
        match job.transition(JobStatus::Running) {
            Ok(()) => Some(job),
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "could not mark job running");
                None
            }
        }
    }

    async fn settle_dead(&self, mut job: Job) -> Job {
        if let Err(err) = self.tailer.drain(&mut job).await {
            warn!(job_id = %job.id, error = %err, "final log drain failed");
        }
        if job.is_terminal() {
            info!(job_id = %job.id, status = %job.status, "worker exited after final marker");
            return job;
        }

        let outcome = if job.error_message.is_some() {
            JobStatus::Error
        } else {
            JobStatus::Failed
        };
        if let Err(err) = job.settle(outcome) {
            warn!(job_id = %job.id, error = %err, "could not settle vanished worker");
            return job;
        }
        job.error_message
            .get_or_insert_with(|| VANISHED_MESSAGE.to_string());
        warn!(job_id = %job.id, status = %job.status, "worker process vanished without a final marker");
        job
    }
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use pipewatch_common::{Job, JobStatus};

    use super::{
        LivenessReconciler, ProcessProbe, ProcessState, ScriptedProbe, VANISHED_MESSAGE,
    };
    use crate::{
        catalog::PhaseCatalog,
        launcher::WorkerRegistry,
        state::StateManager,
        store::MemoryJobStore,
        tailer::{LogTailer, MemoryLogReader},
    };

    struct Fixture {
        logs: Arc<MemoryLogReader>,
        state: Arc<StateManager>,
        tailer: Arc<LogTailer>,
    }

    impl Fixture {
        fn new() -> Self {
            let logs = Arc::new(MemoryLogReader::new());
            let state = Arc::new(StateManager::new(Arc::new(MemoryJobStore::new())));
            let tailer = Arc::new(LogTailer::new(
                logs.clone(),
                Arc::new(PhaseCatalog::default()),
                state.clone(),
                0.05,
            ));
            Self {
                logs,
                state,
                tailer,
            }
        }

        fn reconciler(&self, probe: Arc<dyn ProcessProbe>, min_interval: Duration) -> LivenessReconciler {
            LivenessReconciler::new(probe, self.tailer.clone(), self.state.clone(), min_interval, 4)
        }

        async fn job(&self, id: &str, status: JobStatus, pid: u32) -> Job {
            let log = format!("/logs/{id}.log");
            let mut job = Job::new(id, serde_json::Value::Null);
            job.transition(JobStatus::Initializing).unwrap();
            if status != JobStatus::Initializing {
                job.transition(JobStatus::Running).unwrap();
            }
            job.pid = Some(pid);
            job.log_file_path = Some(log.clone().into());
            self.logs.append(log, &format!("Job {id} accepted\n"));
            self.state.set(job).await.unwrap()
        }

        async fn get(&self, id: &str) -> Job {
            self.state.get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn dead_worker_without_marker_fails() {
        let fx = Fixture::new();
        let job = fx.job("a", JobStatus::Running, 10).await;
        let reconciler = fx.reconciler(Arc::new(ScriptedProbe::new()), Duration::ZERO);

        assert_eq!(reconciler.reconcile(&[job]).await.unwrap(), 1);

        let job = fx.get("a").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(VANISHED_MESSAGE));
        assert!(job.end_time.is_some());
        assert_eq!(job.pid, None);
        assert_eq!(fx.tailer.tracked().unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_worker_with_recorded_error_becomes_error() {
        let fx = Fixture::new();
        let mut job = fx.job("a", JobStatus::Running, 10).await;
        job.error_message = Some("Bundesanzeiger fetch failed: HTTP 503".to_string());
        let job = fx.state.set(job).await.unwrap();
        let reconciler = fx.reconciler(Arc::new(ScriptedProbe::new()), Duration::ZERO);

        assert_eq!(reconciler.reconcile(&[job]).await.unwrap(), 1);

        let job = fx.get("a").await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Bundesanzeiger fetch failed: HTTP 503")
        );
        assert!(job.end_time.is_some());
        assert_eq!(job.pid, None);
    }

    #[tokio::test]
    async fn dead_worker_with_unread_completion_completes() {
        let fx = Fixture::new();
        let job = fx.job("a", JobStatus::Running, 10).await;
        fx.logs.append("/logs/a.log", "PROGRESS:integration:main\nPIPELINE_PROCESS_COMPLETED");
        let reconciler = fx.reconciler(Arc::new(ScriptedProbe::new()), Duration::ZERO);

        reconciler.reconcile(&[job]).await.unwrap();

        let job = fx.get("a").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.display_progress(), 1.0);
    }

    #[tokio::test]
    async fn alive_worker_confirms_start() {
        let fx = Fixture::new();
        let initializing = fx.job("a", JobStatus::Initializing, 10).await;
        let running = fx.job("b", JobStatus::Running, 11).await;
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(10, ProcessState::Alive);
        probe.set(11, ProcessState::Alive);
        let reconciler = fx.reconciler(probe, Duration::ZERO);

        assert_eq!(reconciler.reconcile(&[initializing, running]).await.unwrap(), 1);
        assert_eq!(fx.get("a").await.status, JobStatus::Running);
        assert_eq!(fx.get("b").await.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancelled_job_is_not_overwritten() {
        let fx = Fixture::new();
        let snapshot = fx.job("a", JobStatus::Running, 10).await;
        let mut cancelled = snapshot.clone();
        cancelled.transition(JobStatus::Cancelled).unwrap();
        fx.state.set(cancelled).await.unwrap();
        let reconciler = fx.reconciler(Arc::new(ScriptedProbe::new()), Duration::ZERO);

        assert_eq!(reconciler.reconcile(&[snapshot]).await.unwrap(), 0);
        assert_eq!(fx.get("a").await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn reaped_child_is_dead_without_probing() {
        let fx = Fixture::new();
        let job = fx.job("a", JobStatus::Running, 10).await;
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(10, ProcessState::Alive);
        let registry = Arc::new(WorkerRegistry::new());
        registry.started("a", 10);
        registry.reaped("a");
        let reconciler = fx
            .reconciler(probe.clone(), Duration::ZERO)
            .with_registry(registry);

        assert_eq!(reconciler.reconcile(&[job]).await.unwrap(), 1);
        assert_eq!(probe.calls(), 0);
        assert_eq!(fx.get("a").await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn passes_are_debounced() {
        let fx = Fixture::new();
        let job = fx.job("a", JobStatus::Running, 10).await;
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(10, ProcessState::Alive);
        let reconciler = fx.reconciler(probe.clone(), Duration::from_secs(3600));

        reconciler.reconcile(std::slice::from_ref(&job)).await.unwrap();
        reconciler.reconcile(std::slice::from_ref(&job)).await.unwrap();

        assert_eq!(probe.calls(), 1);
    }

    struct SlowProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ProcessProbe for SlowProbe {
        async fn probe(&self, _pid: u32) -> ProcessState {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            ProcessState::Alive
        }
    }

    #[tokio::test]
    async fn probes_run_in_a_bounded_pool() {
        let fx = Fixture::new();
        let mut jobs = Vec::new();
        for pid in 0..10u32 {
            jobs.push(fx.job(&format!("job_{pid}"), JobStatus::Running, 100 + pid).await);
        }
        let probe = Arc::new(SlowProbe {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let reconciler = fx.reconciler(probe.clone(), Duration::ZERO);

        reconciler.reconcile(&jobs).await.unwrap();

        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 4, "peak concurrency was {peak}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn os_probe_sees_current_process() {
        use super::OsProcessProbe;

        assert_eq!(
            OsProcessProbe.probe(std::process::id()).await,
            ProcessState::Alive
        );
        assert_eq!(OsProcessProbe.probe(0).await, ProcessState::Dead);
    }
}
