use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use pipewatch_common::{
    Job, JobStatus, StatusUpdate,
    error::{PipewatchError, Result},
    time,
};
use serde::Deserialize;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    process::Command,
    sync::mpsc,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::WorkerCommand, state::StateManager};

pub const STARTING_PHASE: &str = "Starting Pipeline";
pub const INITIALIZING_PHASE: &str = "Initializing";
pub const LAUNCH_FAILED_PHASE: &str = "Launch failed";

pub const ENV_JOB_ID: &str = "PIPEWATCH_JOB_ID";
pub const ENV_LOG_FILE: &str = "PIPEWATCH_LOG_FILE";
pub const ENV_OUTPUT_DIR: &str = "PIPEWATCH_OUTPUT_DIR";
pub const ENV_CONFIG: &str = "PIPEWATCH_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub config: serde_json::Value,
    /// Appended to the configured worker arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputFile>,
}

/// `job_<YYYYmmdd_HHMMSS>_<8 hex>`.
pub fn generate_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "job_{}_{}",
        time::format_job_stamp(&time::now()),
        &suffix[..8]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerSlot {
    Running(u32),
    Exited(u32),
}

/// Children started by this controller, keyed by job id. A supervisor marks
/// its child exited once it has been reaped, so liveness can settle the job
/// without probing a pid the OS may already have reused.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, WorkerSlot>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self, job_id: &str, pid: u32) {
        match self.workers.lock() {
            Ok(mut workers) => {
                workers.insert(job_id.to_string(), WorkerSlot::Running(pid));
            }
            Err(_) => warn!(job_id = %job_id, "worker registry poisoned"),
        }
    }

    pub fn reaped(&self, job_id: &str) {
        if let Ok(mut workers) = self.workers.lock()
            && let Some(slot) = workers.get_mut(job_id)
            && let WorkerSlot::Running(pid) = *slot
        {
            *slot = WorkerSlot::Exited(pid);
        }
    }

    /// `true` once the child with this pid was reaped.
    pub fn has_exited(&self, job_id: &str, pid: u32) -> bool {
        self.workers
            .lock()
            .map(|workers| workers.get(job_id) == Some(&WorkerSlot::Exited(pid)))
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.workers
            .lock()
            .map(|workers| {
                workers
                    .values()
                    .filter(|slot| matches!(slot, WorkerSlot::Running(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drops exited children whose job is no longer in `active`.
    pub fn prune<'a>(&self, active: impl IntoIterator<Item = &'a str>) {
        let active = active.into_iter().collect::<HashSet<_>>();
        if let Ok(mut workers) = self.workers.lock() {
            workers.retain(|id, slot| {
                matches!(slot, WorkerSlot::Running(_)) || active.contains(id.as_str())
            });
        }
    }
}

/// Starts each job as its own OS process with stdout and stderr appended to
/// the job log. A supervisor task per child reaps it on exit.
pub struct WorkerLauncher {
    worker: WorkerCommand,
    log_dir: PathBuf,
    output_dir: PathBuf,
    input_dir: PathBuf,
    state: Arc<StateManager>,
    status_tx: mpsc::Sender<StatusUpdate>,
    registry: Arc<WorkerRegistry>,
}

impl WorkerLauncher {
    pub fn new(
        worker: WorkerCommand,
        log_dir: PathBuf,
        output_dir: PathBuf,
        input_dir: PathBuf,
        state: Arc<StateManager>,
        status_tx: mpsc::Sender<StatusUpdate>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            worker,
            log_dir,
            output_dir,
            input_dir,
            state,
            status_tx,
            registry,
        }
    }

    /// Creates the job record, writes the first log line and spawns the
    /// worker. Returns without waiting for the worker.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Job> {
        for input in &request.inputs {
            validate_input_name(&input.name)?;
        }

        let id = generate_job_id();
        let log_path = self.log_dir.join(format!("pipeline_{id}.log"));
        let output_dir = self.output_dir.join(&id);
        fs::create_dir_all(&self.log_dir).await?;
        fs::create_dir_all(&output_dir).await?;

        let mut job = Job::new(id.clone(), request.config);
        job.transition(JobStatus::Initializing)?;
        job.phase = INITIALIZING_PHASE.to_string();
        job.log_file_path = Some(log_path.clone());
        job.output_dir = Some(output_dir.clone());
        job.input_artifacts = self.write_inputs(&id, &request.inputs).await?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        log.write_all(format!("Job {id} accepted\n").as_bytes())
            .await?;
        log.flush().await?;
        let mut job = self.state.set(job).await?;
        info!(job_id = %id, log = %log_path.display(), "job accepted");

        let config_json = serde_json::to_string(&job.config).map_err(|err| {
            PipewatchError::InternalError(format!("failed to serialize config for {id}: {err}"))
        })?;
        let stdout = log.into_std().await;
        let stderr = stdout.try_clone()?;

        let spawned = Command::new(&self.worker.program)
            .args(&self.worker.args)
            .args(&request.args)
            .env(ENV_JOB_ID, &id)
            .env(ENV_LOG_FILE, &log_path)
            .env(ENV_OUTPUT_DIR, &output_dir)
            .env(ENV_CONFIG, config_json)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let message = format!(
                    "failed to start worker {}: {err}",
                    self.worker.program.display()
                );
                warn!(job_id = %id, error = %err, "worker spawn failed");
                job.error_message = Some(message.clone());
                job.phase = LAUNCH_FAILED_PHASE.to_string();
                job.transition(JobStatus::Error)?;
                self.state.set(job).await?;
                return Err(PipewatchError::Launch(message));
            }
        };

        job.pid = child.id();
        let job = self.state.set(job).await?;
        if let Some(pid) = job.pid {
            self.registry.started(&id, pid);
        }

        let registry = Arc::clone(&self.registry);
        let supervised_id = id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(job_id = %supervised_id, status = %status, "worker exited"),
                Err(err) => warn!(job_id = %supervised_id, error = %err, "failed to wait for worker"),
            }
            registry.reaped(&supervised_id);
        });

        let started = StatusUpdate {
            status: Some(JobStatus::Running),
            phase: Some(STARTING_PHASE.to_string()),
            log_file_path: Some(log_path),
            ..StatusUpdate::for_job(id.clone())
        };
        if let Err(err) = self.status_tx.try_send(started) {
            warn!(job_id = %id, error = %err, "status channel rejected start update");
        }

        Ok(job)
    }

    pub fn status_sender(&self) -> mpsc::Sender<StatusUpdate> {
        self.status_tx.clone()
    }

    /// Workers this controller still supervises.
    pub fn live_count(&self) -> usize {
        self.registry.live_count()
    }

    async fn write_inputs(&self, id: &str, inputs: &[InputFile]) -> Result<Vec<PathBuf>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.input_dir.join(id);
        fs::create_dir_all(&dir).await?;

        let mut paths = Vec::with_capacity(inputs.len());
        for input in inputs {
            let path = dir.join(&input.name);
            fs::write(&path, input.content.as_bytes()).await?;
            paths.push(path);
        }
        Ok(paths)
    }
}

fn validate_input_name(name: &str) -> Result<()> {
    let plain = Path::new(name)
        .file_name()
        .is_some_and(|file_name| file_name == name);
    if name.is_empty() || name == "." || name == ".." || !plain || name.contains(['/', '\\']) {
        return Err(PipewatchError::InvalidArgument(format!(
            "invalid input file name '{name}'"
        )));
    }
    Ok(())
}

/// Sends SIGTERM to `pid`. Returns `false` when the process was already gone.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<bool> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| PipewatchError::InvalidArgument(format!("pid {pid} out of range")))?;
    if raw <= 0 {
        return Err(PipewatchError::InvalidArgument(format!(
            "refusing to signal pid {pid}"
        )));
    }

    // Safety: plain kill(2) on a single positive pid.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err.into())
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<bool> {
    Err(PipewatchError::InternalError(format!(
        "cannot signal pid {pid} on this platform"
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pipewatch_common::JobStatus;
    use tokio::sync::mpsc;

    use super::{
        InputFile, LaunchRequest, WorkerLauncher, WorkerRegistry, generate_job_id,
        validate_input_name,
    };
    use crate::{
        config::WorkerCommand,
        state::StateManager,
        store::{JobStore, MemoryJobStore},
    };

    #[test]
    fn job_ids_carry_stamp_and_suffix() {
        let id = generate_job_id();
        let parts = id.split('_').collect::<Vec<_>>();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "job");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_job_id(), id);
    }

    #[test]
    fn input_names_must_be_plain_files() {
        assert!(validate_input_name("companies.csv").is_ok());
        assert!(validate_input_name("../etc/passwd").is_err());
        assert!(validate_input_name("a/b.csv").is_err());
        assert!(validate_input_name("..").is_err());
        assert!(validate_input_name("").is_err());
    }

    #[test]
    fn registry_tracks_reaped_children() {
        let registry = WorkerRegistry::new();
        registry.started("job_a", 41);
        registry.started("job_b", 42);
        assert_eq!(registry.live_count(), 2);
        assert!(!registry.has_exited("job_a", 41));

        registry.reaped("job_a");
        assert!(registry.has_exited("job_a", 41));
        assert!(!registry.has_exited("job_a", 99));
        assert_eq!(registry.live_count(), 1);

        registry.prune(["job_a"]);
        assert!(registry.has_exited("job_a", 41));
        registry.prune(std::iter::empty());
        assert!(!registry.has_exited("job_a", 41));
        assert_eq!(registry.live_count(), 1);
    }

    fn launcher(
        dir: &std::path::Path,
        worker: WorkerCommand,
        store: Arc<MemoryJobStore>,
    ) -> (WorkerLauncher, mpsc::Receiver<pipewatch_common::StatusUpdate>) {
        let (tx, rx) = mpsc::channel(8);
        let launcher = WorkerLauncher::new(
            worker,
            dir.join("logs"),
            dir.join("output"),
            dir.join("input"),
            Arc::new(StateManager::new(store)),
            tx,
            Arc::new(WorkerRegistry::new()),
        );
        (launcher, rx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_writes_first_line_and_announces_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let worker = WorkerCommand::new("/bin/sh").with_args(["-c", "echo \"worker $PIPEWATCH_JOB_ID\""]);
        let (launcher, mut rx) = launcher(dir.path(), worker, store.clone());

        let job = launcher
            .launch(LaunchRequest {
                config: serde_json::json!({"category": "maschinenbau"}),
                inputs: vec![InputFile {
                    name: "companies.csv".to_string(),
                    content: "name\nACME\n".to_string(),
                }],
                ..LaunchRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Initializing);
        assert!(job.pid.is_some());
        let log_path = job.log_file_path.clone().unwrap();
        assert!(log_path.ends_with(format!("pipeline_{}.log", job.id)));
        let log = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(log.starts_with(&format!("Job {} accepted\n", job.id)));
        assert_eq!(
            tokio::fs::read_to_string(&job.input_artifacts[0]).await.unwrap(),
            "name\nACME\n"
        );
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().pid, job.pid);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.job_id, job.id);
        assert_eq!(update.status, Some(JobStatus::Running));
        assert_eq!(update.log_file_path, Some(log_path));
    }

    #[tokio::test]
    async fn spawn_failure_errors_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let worker = WorkerCommand::new(dir.path().join("no-such-worker"));
        let (launcher, _rx) = launcher(dir.path(), worker, store.clone());

        let err = launcher.launch(LaunchRequest::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "LaunchFailed");

        let jobs = store.list_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert!(jobs[0].error_message.is_some());
        assert_eq!(launcher.live_count(), 0);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let (launcher, _rx) = launcher(dir.path(), WorkerCommand::default(), store.clone());

        let result = launcher
            .launch(LaunchRequest {
                inputs: vec![InputFile {
                    name: "../escape.csv".to_string(),
                    content: String::new(),
                }],
                ..LaunchRequest::default()
            })
            .await;

        assert!(result.is_err());
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
