use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use pipewatch_jobs::{JobSys, JobSysConfig, WorkerCommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipewatch", about = "Supervisor for long-running pipeline worker processes")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    /// Overrides PIPEWATCH_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// JSON phase catalog replacing the built-in one.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Worker program started for each job. Overrides PIPEWATCH_WORKER.
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Argument passed to the worker program; repeatable.
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl Cli {
    fn job_config(&self) -> Result<JobSysConfig, Box<dyn std::error::Error>> {
        let mut config = JobSysConfig::from_env()?;
        if let Some(data_dir) = &self.data_dir {
            config.set_data_dir(data_dir);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(catalog) = &self.catalog {
            config.catalog_path = Some(catalog.clone());
        }
        if let Some(worker) = &self.worker {
            config.worker = WorkerCommand::new(worker).with_args(self.worker_args.iter().cloned());
        } else if !self.worker_args.is_empty() {
            config.worker.args = self.worker_args.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env()
        .add_directive("pipewatch=info".parse()?)
        .add_directive("tower_http=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = cli.job_config()?;
    info!(
        data_dir = %config.data_dir.display(),
        worker = %config.worker.program.display(),
        poll_interval_secs = config.poll_interval.as_secs(),
        "starting job controller"
    );
    let jobs = Arc::new(JobSys::new(config).await?);
    Arc::clone(&jobs).start_polling_loop();
    info!("job polling loop enabled");

    let app = pipewatch_api::api_router(jobs);
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("pipewatch listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
