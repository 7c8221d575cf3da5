//! Execution supervisor: the process a worker starts for each job.
//!
//! Launched as `dispatch-lite supervise ...` with the job configuration on
//! stdin. It stores the configuration under the job's cache directory, runs
//! the computation (optionally inside a Docker sandbox) and reports the
//! outcome to the worker's side channel as `JOB_DONE` (the computation ran,
//! whatever its exit status) or `JOB_ERROR` (it could not be run).
//!
//! On SIGTERM the computation is stopped and nothing is reported; the worker
//! answers the cancel itself once this process is reaped.

pub mod execution;

pub use execution::{Computation, ExecutionPlan, ExecutionStatistics, ExecutionSummary, JobSpec};

use std::path::PathBuf;

use bytes::Bytes;
use clap::Args;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{DispatchError, Result};
use crate::protocol::SupervisorReport;
use crate::transport::{DealerSocket, Endpoint, FrameLimits};

/// Arguments of the hidden `supervise` subcommand.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SuperviseArgs {
    /// Worker side-channel endpoint to report to
    #[arg(long)]
    pub callback: Endpoint,

    /// Job id, hex encoded
    #[arg(long)]
    pub job_id_hex: String,

    /// Installation prefix holding `algorithms/`
    #[arg(long)]
    pub prefix: PathBuf,

    /// Job scratch area
    #[arg(long)]
    pub cache: PathBuf,

    /// Run the computation in a Docker container
    #[arg(long)]
    pub sandbox: bool,

    /// Default container image
    #[arg(long, default_value = "alpine:latest")]
    pub image: String,

    /// Container network (none when absent)
    #[arg(long)]
    pub network: Option<String>,

    /// Container memory limit
    #[arg(long)]
    pub memory: Option<String>,

    /// Container CPU limit
    #[arg(long)]
    pub cpus: Option<String>,
}

impl SuperviseArgs {
    /// Command-line form, the inverse of parsing
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--callback".to_string(),
            self.callback.to_string(),
            "--job-id-hex".to_string(),
            self.job_id_hex.clone(),
            "--prefix".to_string(),
            self.prefix.display().to_string(),
            "--cache".to_string(),
            self.cache.display().to_string(),
        ];
        if self.sandbox {
            args.push("--sandbox".to_string());
        }
        args.push("--image".to_string());
        args.push(self.image.clone());
        for (flag, value) in [
            ("--network", &self.network),
            ("--memory", &self.memory),
            ("--cpus", &self.cpus),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        args
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            enabled: self.sandbox,
            image: self.image.clone(),
            network: self.network.clone(),
            port_range: None,
            memory_limit: self.memory.clone(),
            cpu_limit: self.cpus.clone(),
        }
    }

    pub fn job_dir(&self) -> PathBuf {
        self.cache.join("jobs").join(&self.job_id_hex)
    }
}

/// Entry point of `dispatch-lite supervise`.
pub async fn run(args: SuperviseArgs) -> Result<()> {
    let job_id = hex::decode(&args.job_id_hex)
        .map(Bytes::from)
        .map_err(|e| DispatchError::Config(format!("invalid --job-id-hex: {}", e)))?;

    let mut sigterm = signal(SignalKind::terminate())?;

    let mut config = Vec::new();
    tokio::io::stdin().read_to_end(&mut config).await?;

    let mut reporter = DealerSocket::connect(&args.callback, FrameLimits::default()).await?;

    let report = tokio::select! {
        report = supervise(&args, job_id.clone(), Bytes::from(config)) => report,
        _ = sigterm.recv() => {
            tracing::info!(job_id = %args.job_id_hex, "Terminated, computation stopped");
            if args.sandbox {
                stop_container(&args, &job_id).await;
            }
            return Ok(());
        }
    };

    tracing::debug!(job_id = %args.job_id_hex, callback = %reporter.endpoint(), "Reporting to worker");
    reporter.send(report.encode()).await?;
    Ok(())
}

/// Store the configuration, run the computation and build the report.
pub async fn supervise(args: &SuperviseArgs, job_id: Bytes, config: Bytes) -> SupervisorReport {
    match prepare_and_execute(args, &job_id, &config).await {
        Ok(summary) => match serde_json::to_vec(&summary) {
            Ok(payload) => SupervisorReport::Done {
                job_id,
                payload: Bytes::from(payload),
            },
            Err(e) => SupervisorReport::Error {
                job_id,
                payload: Bytes::from(format!("Failed to encode execution summary: {}", e)),
            },
        },
        Err(message) => {
            tracing::warn!(job_id = %args.job_id_hex, error = %message, "Job could not be run");
            SupervisorReport::Error {
                job_id,
                payload: Bytes::from(message),
            }
        }
    }
}

async fn prepare_and_execute(
    args: &SuperviseArgs,
    job_id: &[u8],
    config: &[u8],
) -> std::result::Result<ExecutionSummary, String> {
    let job_dir = args.job_dir();
    tokio::fs::create_dir_all(&job_dir)
        .await
        .map_err(|e| format!("Failed to create {}: {}", job_dir.display(), e))?;
    let config_path = job_dir.join("configuration.json");
    tokio::fs::write(&config_path, config)
        .await
        .map_err(|e| format!("Failed to store configuration: {}", e))?;

    let spec = JobSpec::parse(config)?;
    let timeout = spec.timeout()?;
    let computation = Computation::resolve(&spec, &args.prefix)?;

    let sandbox = args.sandbox_config();
    let plan = ExecutionPlan {
        computation,
        job_dir,
        config_path,
        prefix: args.prefix.clone(),
        image: spec.environment.clone().unwrap_or_else(|| sandbox.image.clone()),
        sandbox,
        container_name: container_name(job_id),
    };

    tracing::info!(
        job_id = %String::from_utf8_lossy(job_id),
        algorithm = ?spec.algorithm,
        sandboxed = plan.sandbox.enabled,
        "Running computation"
    );
    plan.execute(timeout).await
}

fn container_name(job_id: &[u8]) -> String {
    let run = Uuid::new_v4().simple().to_string();
    format!("dispatch-{}-{}", hex::encode(job_id), &run[..8])
}

async fn stop_container(args: &SuperviseArgs, job_id: &[u8]) {
    let prefix = format!("dispatch-{}-", hex::encode(job_id));
    let listed = tokio::process::Command::new("docker")
        .args(["ps", "--quiet", "--filter", &format!("name={}", prefix)])
        .output()
        .await;
    match listed {
        Ok(output) => {
            for id in String::from_utf8_lossy(&output.stdout).split_whitespace() {
                let removed = tokio::process::Command::new("docker")
                    .args(["rm", "-f", id])
                    .output()
                    .await;
                if let Err(e) = removed {
                    tracing::warn!(job_id = %args.job_id_hex, container = id, error = %e, "Failed to remove container");
                }
            }
        }
        Err(e) => tracing::warn!(job_id = %args.job_id_hex, error = %e, "Failed to list containers"),
    }
}
