use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::SandboxConfig;

/// Captured output is cut to this many bytes per stream.
const MAX_CAPTURE: usize = 1024 * 1024;

/// Path of the configuration inside the sandbox container
const CONTAINER_JOB_DIR: &str = "/job";
const CONTAINER_ALGORITHMS_DIR: &str = "/algorithms";

/// The parts of a job configuration the supervisor acts on. Every other
/// field is passed to the computation untouched through the stored file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub algorithm: Option<String>,
    /// Shell command run instead of an installed algorithm
    pub command: Option<String>,
    pub timeout_in_minutes: Option<f64>,
    /// Container image overriding the sandbox default
    pub environment: Option<String>,
}

impl JobSpec {
    pub fn parse(config: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(config).map_err(|e| format!("Invalid job configuration: {}", e))
    }

    pub fn timeout(&self) -> Result<Option<Duration>, String> {
        match self.timeout_in_minutes {
            None => Ok(None),
            Some(minutes) if minutes.is_finite() && minutes > 0.0 => {
                Duration::try_from_secs_f64(minutes * 60.0)
                    .map(Some)
                    .map_err(|_| format!("Invalid timeout_in_minutes: {}", minutes))
            }
            Some(minutes) => Err(format!("Invalid timeout_in_minutes: {}", minutes)),
        }
    }
}

/// What to run for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Computation {
    Shell(String),
    Algorithm { name: String, path: PathBuf },
}

impl Computation {
    /// `command` wins over `algorithm`; algorithms live in `<prefix>/algorithms`.
    pub fn resolve(spec: &JobSpec, prefix: &Path) -> Result<Self, String> {
        if let Some(command) = &spec.command {
            return Ok(Computation::Shell(command.clone()));
        }
        let Some(name) = &spec.algorithm else {
            return Err("Job configuration names neither command nor algorithm".to_string());
        };
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(format!("Invalid algorithm name: {:?}", name));
        }
        let path = prefix.join("algorithms").join(name);
        if !path.is_file() {
            return Err(format!("Unknown algorithm: {}", name));
        }
        Ok(Computation::Algorithm {
            name: name.clone(),
            path,
        })
    }
}

/// Result of one computation, serialized as the JOB_DONE payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub statistics: ExecutionStatistics,
    pub system_error: Option<String>,
    pub user_error: Option<String>,
}

/// Resource usage of one computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub started_at: DateTime<Utc>,
    /// Wall-clock time from spawn until the process was collected
    pub duration_secs: f64,
}

impl ExecutionStatistics {
    fn measure(started_at: DateTime<Utc>, clock: Instant) -> Self {
        Self {
            started_at,
            duration_secs: clock.elapsed().as_secs_f64(),
        }
    }
}

/// Everything needed to start a computation.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub computation: Computation,
    pub job_dir: PathBuf,
    pub config_path: PathBuf,
    pub prefix: PathBuf,
    pub sandbox: SandboxConfig,
    pub image: String,
    pub container_name: String,
}

impl ExecutionPlan {
    /// `docker run` arguments for a sandboxed computation.
    ///
    /// The container gets:
    /// - Network isolation unless a network is configured
    /// - Dropped capabilities and no new privileges
    /// - Read-only root filesystem with the job directory mounted writable
    /// - Memory and CPU limits
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", self.container_name),
        ];

        match &self.sandbox.network {
            Some(network) => args.push(format!("--network={}", network)),
            None => args.push("--network=none".to_string()),
        }
        if let Some(ref limit) = self.sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(format!("--volume={}:{}", self.job_dir.display(), CONTAINER_JOB_DIR));
        args.push(format!(
            "--volume={}:{}:ro",
            self.prefix.join("algorithms").display(),
            CONTAINER_ALGORITHMS_DIR
        ));
        let container_config = format!("{}/configuration.json", CONTAINER_JOB_DIR);
        args.push(format!("--env=DISPATCH_CONFIG={}", container_config));
        args.push(format!("--workdir={}", CONTAINER_JOB_DIR));

        args.push(self.image.clone());
        match &self.computation {
            Computation::Shell(command) => {
                args.push("sh".to_string());
                args.push("-c".to_string());
                args.push(command.clone());
            }
            Computation::Algorithm { name, .. } => {
                args.push(format!("{}/{}", CONTAINER_ALGORITHMS_DIR, name));
                args.push(container_config);
            }
        }
        args
    }

    pub fn command(&self) -> Command {
        let mut command = if self.sandbox.enabled {
            let mut docker = Command::new("docker");
            docker.args(self.docker_args());
            docker
        } else {
            let mut local = match &self.computation {
                Computation::Shell(script) => {
                    let mut sh = Command::new("sh");
                    sh.arg("-c").arg(script);
                    sh
                }
                Computation::Algorithm { path, .. } => {
                    let mut algorithm = Command::new(path);
                    algorithm.arg(&self.config_path);
                    algorithm
                }
            };
            local
                .current_dir(&self.job_dir)
                .env("DISPATCH_CONFIG", &self.config_path);
            local
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run to completion or until `timeout`. `Err` means the computation
    /// could not be started at all.
    pub async fn execute(&self, timeout: Option<Duration>) -> Result<ExecutionSummary, String> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let child = self
            .command()
            .spawn()
            .map_err(|e| format!("Failed to start computation: {}", e))?;

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = limit.as_secs(),
                        "Computation timed out, killed"
                    );
                    self.remove_container().await;
                    return Ok(ExecutionSummary {
                        status: None,
                        stdout: String::new(),
                        stderr: String::new(),
                        timed_out: true,
                        statistics: ExecutionStatistics::measure(started_at, clock),
                        system_error: None,
                        user_error: Some(format!(
                            "Computation timed out after {} seconds",
                            limit.as_secs()
                        )),
                    });
                }
            },
            None => child.wait_with_output().await,
        };

        Ok(Self::summarize(
            output,
            ExecutionStatistics::measure(started_at, clock),
        ))
    }

    fn summarize(
        result: std::io::Result<std::process::Output>,
        statistics: ExecutionStatistics,
    ) -> ExecutionSummary {
        match result {
            Ok(output) => {
                let stdout = capture(&output.stdout);
                let stderr = capture(&output.stderr);
                let status = output.status.code();

                let user_error = if output.status.success() {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", status))
                } else {
                    Some(stderr.clone())
                };

                tracing::info!(
                    status = ?status,
                    duration_secs = statistics.duration_secs,
                    "Computation finished"
                );

                ExecutionSummary {
                    status,
                    stdout,
                    stderr,
                    timed_out: false,
                    statistics,
                    system_error: None,
                    user_error,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Collecting computation output failed");
                ExecutionSummary {
                    status: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                    statistics,
                    system_error: Some(e.to_string()),
                    user_error: None,
                }
            }
        }
    }

    /// Stop the sandbox container, if any. Killing the `docker run` client
    /// does not stop the container itself.
    pub async fn remove_container(&self) {
        if !self.sandbox.enabled {
            return;
        }
        let removed = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = removed {
            tracing::warn!(container = %self.container_name, error = %e, "Failed to remove container");
        }
    }
}

fn capture(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_CAPTURE);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
