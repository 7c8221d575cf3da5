use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SandboxConfig, SupervisorCommand};
use crate::supervisor::SuperviseArgs;
use crate::transport::Endpoint;

/// What a launcher task reports back to the worker event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started {
        job_id: Bytes,
        run_id: Uuid,
        pid: Option<u32>,
    },
    SpawnFailed {
        job_id: Bytes,
        run_id: Uuid,
        error: String,
    },
    /// The launcher is done with the supervisor process. `reaped` is false
    /// only when a killed process was still not collected after the last
    /// bounded wait.
    Exited {
        job_id: Bytes,
        run_id: Uuid,
        code: Option<i32>,
        killed: bool,
        reaped: bool,
    },
}

/// Starts one execution supervisor process per job.
///
/// Each launch runs in its own task which owns the `Child`: it writes the
/// job configuration to the supervisor's stdin, reports `Started`, then waits
/// for the process to exit or for the job's cancel token.
#[derive(Debug, Clone)]
pub struct Launcher {
    supervisor: SupervisorCommand,
    callback: Endpoint,
    prefix: PathBuf,
    cache: PathBuf,
    sandbox: SandboxConfig,
    reap_timeout: Duration,
    events: mpsc::Sender<SupervisorEvent>,
}

impl Launcher {
    pub fn new(
        supervisor: SupervisorCommand,
        callback: Endpoint,
        prefix: PathBuf,
        cache: PathBuf,
        sandbox: SandboxConfig,
        reap_timeout: Duration,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            supervisor,
            callback,
            prefix,
            cache,
            sandbox,
            reap_timeout,
            events,
        }
    }

    /// Arguments appended to the configured supervisor command for `job_id`
    pub fn supervise_args(&self, job_id: &[u8]) -> SuperviseArgs {
        SuperviseArgs {
            callback: self.callback.clone(),
            job_id_hex: hex::encode(job_id),
            prefix: self.prefix.clone(),
            cache: self.cache.clone(),
            sandbox: self.sandbox.enabled,
            image: self.sandbox.image.clone(),
            network: self.sandbox.network.clone(),
            memory: self.sandbox.memory_limit.clone(),
            cpus: self.sandbox.cpu_limit.clone(),
        }
    }

    pub fn launch(
        &self,
        job_id: Bytes,
        run_id: Uuid,
        config: Bytes,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move { launcher.run(job_id, run_id, config, cancel).await })
    }

    async fn run(self, job_id: Bytes, run_id: Uuid, config: Bytes, cancel: CancellationToken) {
        let mut command = Command::new(&self.supervisor.program);
        command
            .args(&self.supervisor.args)
            .arg("supervise")
            .args(self.supervise_args(&job_id).to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    job_id = %String::from_utf8_lossy(&job_id),
                    program = %self.supervisor.program.display(),
                    error = %e,
                    "Failed to spawn execution supervisor"
                );
                self.report(SupervisorEvent::SpawnFailed {
                    job_id,
                    run_id,
                    error: e.to_string(),
                })
                .await;
                return;
            }
        };

        // Written from a separate task so a supervisor that never reads its
        // stdin cannot stall the wait below.
        if let Some(mut stdin) = child.stdin.take() {
            let log_id = String::from_utf8_lossy(&job_id).into_owned();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&config).await {
                    tracing::debug!(job_id = %log_id, error = %e, "Configuration not fully written to supervisor");
                }
            });
        }

        let pid = child.id();
        tracing::info!(job_id = %String::from_utf8_lossy(&job_id), pid = ?pid, "Execution supervisor started");
        self.report(SupervisorEvent::Started {
            job_id: job_id.clone(),
            run_id,
            pid,
        })
        .await;

        let (code, killed, reaped) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code(), false, true),
                Err(e) => {
                    tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), error = %e, "Waiting for supervisor failed");
                    (None, false, true)
                }
            },
            _ = cancel.cancelled() => {
                let (code, reaped) = self.terminate(&job_id, &mut child).await;
                (code, true, reaped)
            }
        };

        self.report(SupervisorEvent::Exited {
            job_id,
            run_id,
            code,
            killed,
            reaped,
        })
        .await;
    }

    /// SIGTERM, then SIGKILL once `reap_timeout` passes. Returns the exit
    /// code and whether the process was reaped before the second timeout.
    async fn terminate(&self, job_id: &[u8], child: &mut Child) -> (Option<i32>, bool) {
        if let Some(pid) = child.id() {
            match i32::try_from(pid).map(Pid::from_raw) {
                Ok(pid) => {
                    if let Err(e) = kill(pid, Signal::SIGTERM) {
                        tracing::warn!(%pid, error = %e, "Failed to send SIGTERM to supervisor");
                    }
                }
                Err(e) => tracing::warn!(pid, error = %e, "Supervisor pid out of range"),
            }
            if let Ok(Ok(status)) = tokio::time::timeout(self.reap_timeout, child.wait()).await {
                return (status.code(), true);
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Kill failed");
        }
        match tokio::time::timeout(self.reap_timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), true),
            Ok(Err(e)) => {
                tracing::warn!(job_id = %String::from_utf8_lossy(job_id), error = %e, "Reaping supervisor failed");
                (None, false)
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %String::from_utf8_lossy(job_id),
                    timeout_ms = self.reap_timeout.as_millis() as u64,
                    "Supervisor not reaped in time"
                );
                (None, false)
            }
        }
    }

    async fn report(&self, event: SupervisorEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Worker loop gone, supervisor event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(program: &str, args: &[&str]) -> (Launcher, mpsc::Receiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let launcher = Launcher::new(
            SupervisorCommand {
                program: PathBuf::from(program),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            Endpoint::new("127.0.0.1", 6000),
            PathBuf::from("/opt/prefix"),
            PathBuf::from("/opt/prefix/cache"),
            SandboxConfig::default(),
            Duration::from_secs(2),
            tx,
        );
        (launcher, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no supervisor event")
            .expect("channel closed")
    }

    #[test]
    fn supervise_args_carry_job_and_paths() {
        let (launcher, _rx) = launcher("dispatch-lite", &[]);
        let args = launcher.supervise_args(b"42").to_args();
        let joined = args.join(" ");
        assert!(joined.contains("--callback tcp://127.0.0.1:6000"));
        assert!(joined.contains("--job-id-hex 3432"));
        assert!(joined.contains("--prefix /opt/prefix"));
        assert!(joined.contains("--cache /opt/prefix/cache"));
        assert!(!joined.contains("--sandbox"));
    }

    #[tokio::test]
    async fn reports_start_then_exit_code() {
        let (launcher, mut rx) = launcher("sh", &["-c", "exit 3"]);
        let run_id = Uuid::new_v4();
        launcher.launch(
            Bytes::from_static(b"42"),
            run_id,
            Bytes::from_static(b"{}"),
            CancellationToken::new(),
        );

        assert!(matches!(next(&mut rx).await, SupervisorEvent::Started { run_id: r, .. } if r == run_id));
        assert_eq!(
            next(&mut rx).await,
            SupervisorEvent::Exited {
                job_id: Bytes::from_static(b"42"),
                run_id,
                code: Some(3),
                killed: false,
                reaped: true,
            }
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let (launcher, mut rx) = launcher("/nonexistent/supervisor", &[]);
        launcher.launch(
            Bytes::from_static(b"42"),
            Uuid::new_v4(),
            Bytes::new(),
            CancellationToken::new(),
        );
        assert!(matches!(next(&mut rx).await, SupervisorEvent::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn cancel_kills_and_reaps() {
        let (launcher, mut rx) = launcher("sh", &["-c", "sleep 30"]);
        let cancel = CancellationToken::new();
        launcher.launch(
            Bytes::from_static(b"42"),
            Uuid::new_v4(),
            Bytes::new(),
            cancel.clone(),
        );
        assert!(matches!(next(&mut rx).await, SupervisorEvent::Started { .. }));

        cancel.cancel();
        match next(&mut rx).await {
            SupervisorEvent::Exited {
                killed,
                code,
                reaped,
                ..
            } => {
                assert!(killed);
                assert!(reaped);
                assert_ne!(code, Some(0));
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_sends_sigterm_first() {
        // exits cleanly with its own code only if it sees SIGTERM
        let (launcher, mut rx) = launcher("sh", &["-c", "trap 'exit 7' TERM; while :; do sleep 0.1; done"]);
        let cancel = CancellationToken::new();
        launcher.launch(
            Bytes::from_static(b"42"),
            Uuid::new_v4(),
            Bytes::new(),
            cancel.clone(),
        );
        assert!(matches!(next(&mut rx).await, SupervisorEvent::Started { .. }));
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        cancel.cancel();
        match next(&mut rx).await {
            SupervisorEvent::Exited {
                killed,
                code,
                reaped,
                ..
            } => {
                assert!(killed);
                assert!(reaped);
                assert_eq!(code, Some(7));
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill() {
        let (launcher, mut rx) = launcher("sh", &["-c", "trap '' TERM; while :; do sleep 0.1; done"]);
        let cancel = CancellationToken::new();
        launcher.launch(
            Bytes::from_static(b"42"),
            Uuid::new_v4(),
            Bytes::new(),
            cancel.clone(),
        );
        assert!(matches!(next(&mut rx).await, SupervisorEvent::Started { .. }));
        tokio::time::sleep(Duration::from_millis(300)).await;

        cancel.cancel();
        match next(&mut rx).await {
            SupervisorEvent::Exited { code, reaped, .. } => {
                // killed by signal, so no exit code
                assert_eq!(code, None);
                assert!(reaped);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }
}
