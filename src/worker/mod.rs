//! Worker: executes jobs for one service on behalf of the broker.
//!
//! - **Registration**: connects to the broker, sends READY, heartbeats every
//!   interval and reconnects once the broker has been silent for `liveness`
//!   intervals
//! - **Jobs**: each EXECUTE gets an execution supervisor process started by
//!   the [`Launcher`]; lifecycle replies are RECEIVED, STARTED, then one of
//!   DONE, ERROR or CANCELLED
//! - **Side channel**: supervisors report their result to a router socket
//!   owned by the worker
//!
//! All state lives in the task running [`Worker::run`]; launcher tasks talk
//! back to it over an mpsc channel.

pub mod heartbeat;
pub mod jobs;
pub mod launcher;

pub use heartbeat::BrokerLiveness;
pub use jobs::{ActiveJob, Exit, JobStatus, JobTable};
pub use launcher::{Launcher, SupervisorEvent};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::protocol::{BrokerMessage, JobRequest, Message, Reply, SupervisorReport, WorkerMessage};
use crate::transport::{DealerSocket, Endpoint, RouterEvent, RouterSocket, TransportError};

const EVENT_QUEUE: usize = 256;
/// Replies kept while the broker is unreachable
const OUTBOX_LIMIT: usize = 1024;

pub struct Worker {
    config: WorkerConfig,
    broker: Option<DealerSocket>,
    side: RouterSocket,
    callback: Endpoint,
    jobs: JobTable,
    launcher: Launcher,
    events: mpsc::Receiver<SupervisorEvent>,
    liveness: BrokerLiveness,
    outbox: VecDeque<Message>,
}

impl Worker {
    /// Validate the configuration and bind the side channel. Does not
    /// contact the broker yet.
    pub async fn start(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache).await?;

        let side = match config.sandbox.port_range {
            Some((min, max)) => {
                RouterSocket::bind_in_range(&config.callback_host, min, max, config.limits).await?
            }
            None => {
                let ephemeral = Endpoint::new(config.callback_host.clone(), 0);
                RouterSocket::bind(&ephemeral, config.limits).await?
            }
        };
        let callback = Endpoint::new(config.callback_host.clone(), side.local_addr().port());

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let launcher = Launcher::new(
            config.supervisor.clone(),
            callback.clone(),
            config.prefix.clone(),
            config.cache.clone(),
            config.sandbox.clone(),
            config.reap_timeout(),
            events_tx,
        );

        tracing::info!(
            service = %config.service,
            name = %config.name,
            broker = %config.broker,
            callback = %callback,
            "Worker started"
        );

        Ok(Self {
            liveness: BrokerLiveness::new(config.liveness),
            config,
            broker: None,
            side,
            callback,
            jobs: JobTable::new(),
            launcher,
            events,
            outbox: VecDeque::new(),
        })
    }

    /// Side-channel endpoint handed to execution supervisors
    pub fn callback_endpoint(&self) -> &Endpoint {
        &self.callback
    }

    /// Event loop. On `shutdown` every supervisor is terminated and reaped
    /// before DISCONNECT is sent.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.connect().await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                inbound = recv_from(&mut self.broker) => self.on_broker_inbound(inbound).await,
                event = self.side.recv() => match event {
                    Some(RouterEvent::Message(msg)) => self.on_side_channel(msg).await,
                    Some(RouterEvent::Disconnected(_)) => {}
                    None => {
                        tracing::error!("Side channel closed unexpectedly");
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.on_supervisor_event(event).await,
                _ = heartbeat.tick() => self.on_tick().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn connect(&mut self) {
        self.broker = None;
        let attempt = DealerSocket::connect(&self.config.broker, self.config.limits);
        match tokio::time::timeout(self.config.heartbeat_interval(), attempt).await {
            Ok(Ok(dealer)) => {
                self.broker = Some(dealer);
                self.liveness.record_activity();
                let ready = WorkerMessage::Ready {
                    service: self.config.service.clone(),
                    name: self.config.name.clone(),
                };
                if self.try_send(ready.encode()).await {
                    tracing::info!(
                        broker = %self.config.broker,
                        service = %self.config.service,
                        callback = %self.callback_endpoint(),
                        "Registered with broker"
                    );
                    self.flush_outbox().await;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(broker = %self.config.broker, error = %e, "Broker unreachable, retrying");
            }
            Err(_) => {
                tracing::warn!(broker = %self.config.broker, "Broker connect timed out, retrying");
            }
        }
    }

    async fn on_broker_inbound(&mut self, inbound: Option<std::result::Result<Message, TransportError>>) {
        let msg = match inbound {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Broker connection failed");
                self.broker = None;
                return;
            }
            None => {
                tracing::warn!("Broker closed the connection");
                self.broker = None;
                return;
            }
        };
        self.liveness.record_activity();

        match BrokerMessage::decode(msg) {
            Ok(BrokerMessage::Request { client, request }) => self.on_request(client, request).await,
            Ok(BrokerMessage::Heartbeat) => {}
            Ok(BrokerMessage::Disconnect) => {
                tracing::info!("Broker asked for reconnect");
                self.connect().await;
            }
            Err(e) => tracing::debug!(error = %e, "Dropping invalid broker message"),
        }
    }

    async fn on_request(&mut self, client: Bytes, request: JobRequest) {
        match request {
            JobRequest::Execute { job_id, config } => self.on_execute(client, job_id, config).await,
            JobRequest::Cancel { job_id } => self.on_cancel(client, job_id).await,
        }
    }

    async fn on_execute(&mut self, client: Bytes, job_id: Bytes, config: Bytes) {
        if self.jobs.contains(&job_id) {
            tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), "Job already running");
            let reply = Reply::already_running(&job_id);
            self.send_reply(client, job_id, reply).await;
            return;
        }

        let algorithm = match serde_json::from_slice::<serde_json::Value>(&config) {
            Ok(value) => value
                .get("algorithm")
                .and_then(|a| a.as_str())
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), error = %e, "Rejecting job with invalid configuration");
                let reply = Reply::job_error(job_id.clone(), format!("Invalid job configuration: {}", e));
                self.send_reply(client, job_id, reply).await;
                return;
            }
        };

        let mut job = ActiveJob::new(job_id.clone(), client.clone(), algorithm);
        job.task = Some(
            self.launcher
                .launch(job_id.clone(), job.run_id, config, job.cancel.clone()),
        );
        tracing::info!(
            job_id = %String::from_utf8_lossy(&job_id),
            algorithm = ?job.algorithm,
            "Job received"
        );
        self.jobs.insert(job);

        let reply = Reply::Received {
            job_id: job_id.clone(),
        };
        self.send_reply(client, job_id, reply).await;
    }

    async fn on_cancel(&mut self, client: Bytes, job_id: Bytes) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            tracing::info!(job_id = %String::from_utf8_lossy(&job_id), "Cancel for unknown job");
            let reply = Reply::unknown_job(&job_id);
            self.send_reply(client, job_id, reply).await;
            return;
        };

        if job.request_cancel(client) {
            tracing::info!(job_id = %String::from_utf8_lossy(&job_id), "Cancelling job");
        }
        if job.exit.is_some() {
            self.finish_cancel(&job_id).await;
        }
    }

    /// The launcher is done with the supervisor: answer every CANCEL.
    async fn finish_cancel(&mut self, job_id: &Bytes) {
        let Some(job) = self.jobs.remove(job_id) else {
            return;
        };
        let reply = job.cancel_reply();
        match &reply {
            Reply::Cancelled { .. } => {
                tracing::info!(job_id = %String::from_utf8_lossy(job_id), "Job cancelled");
            }
            _ => {
                tracing::error!(job_id = %String::from_utf8_lossy(job_id), "Cancelled job left an unreaped supervisor");
            }
        }
        for recipient in job.cancel_recipients() {
            self.send_reply(recipient, job_id.clone(), reply.clone()).await;
        }
    }

    async fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Started { job_id, run_id, pid } => {
                let Some(job) = self.jobs.run_mut(&job_id, run_id) else {
                    return;
                };
                if job.started || job.is_cancelling() {
                    return;
                }
                job.started = true;
                let client = job.client.clone();
                tracing::debug!(job_id = %String::from_utf8_lossy(&job_id), pid = ?pid, "Job started");
                let reply = Reply::Started {
                    job_id: job_id.clone(),
                };
                self.send_reply(client, job_id, reply).await;
            }
            SupervisorEvent::SpawnFailed {
                job_id,
                run_id,
                error,
            } => {
                let Some(job) = self.jobs.run_mut(&job_id, run_id) else {
                    return;
                };
                if job.is_cancelling() {
                    job.exit = Some(Exit {
                        at: Instant::now(),
                        code: None,
                        reaped: true,
                    });
                    self.finish_cancel(&job_id).await;
                    return;
                }
                let client = job.client.clone();
                self.jobs.remove(&job_id);
                let reply = Reply::job_error(
                    job_id.clone(),
                    format!("Failed to start execution supervisor: {}", error),
                );
                self.send_reply(client, job_id, reply).await;
            }
            SupervisorEvent::Exited {
                job_id,
                run_id,
                code,
                killed,
                reaped,
            } => {
                let Some(job) = self.jobs.run_mut(&job_id, run_id) else {
                    return;
                };
                job.exit = Some(Exit {
                    at: Instant::now(),
                    code,
                    reaped,
                });
                tracing::debug!(job_id = %String::from_utf8_lossy(&job_id), code = ?code, killed, reaped, "Execution supervisor exited");
                if job.is_cancelling() {
                    self.finish_cancel(&job_id).await;
                }
            }
        }
    }

    async fn on_side_channel(&mut self, mut msg: Message) {
        msg.pop_front();
        let report = match SupervisorReport::decode(msg) {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping invalid side-channel message");
                return;
            }
        };
        let job_id = report.job_id().clone();

        let Some(job) = self.jobs.get_mut(&job_id) else {
            tracing::debug!(job_id = %String::from_utf8_lossy(&job_id), "Result for unknown job dropped");
            return;
        };
        if job.is_cancelling() {
            tracing::debug!(job_id = %String::from_utf8_lossy(&job_id), "Result suppressed, job is being cancelled");
            return;
        }
        let announce_start = !job.started;
        let client = job.client.clone();
        let age = job.age(Utc::now());
        self.jobs.remove(&job_id);

        if announce_start {
            let reply = Reply::Started {
                job_id: job_id.clone(),
            };
            self.send_reply(client.clone(), job_id.clone(), reply).await;
        }

        let reply = match report {
            SupervisorReport::Done { payload, .. } => {
                tracing::info!(
                    job_id = %String::from_utf8_lossy(&job_id),
                    elapsed_ms = age.num_milliseconds(),
                    "Job done"
                );
                Reply::Done {
                    job_id: job_id.clone(),
                    result: payload,
                }
            }
            SupervisorReport::Error { payload, .. } => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), error = %message, "Job failed");
                Reply::job_error(job_id.clone(), message)
            }
        };
        self.send_reply(client, job_id, reply).await;
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        for job_id in self.jobs.overdue(now, self.config.exit_grace()) {
            let Some(job) = self.jobs.remove(&job_id) else {
                continue;
            };
            let code = job.exit.and_then(|exit| exit.code);
            tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), code = ?code, "Execution supervisor exited without a result");
            let message = match code {
                Some(code) => format!("Execution supervisor exited without result (exit code {})", code),
                None => "Execution supervisor exited without result".to_string(),
            };
            let reply = Reply::job_error(job_id.clone(), message);
            self.send_reply(job.client, job_id, reply).await;
        }

        if self.broker.is_none() {
            self.connect().await;
            return;
        }
        if self.liveness.tick() {
            tracing::warn!(
                intervals = self.config.liveness,
                "Broker silent, reconnecting"
            );
            self.connect().await;
            return;
        }
        self.try_send(WorkerMessage::Heartbeat.encode()).await;
        self.flush_outbox().await;
    }

    async fn shutdown(&mut self) {
        let jobs = self.jobs.reset();
        tracing::info!(jobs = jobs.len(), "Worker shutting down");

        self.events.close();
        let now = Utc::now();
        for job in &jobs {
            tracing::info!(
                job_id = %String::from_utf8_lossy(&job.job_id),
                status = %job.status(),
                age_ms = job.age(now).num_milliseconds(),
                "Abandoning job"
            );
            job.cancel.cancel();
        }
        let tasks: Vec<_> = jobs.into_iter().filter_map(|job| job.task).collect();
        let grace = self.config.reap_timeout() * 2 + Duration::from_secs(1);
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Some execution supervisors were not reaped before shutdown");
        }

        if self.try_send(WorkerMessage::Disconnect.encode()).await {
            tracing::info!("Disconnected from broker");
        }
    }

    async fn send_reply(&mut self, client: Bytes, job_id: Bytes, reply: Reply) {
        tracing::debug!(
            job_id = %String::from_utf8_lossy(&job_id),
            status = %reply.command(),
            "Sending status"
        );
        let msg = WorkerMessage::Reply {
            client,
            job_id,
            reply,
        }
        .encode();

        if self.outbox.is_empty() && self.try_send(msg.clone()).await {
            return;
        }
        if self.outbox.len() >= OUTBOX_LIMIT {
            tracing::warn!(limit = OUTBOX_LIMIT, "Outbox full, dropping oldest reply");
            self.outbox.pop_front();
        }
        self.outbox.push_back(msg);
        self.flush_outbox().await;
    }

    async fn flush_outbox(&mut self) {
        while let Some(msg) = self.outbox.pop_front() {
            if !self.try_send(msg.clone()).await {
                self.outbox.push_front(msg);
                break;
            }
        }
    }

    async fn try_send(&mut self, msg: Message) -> bool {
        let Some(dealer) = self.broker.as_mut() else {
            return false;
        };
        match dealer.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(broker = %dealer.endpoint(), error = %e, "Send to broker failed");
                self.broker = None;
                false
            }
        }
    }
}

async fn recv_from(
    broker: &mut Option<DealerSocket>,
) -> Option<std::result::Result<Message, TransportError>> {
    match broker {
        Some(dealer) => dealer.recv().await,
        None => std::future::pending().await,
    }
}
