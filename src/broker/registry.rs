use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{BrokerMessage, JobRequest, Message, Reply, ServiceReply};

/// Worker availability as seen by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Ready,
    Busy,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Ready => write!(f, "ready"),
            WorkerState::Busy => write!(f, "busy"),
        }
    }
}

/// The request a busy worker is handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub client: Bytes,
    pub job_id: Bytes,
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub identity: Bytes,
    pub service: String,
    pub name: String,
    pub expiry: Instant,
    pub heartbeats: u64,
    pub state: WorkerState,
    pub current: Option<Dispatch>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    client: Bytes,
    request: JobRequest,
}

#[derive(Debug, Default)]
struct ServiceRecord {
    /// Ready workers, oldest first
    waiting: VecDeque<Bytes>,
    /// Requests waiting for a ready worker, oldest first
    backlog: VecDeque<PendingRequest>,
}

/// A message the broker must send as a consequence of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Worker {
        identity: Bytes,
        message: BrokerMessage,
    },
    Client {
        identity: Bytes,
        reply: ServiceReply,
    },
}

impl Outbound {
    pub fn identity(&self) -> &Bytes {
        match self {
            Outbound::Worker { identity, .. } | Outbound::Client { identity, .. } => identity,
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Outbound::Worker { .. })
    }

    /// Router-ready message, identity first
    pub fn into_message(self) -> Message {
        let (identity, mut msg) = match self {
            Outbound::Worker { identity, message } => (identity, message.encode()),
            Outbound::Client { identity, reply } => (identity, reply.encode()),
        };
        msg.push_front(identity);
        msg
    }
}

fn to_client(identity: Bytes, service: &str, reply: Reply) -> Outbound {
    Outbound::Client {
        identity,
        reply: ServiceReply {
            service: service.to_string(),
            reply,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub ready_workers: usize,
    pub backlog: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub identity: String,
    pub name: String,
    pub service: String,
    pub state: WorkerState,
    pub job_id: Option<String>,
    pub heartbeats: u64,
    pub registered_at: DateTime<Utc>,
}

/// Read-only view of the broker tables
#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub services: Vec<ServiceSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
    pub in_flight_jobs: usize,
}

impl BrokerSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            services: Vec::new(),
            workers: Vec::new(),
            in_flight_jobs: 0,
        }
    }
}

/// Broker tables: workers, per-service queues and live dispatches.
///
/// All methods are synchronous and return the messages to send; the event
/// loop owning the registry does the I/O. Invariants:
/// - a worker identity is in at most one `waiting` queue, and only while READY
/// - a `(service, job_id)` has at most one dispatch record
/// - dispatch is FIFO over both `waiting` and `backlog`
#[derive(Debug)]
pub struct Registry {
    workers: HashMap<Bytes, WorkerRecord>,
    services: HashMap<String, ServiceRecord>,
    dispatches: HashMap<(String, Bytes), Bytes>,
    /// Workers presumed dead by expiry, kept so a late heartbeat re-registers
    expired: HashMap<Bytes, (String, String)>,
    expiry: Duration,
    max_backlog: usize,
}

impl Registry {
    pub fn new(expiry: Duration, max_backlog: usize) -> Self {
        Self {
            workers: HashMap::new(),
            services: HashMap::new(),
            dispatches: HashMap::new(),
            expired: HashMap::new(),
            expiry,
            max_backlog,
        }
    }

    pub fn worker(&self, identity: &[u8]) -> Option<&WorkerRecord> {
        self.workers.get(identity)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn backlog_len(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |s| s.backlog.len())
    }

    pub fn ready_workers(&self, service: &str) -> Vec<Bytes> {
        self.services
            .get(service)
            .map(|s| s.waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Worker currently running `job_id` for `service`
    pub fn dispatched_to(&self, service: &str, job_id: &Bytes) -> Option<&Bytes> {
        self.dispatches.get(&(service.to_string(), job_id.clone()))
    }

    /// READY: register (or refresh) the worker and hand it queued work.
    pub fn worker_ready(
        &mut self,
        identity: Bytes,
        service: String,
        name: String,
        now: Instant,
    ) -> Vec<Outbound> {
        self.expired.remove(&identity);

        if let Some(record) = self.workers.get_mut(&identity) {
            if record.service == service {
                record.expiry = now + self.expiry;
                tracing::debug!(service = %service, name = %name, "Duplicate READY ignored");
                return Vec::new();
            }
            tracing::info!(
                name = %name,
                from = %record.service,
                to = %service,
                "Worker switched service"
            );
            self.remove_worker(&identity);
        }

        // Last write wins for a reconnecting worker with the same name.
        let stale: Vec<Bytes> = self
            .workers
            .values()
            .filter(|w| w.service == service && w.name == name)
            .map(|w| w.identity.clone())
            .collect();
        for old in stale {
            tracing::warn!(service = %service, name = %name, "Replacing previous registration of worker");
            self.remove_worker(&old);
        }

        self.workers.insert(
            identity.clone(),
            WorkerRecord {
                identity: identity.clone(),
                service: service.clone(),
                name: name.clone(),
                expiry: now + self.expiry,
                heartbeats: 0,
                state: WorkerState::Ready,
                current: None,
                registered_at: Utc::now(),
            },
        );
        self.services
            .entry(service.clone())
            .or_default()
            .waiting
            .push_back(identity);
        tracing::info!(service = %service, name = %name, "Worker ready");

        self.drain(&service)
    }

    /// HEARTBEAT: refresh expiry. A presumed-dead worker re-registers; an
    /// unknown one is told to disconnect so it reconnects cleanly.
    pub fn worker_heartbeat(&mut self, identity: Bytes, now: Instant) -> Vec<Outbound> {
        if let Some(record) = self.workers.get_mut(&identity) {
            record.expiry = now + self.expiry;
            record.heartbeats += 1;
            return Vec::new();
        }
        if let Some((service, name)) = self.expired.remove(&identity) {
            tracing::info!(service = %service, name = %name, "Expired worker is alive again");
            return self.worker_ready(identity, service, name, now);
        }
        vec![Outbound::Worker {
            identity,
            message: BrokerMessage::Disconnect,
        }]
    }

    /// REPLY: forward to the client; a terminal status for the job the
    /// worker is busy with puts it back in the ready queue.
    pub fn worker_reply(
        &mut self,
        identity: Bytes,
        client: Bytes,
        job_id: Bytes,
        reply: Reply,
        now: Instant,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !self.workers.contains_key(&identity) {
            match self.expired.get(&identity).cloned() {
                Some((service, name)) => {
                    out.extend(self.worker_ready(identity.clone(), service, name, now));
                }
                None => {
                    tracing::warn!(identity = %hex::encode(&identity), "Reply from unregistered worker dropped");
                    out.push(Outbound::Worker {
                        identity,
                        message: BrokerMessage::Disconnect,
                    });
                    return out;
                }
            }
        }

        let Some(record) = self.workers.get_mut(&identity) else {
            return out;
        };
        record.expiry = now + self.expiry;
        let service = record.service.clone();
        let terminal = reply.is_terminal();
        let ends_job = terminal && reply.job_id().is_some();

        tracing::debug!(
            service = %service,
            job_id = %String::from_utf8_lossy(&job_id),
            status = %reply.command(),
            "Relaying status"
        );
        out.push(to_client(client, &service, reply));

        if ends_job {
            let key = (service.clone(), job_id.clone());
            if self.dispatches.get(&key) == Some(&identity) {
                self.dispatches.remove(&key);
            }
        }

        let releases = terminal
            && record
                .current
                .as_ref()
                .is_some_and(|current| current.job_id == job_id);
        if releases {
            record.current = None;
            record.state = WorkerState::Ready;
            self.services
                .entry(service.clone())
                .or_default()
                .waiting
                .push_back(identity);
            out.extend(self.drain(&service));
        }
        out
    }

    /// DISCONNECT or closed connection. Jobs held by the worker are not retried.
    pub fn worker_disconnected(&mut self, identity: &Bytes) {
        self.expired.remove(identity);
        if let Some(record) = self.remove_worker(identity) {
            tracing::info!(service = %record.service, name = %record.name, "Worker disconnected");
        }
    }

    /// Remove workers whose expiry has passed; returns their identities.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Bytes> {
        let dead: Vec<Bytes> = self
            .workers
            .values()
            .filter(|w| w.expiry <= now)
            .map(|w| w.identity.clone())
            .collect();
        for identity in &dead {
            if let Some(record) = self.remove_worker(identity) {
                tracing::warn!(service = %record.service, name = %record.name, "Worker expired");
                self.expired
                    .insert(identity.clone(), (record.service, record.name));
            }
        }
        dead
    }

    /// EXECUTE / CANCEL from a client.
    pub fn client_request(
        &mut self,
        client: Bytes,
        service: String,
        request: JobRequest,
    ) -> Vec<Outbound> {
        let job_id = request.job_id().clone();
        let key = (service.clone(), job_id.clone());

        match request {
            JobRequest::Execute { .. } => {
                if self.dispatches.contains_key(&key) || self.backlogged_execute(&service, &job_id) {
                    tracing::warn!(service = %service, job_id = %String::from_utf8_lossy(&job_id), "Duplicate EXECUTE rejected");
                    return vec![to_client(client, &service, Reply::already_running(&job_id))];
                }
                self.enqueue(client, service, request)
            }
            JobRequest::Cancel { .. } => {
                if let Some(worker) = self.dispatches.get(&key) {
                    return vec![Outbound::Worker {
                        identity: worker.clone(),
                        message: BrokerMessage::Request { client, request },
                    }];
                }
                if let Some(pending) = self.take_backlogged_execute(&service, &job_id) {
                    tracing::info!(service = %service, job_id = %String::from_utf8_lossy(&job_id), "Cancelled job before dispatch");
                    let mut out = vec![to_client(
                        client.clone(),
                        &service,
                        Reply::Cancelled {
                            job_id: job_id.clone(),
                        },
                    )];
                    if pending.client != client {
                        out.push(to_client(pending.client, &service, Reply::Cancelled { job_id }));
                    }
                    return out;
                }
                self.enqueue(client, service, request)
            }
        }
    }

    /// HEARTBEAT for every registered worker
    pub fn heartbeats(&self) -> Vec<Outbound> {
        self.workers
            .keys()
            .map(|identity| Outbound::Worker {
                identity: identity.clone(),
                message: BrokerMessage::Heartbeat,
            })
            .collect()
    }

    /// DISCONNECT every worker and forget them (broker shutdown)
    pub fn disconnect_all(&mut self) -> Vec<Outbound> {
        let out = self
            .workers
            .keys()
            .map(|identity| Outbound::Worker {
                identity: identity.clone(),
                message: BrokerMessage::Disconnect,
            })
            .collect();
        self.reset();
        out
    }

    /// Drop all tables
    pub fn reset(&mut self) {
        self.workers.clear();
        self.services.clear();
        self.dispatches.clear();
        self.expired.clear();
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        let mut services: Vec<ServiceSnapshot> = self
            .services
            .iter()
            .map(|(name, s)| ServiceSnapshot {
                name: name.clone(),
                ready_workers: s.waiting.len(),
                backlog: s.backlog.len(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let mut workers: Vec<WorkerSnapshot> = self
            .workers
            .values()
            .map(|w| WorkerSnapshot {
                identity: hex::encode(&w.identity),
                name: w.name.clone(),
                service: w.service.clone(),
                state: w.state,
                job_id: w
                    .current
                    .as_ref()
                    .map(|d| String::from_utf8_lossy(&d.job_id).into_owned()),
                heartbeats: w.heartbeats,
                registered_at: w.registered_at,
            })
            .collect();
        workers.sort_by_key(|w| w.registered_at);

        BrokerSnapshot {
            taken_at: Utc::now(),
            services,
            workers,
            in_flight_jobs: self.dispatches.len(),
        }
    }

    fn enqueue(&mut self, client: Bytes, service: String, request: JobRequest) -> Vec<Outbound> {
        let record = self.services.entry(service.clone()).or_default();
        if record.backlog.len() >= self.max_backlog {
            let message = format!("Service busy: {}", service);
            tracing::warn!(service = %service, backlog = record.backlog.len(), "Backlog full, request rejected");
            let reply = match &request {
                JobRequest::Execute { job_id, .. } => Reply::job_error(job_id.clone(), message),
                JobRequest::Cancel { .. } => Reply::Error {
                    job_id: None,
                    message,
                },
            };
            return vec![to_client(client, &service, reply)];
        }
        record.backlog.push_back(PendingRequest { client, request });
        self.drain(&service)
    }

    /// Pair ready workers with backlogged requests, oldest with oldest.
    fn drain(&mut self, service: &str) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(record) = self.services.get_mut(service) else {
            return out;
        };

        while !record.backlog.is_empty() {
            let Some(identity) = record.waiting.pop_front() else {
                break;
            };
            let Some(worker) = self.workers.get_mut(&identity) else {
                continue;
            };
            let Some(pending) = record.backlog.pop_front() else {
                break;
            };

            let job_id = pending.request.job_id().clone();
            worker.state = WorkerState::Busy;
            worker.current = Some(Dispatch {
                client: pending.client.clone(),
                job_id: job_id.clone(),
            });
            if let JobRequest::Execute { .. } = pending.request {
                self.dispatches
                    .insert((service.to_string(), job_id.clone()), identity.clone());
            }

            tracing::info!(
                service = %service,
                worker = %worker.name,
                job_id = %String::from_utf8_lossy(&job_id),
                command = %pending.request.command(),
                "Dispatching request"
            );
            out.push(Outbound::Worker {
                identity,
                message: BrokerMessage::Request {
                    client: pending.client,
                    request: pending.request,
                },
            });
        }
        out
    }

    fn backlogged_execute(&self, service: &str, job_id: &Bytes) -> bool {
        self.services.get(service).is_some_and(|s| {
            s.backlog.iter().any(|p| {
                matches!(&p.request, JobRequest::Execute { job_id: queued, .. } if queued == job_id)
            })
        })
    }

    fn take_backlogged_execute(&mut self, service: &str, job_id: &Bytes) -> Option<PendingRequest> {
        let record = self.services.get_mut(service)?;
        let position = record.backlog.iter().position(|p| {
            matches!(&p.request, JobRequest::Execute { job_id: queued, .. } if queued == job_id)
        })?;
        record.backlog.remove(position)
    }

    fn remove_worker(&mut self, identity: &Bytes) -> Option<WorkerRecord> {
        let record = self.workers.remove(identity)?;
        if let Some(service) = self.services.get_mut(&record.service) {
            service.waiting.retain(|w| w != identity);
        }
        let before = self.dispatches.len();
        self.dispatches.retain(|_, owner| owner != identity);
        if let Some(current) = &record.current {
            tracing::warn!(
                service = %record.service,
                name = %record.name,
                job_id = %String::from_utf8_lossy(&current.job_id),
                abandoned = before - self.dispatches.len(),
                "Worker removed while busy; job is not retried"
            );
        }
        Some(record)
    }
}
