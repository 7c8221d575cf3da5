use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::Reply;

/// Terminal reply for a cancelled job whose supervisor outlived SIGKILL
pub const NOT_REAPED: &str = "Execution supervisor could not be reaped after cancel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Received,
    Started,
    Cancelling,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Received => write!(f, "received"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Cancelling => write!(f, "cancelling"),
        }
    }
}

/// How the execution supervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub at: Instant,
    pub code: Option<i32>,
    /// False if the process was still running when the launcher gave up
    pub reaped: bool,
}

/// A job the worker is responsible for, from RECEIVED until its terminal reply.
#[derive(Debug)]
pub struct ActiveJob {
    pub job_id: Bytes,
    /// Distinguishes supervisor events of this run from an earlier job with
    /// the same id
    pub run_id: Uuid,
    pub algorithm: Option<String>,
    /// Client that sent EXECUTE
    pub client: Bytes,
    /// JOB_STARTED has been relayed
    pub started: bool,
    /// One entry per CANCEL received; non-empty means cancelling
    pub cancel_requesters: Vec<Bytes>,
    pub cancel: CancellationToken,
    pub exit: Option<Exit>,
    pub task: Option<JoinHandle<()>>,
    pub received_at: DateTime<Utc>,
}

impl ActiveJob {
    pub fn new(job_id: Bytes, client: Bytes, algorithm: Option<String>) -> Self {
        Self {
            job_id,
            run_id: Uuid::new_v4(),
            algorithm,
            client,
            started: false,
            cancel_requesters: Vec::new(),
            cancel: CancellationToken::new(),
            exit: None,
            task: None,
            received_at: Utc::now(),
        }
    }

    pub fn status(&self) -> JobStatus {
        if self.is_cancelling() {
            JobStatus::Cancelling
        } else if self.started {
            JobStatus::Started
        } else {
            JobStatus::Received
        }
    }

    pub fn is_cancelling(&self) -> bool {
        !self.cancel_requesters.is_empty()
    }

    /// Record a CANCEL and signal the launcher task. Each call is owed its
    /// own reply, repeats from the same client included. Returns false if
    /// the job was already being cancelled.
    pub fn request_cancel(&mut self, client: Bytes) -> bool {
        let first = !self.is_cancelling();
        self.cancel_requesters.push(client);
        self.cancel.cancel();
        first
    }

    /// One recipient per CANCEL, plus the submitter if it never sent one.
    pub fn cancel_recipients(&self) -> Vec<Bytes> {
        let mut recipients = self.cancel_requesters.clone();
        if !recipients.contains(&self.client) {
            recipients.push(self.client.clone());
        }
        recipients
    }

    /// Terminal reply owed to each cancel recipient once the launcher is done
    /// with the supervisor.
    pub fn cancel_reply(&self) -> Reply {
        match self.exit {
            Some(Exit { reaped: false, .. }) => Reply::job_error(self.job_id.clone(), NOT_REAPED),
            _ => Reply::Cancelled {
                job_id: self.job_id.clone(),
            },
        }
    }

    /// Time since EXECUTE was accepted
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }

    /// Supervisor exited more than `grace` ago without a terminal report
    pub fn overdue(&self, now: Instant, grace: Duration) -> bool {
        !self.is_cancelling() && self.exit.is_some_and(|exit| exit.at + grace <= now)
    }
}

/// Active jobs by id, owned by the worker event loop
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<Bytes, ActiveJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new job. Returns false, leaving the table untouched, if the
    /// id is already tracked.
    pub fn insert(&mut self, job: ActiveJob) -> bool {
        if self.jobs.contains_key(&job.job_id) {
            return false;
        }
        self.jobs.insert(job.job_id.clone(), job);
        true
    }

    pub fn contains(&self, job_id: &[u8]) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn get(&self, job_id: &[u8]) -> Option<&ActiveJob> {
        self.jobs.get(job_id)
    }

    pub fn get_mut(&mut self, job_id: &[u8]) -> Option<&mut ActiveJob> {
        self.jobs.get_mut(job_id)
    }

    /// Look up a job only if it belongs to `run_id`
    pub fn run_mut(&mut self, job_id: &[u8], run_id: Uuid) -> Option<&mut ActiveJob> {
        self.jobs.get_mut(job_id).filter(|job| job.run_id == run_id)
    }

    pub fn remove(&mut self, job_id: &[u8]) -> Option<ActiveJob> {
        self.jobs.remove(job_id)
    }

    /// Ids of jobs whose supervisor exited without reporting within `grace`
    pub fn overdue(&self, now: Instant, grace: Duration) -> Vec<Bytes> {
        self.jobs
            .values()
            .filter(|job| job.overdue(now, grace))
            .map(|job| job.job_id.clone())
            .collect()
    }

    /// Empty the table, handing back every job (worker shutdown)
    pub fn reset(&mut self) -> Vec<ActiveJob> {
        self.jobs.drain().map(|(_, job)| job).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
