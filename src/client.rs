use bytes::Bytes;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{ClientMessage, JobRequest, Reply, ServiceReply};
use crate::transport::{DealerSocket, TransportError};

/// Client handle: submits and cancels jobs, polls relayed replies.
///
/// Replies are asynchronous; every request is answered with one or more
/// [`ServiceReply`] messages picked up by [`Client::recv`].
pub struct Client {
    config: ClientConfig,
    socket: DealerSocket,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let socket = DealerSocket::connect(&config.broker, config.limits).await?;
        Ok(Self { config, socket })
    }

    /// Send EXECUTE. The configuration bytes reach the computation unchanged.
    pub async fn execute(
        &mut self,
        service: &str,
        job_id: impl Into<Bytes>,
        config: impl Into<Bytes>,
    ) -> Result<()> {
        let request = JobRequest::Execute {
            job_id: job_id.into(),
            config: config.into(),
        };
        self.send(service, request).await
    }

    /// Send CANCEL. Exactly one reply follows: JOB_CANCELLED or an ERROR.
    pub async fn cancel(&mut self, service: &str, job_id: impl Into<Bytes>) -> Result<()> {
        let request = JobRequest::Cancel {
            job_id: job_id.into(),
        };
        self.send(service, request).await
    }

    async fn send(&mut self, service: &str, request: JobRequest) -> Result<()> {
        tracing::debug!(
            service,
            job_id = %String::from_utf8_lossy(request.job_id()),
            command = %request.command(),
            "Sending request"
        );
        let msg = ClientMessage {
            service: service.to_string(),
            request,
        };
        self.socket.send(msg.encode()).await?;
        Ok(())
    }

    /// Wait up to one poll timeout for the next reply. `Ok(None)` means
    /// nothing arrived; malformed messages are dropped.
    pub async fn recv(&mut self) -> Result<Option<ServiceReply>> {
        let deadline = Instant::now() + self.config.poll_timeout();
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.socket.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(TransportError::Closed.into()),
                Ok(Some(msg)) => msg?,
            };
            match ServiceReply::decode(msg) {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) => tracing::debug!(error = %e, "Dropping invalid reply"),
            }
        }
    }

    /// Poll at most `max_polls` times, collecting replies for `job_id` until
    /// a terminal one. An untagged ERROR also ends the wait since it answers
    /// the request itself. Replies for other jobs are skipped.
    pub async fn wait_for_terminal(&mut self, job_id: &[u8], max_polls: usize) -> Result<Vec<Reply>> {
        let mut replies = Vec::new();
        for _ in 0..max_polls {
            let Some(ServiceReply { reply, .. }) = self.recv().await? else {
                continue;
            };
            let ours = reply.job_id().map_or(true, |id| id.as_ref() == job_id);
            if !ours {
                tracing::debug!(
                    expected = %String::from_utf8_lossy(job_id),
                    status = %reply.command(),
                    "Skipping reply for another job"
                );
                continue;
            }
            let terminal = reply.is_terminal();
            replies.push(reply);
            if terminal {
                break;
            }
        }
        Ok(replies)
    }
}
