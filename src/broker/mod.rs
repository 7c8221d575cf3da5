//! Broker: tracks live workers per service and relays requests and replies.
//!
//! The broker owns a single [`RouterSocket`] shared by workers and clients
//! (the signature frame tells them apart) and a [`Registry`] mutated only by
//! the event loop in [`Broker::run`]:
//!
//! - **Dispatch**: client requests are queued per service and handed to the
//!   oldest ready worker
//! - **Relay**: worker status replies are forwarded to the requesting client
//! - **Liveness**: heartbeats in both directions; silent workers expire
//!
//! Jobs held by a worker that expires or disconnects are not retried.

pub mod registry;

pub use registry::{BrokerSnapshot, Outbound, Registry, WorkerState};

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::protocol::{BrokerInbound, ClientMessage, Message, WorkerMessage};
use crate::transport::{Endpoint, RouterEvent, RouterSocket};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct Broker {
    config: BrokerConfig,
    socket: RouterSocket,
    registry: Registry,
    snapshot_tx: watch::Sender<BrokerSnapshot>,
}

impl Broker {
    /// Bind the broker socket. Configuration errors are fatal here.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let socket = RouterSocket::bind(&config.bind, config.limits).await?;
        let registry = Registry::new(config.heartbeat_expiry(), config.max_backlog);
        let (snapshot_tx, _) = watch::channel(BrokerSnapshot::empty());

        tracing::info!(endpoint = %Endpoint::from(socket.local_addr()), "Broker listening");

        Ok(Self {
            config,
            socket,
            registry,
            snapshot_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.local_addr())
    }

    /// Receiver of the status snapshot, refreshed as the broker runs.
    pub fn subscribe(&self) -> watch::Receiver<BrokerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Event loop. Returns once `shutdown` fires, after telling every
    /// registered worker to disconnect.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.socket.recv() => match event {
                    Some(RouterEvent::Message(msg)) => self.handle_message(msg),
                    Some(RouterEvent::Disconnected(identity)) => {
                        self.registry.worker_disconnected(&identity);
                    }
                    None => {
                        tracing::error!("Broker socket closed unexpectedly");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    let expired = self.registry.purge_expired(Instant::now());
                    if !expired.is_empty() {
                        tracing::debug!(count = expired.len(), "Purged expired workers");
                    }
                    let out = self.registry.heartbeats();
                    self.deliver(out);
                }
            }
            self.publish();
        }

        let out = self.registry.disconnect_all();
        tracing::info!(workers = out.len(), "Broker shutting down, disconnecting workers");
        self.deliver(out);
        self.publish();
        self.socket.close(CLOSE_GRACE).await;
        Ok(())
    }

    fn handle_message(&mut self, mut msg: Message) {
        let Some(sender) = msg.pop_front() else {
            return;
        };
        let inbound = match BrokerInbound::decode(msg) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(peer = %hex::encode(&sender), error = %e, "Dropping invalid message");
                return;
            }
        };

        let now = Instant::now();
        let out = match inbound {
            BrokerInbound::Worker(WorkerMessage::Ready { service, name }) => {
                self.registry.worker_ready(sender, service, name, now)
            }
            BrokerInbound::Worker(WorkerMessage::Heartbeat) => {
                self.registry.worker_heartbeat(sender, now)
            }
            BrokerInbound::Worker(WorkerMessage::Disconnect) => {
                self.registry.worker_disconnected(&sender);
                Vec::new()
            }
            BrokerInbound::Worker(WorkerMessage::Reply {
                client,
                job_id,
                reply,
            }) => self.registry.worker_reply(sender, client, job_id, reply, now),
            BrokerInbound::Client(ClientMessage { service, request }) => {
                self.registry.client_request(sender, service, request)
            }
        };
        self.deliver(out);
    }

    fn deliver(&mut self, out: Vec<Outbound>) {
        for outbound in out {
            let is_worker = outbound.is_worker();
            let identity = outbound.identity().clone();
            if let Err(e) = self.socket.send(outbound.into_message()) {
                if is_worker {
                    tracing::warn!(worker = %hex::encode(&identity), error = %e, "Send to worker failed, removing it");
                    self.registry.worker_disconnected(&identity);
                } else {
                    tracing::debug!(client = %hex::encode(&identity), error = %e, "Client gone, reply dropped");
                }
            }
        }
    }

    fn publish(&self) {
        if self.snapshot_tx.receiver_count() > 0 {
            self.snapshot_tx.send_replace(self.registry.snapshot());
        }
    }
}
