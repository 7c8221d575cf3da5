use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::protocol::Message;
use crate::transport::codec::{FrameLimits, MultipartCodec};
use crate::transport::endpoint::Endpoint;
use crate::transport::TransportError;

const EVENT_QUEUE: usize = 1024;
const OUTBOUND_QUEUE: usize = 1024;

/// Something a router socket observed.
#[derive(Debug)]
pub enum RouterEvent {
    /// Inbound message; frame 0 is the sender's identity.
    Message(Message),
    /// The peer with this identity closed its connection.
    Disconnected(Bytes),
}

#[derive(Debug)]
enum PeerEvent {
    Connected {
        identity: Bytes,
        outbound: mpsc::Sender<Message>,
    },
    Message(Message),
    Closed(Bytes),
}

/// Inbound rendezvous socket.
///
/// Every accepted connection gets a random identity. Received messages carry
/// that identity as frame 0; [`RouterSocket::send`] pops frame 0 and delivers
/// the remaining frames to the matching connection.
pub struct RouterSocket {
    local_addr: SocketAddr,
    events: mpsc::Receiver<PeerEvent>,
    peers: HashMap<Bytes, mpsc::Sender<Message>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RouterSocket {
    pub async fn bind(endpoint: &Endpoint, limits: FrameLimits) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(endpoint.socket_addr_string()).await?;
        Self::from_listener(listener, limits)
    }

    /// Bind to the first free port of `min..=max`, probing from a random offset.
    pub async fn bind_in_range(
        host: &str,
        min: u16,
        max: u16,
        limits: FrameLimits,
    ) -> Result<Self, TransportError> {
        if min > max {
            return Err(TransportError::InvalidEndpoint(format!("{}:{}-{}", host, min, max)));
        }
        let span = u32::from(max - min) + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for step in 0..span {
            let port = min + ((start + step) % span) as u16;
            let endpoint = Endpoint::new(host, port);
            match TcpListener::bind(endpoint.socket_addr_string()).await {
                Ok(listener) => return Self::from_listener(listener, limits),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransportError::NoFreePort(min, max))
    }

    fn from_listener(listener: TcpListener, limits: FrameLimits) -> Result<Self, TransportError> {
        let local_addr = listener.local_addr()?;
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(
            listener,
            MultipartCodec::new(limits),
            event_tx,
            shutdown.clone(),
            tasks.clone(),
        ));

        Ok(Self {
            local_addr,
            events,
            peers: HashMap::new(),
            shutdown,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_connected(&self, identity: &[u8]) -> bool {
        self.peers.contains_key(identity)
    }

    /// Wait for the next message or disconnect. Cancel safe.
    pub async fn recv(&mut self) -> Option<RouterEvent> {
        loop {
            match self.events.recv().await? {
                PeerEvent::Connected { identity, outbound } => {
                    self.peers.insert(identity, outbound);
                }
                PeerEvent::Message(msg) => return Some(RouterEvent::Message(msg)),
                PeerEvent::Closed(identity) => {
                    self.peers.remove(&identity);
                    return Some(RouterEvent::Disconnected(identity));
                }
            }
        }
    }

    /// Route `msg` to the peer named by frame 0. Never blocks.
    pub fn send(&mut self, mut msg: Message) -> Result<(), TransportError> {
        let identity = msg
            .pop_front()
            .ok_or(TransportError::MissingIdentity)?;
        let peer = self
            .peers
            .get(&identity)
            .ok_or_else(|| TransportError::UnknownPeer(hex::encode(&identity)))?;

        match peer.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::PeerBacklogged(hex::encode(&identity))),
            Err(TrySendError::Closed(_)) => {
                self.peers.remove(&identity);
                Err(TransportError::UnknownPeer(hex::encode(&identity)))
            }
        }
    }
}

impl RouterSocket {
    /// Stop accepting, flush what is already queued for each peer and wait
    /// up to `grace` for the connections to close.
    pub async fn close(self, grace: Duration) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::debug!("Router connections still open after close grace");
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn new_identity() -> Bytes {
    Bytes::copy_from_slice(Uuid::new_v4().as_bytes())
}

async fn accept_loop(
    listener: TcpListener,
    codec: MultipartCodec,
    events: mpsc::Sender<PeerEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let identity = new_identity();
                    tracing::debug!(peer = %peer_addr, identity = %hex::encode(&identity), "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    tasks.spawn(serve_connection(
                        stream,
                        identity,
                        codec.clone(),
                        events.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    identity: Bytes,
    codec: MultipartCodec,
    events: mpsc::Sender<PeerEvent>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let connected = PeerEvent::Connected {
        identity: identity.clone(),
        outbound,
    };
    if events.send(connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                while let Ok(msg) = outbound_rx.try_recv() {
                    if writer.send(msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
            inbound = reader.next() => match inbound {
                Some(Ok(mut msg)) => {
                    msg.push_front(identity.clone());
                    if events.send(PeerEvent::Message(msg)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(identity = %hex::encode(&identity), error = %e, "Dropping connection after framing error");
                    break;
                }
                None => break,
            },
            queued = outbound_rx.recv() => match queued {
                Some(msg) => {
                    if let Err(e) = writer.send(msg).await {
                        tracing::warn!(identity = %hex::encode(&identity), error = %e, "Write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = events.send(PeerEvent::Closed(identity)).await;
}
