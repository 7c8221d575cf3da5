//! Identity-routed multipart messaging over TCP.
//!
//! - [`RouterSocket`]: binds, accepts many peers, tags inbound messages with
//!   the peer identity and routes replies back by that identity
//! - [`DealerSocket`]: one outbound connection to a router
//! - [`MultipartCodec`]: the length-prefixed record both sides speak

pub mod codec;
pub mod dealer;
pub mod endpoint;
pub mod router;

pub use codec::{FrameLimits, MultipartCodec};
pub use dealer::DealerSocket;
pub use endpoint::Endpoint;
pub use router::{RouterEvent, RouterSocket};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("message has {0} frames, limit is {1}")]
    TooManyFrames(usize, usize),

    #[error("message of {0} bytes exceeds limit of {1}")]
    MessageTooLarge(usize, usize),

    #[error("message has no identity frame")]
    MissingIdentity,

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("outbound queue for peer {0} is full")]
    PeerBacklogged(String),

    #[error("no free port in range {0}-{1}")]
    NoFreePort(u16, u16),

    #[error("connection closed by peer")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use std::time::Duration;

    async fn bound_router() -> (RouterSocket, Endpoint) {
        let router = RouterSocket::bind(&"tcp://127.0.0.1:0".parse().unwrap(), FrameLimits::default())
            .await
            .unwrap();
        let endpoint = Endpoint::from(router.local_addr());
        (router, endpoint)
    }

    async fn next_message(router: &mut RouterSocket) -> Message {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), router.recv())
                .await
                .expect("router recv timed out")
                .expect("router closed")
            {
                RouterEvent::Message(msg) => return msg,
                RouterEvent::Disconnected(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn router_tags_and_routes_by_identity() {
        let (mut router, endpoint) = bound_router().await;
        let mut a = DealerSocket::connect(&endpoint, FrameLimits::default()).await.unwrap();
        let mut b = DealerSocket::connect(&endpoint, FrameLimits::default()).await.unwrap();

        a.send(Message::from_frames(["from-a"])).await.unwrap();
        let msg_a = next_message(&mut router).await;
        b.send(Message::from_frames(["from-b"])).await.unwrap();
        let msg_b = next_message(&mut router).await;

        let id_a = msg_a.front().cloned().unwrap();
        let id_b = msg_b.front().cloned().unwrap();
        assert_eq!(id_a.len(), 16);
        assert_ne!(id_a, id_b);
        assert_eq!(router.peer_count(), 2);

        router
            .send(Message::new().with_frame(id_b.clone()).with_frame("to-b"))
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::from_frames(["to-b"]));
    }

    #[tokio::test]
    async fn sending_to_unknown_identity_fails() {
        let (mut router, _) = bound_router().await;
        let err = router
            .send(Message::from_frames(["nobody", "payload"]))
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
        assert!(matches!(
            router.send(Message::new()).unwrap_err(),
            TransportError::MissingIdentity
        ));
    }

    #[tokio::test]
    async fn dropped_dealer_reports_disconnect() {
        let (mut router, endpoint) = bound_router().await;
        let mut dealer = DealerSocket::connect(&endpoint, FrameLimits::default()).await.unwrap();
        dealer.send(Message::from_frames(["hello"])).await.unwrap();
        let identity = next_message(&mut router).await.front().cloned().unwrap();
        assert!(router.is_connected(&identity));

        drop(dealer);
        let event = tokio::time::timeout(Duration::from_secs(5), router.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RouterEvent::Disconnected(gone) => assert_eq!(gone, identity),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert!(!router.is_connected(&identity));
    }

    #[tokio::test]
    async fn bind_in_range_picks_port_inside_range() {
        let router = RouterSocket::bind_in_range("127.0.0.1", 41000, 41050, FrameLimits::default())
            .await
            .unwrap();
        let port = router.local_addr().port();
        assert!((41000..=41050).contains(&port));

        assert!(matches!(
            RouterSocket::bind_in_range("127.0.0.1", 10, 5, FrameLimits::default()).await,
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
