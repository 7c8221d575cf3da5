use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::protocol::Message;
use crate::transport::codec::{FrameLimits, MultipartCodec};
use crate::transport::endpoint::Endpoint;
use crate::transport::TransportError;

/// Outbound connection to a router socket. Messages carry no identity frame.
pub struct DealerSocket {
    endpoint: Endpoint,
    reader: FramedRead<OwnedReadHalf, MultipartCodec>,
    writer: FramedWrite<OwnedWriteHalf, MultipartCodec>,
}

impl DealerSocket {
    pub async fn connect(endpoint: &Endpoint, limits: FrameLimits) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(endpoint.socket_addr_string()).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let codec = MultipartCodec::new(limits);

        tracing::debug!(endpoint = %endpoint, "Connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            reader: FramedRead::new(read_half, codec.clone()),
            writer: FramedWrite::new(write_half, codec),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.writer.send(msg).await
    }

    /// Next inbound message. `None` once the peer closed the connection.
    /// Cancel safe: partially read records stay buffered.
    pub async fn recv(&mut self) -> Option<Result<Message, TransportError>> {
        self.reader.next().await
    }
}
