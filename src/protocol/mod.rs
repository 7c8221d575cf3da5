//! Wire vocabulary shared by broker, worker, client and execution supervisor.
//!
//! A message is an ordered list of frames:
//!
//! ```text
//! [identity]  service-or-empty  signature  command  ...command frames
//! ```
//!
//! The identity frame only exists on router sockets. The signature frame
//! identifies the protocol family (worker, client or supervisor side) and
//! the command is a single byte. Every decoder validates all three and
//! returns a [`ProtocolError`] on anything else; callers log and drop.

pub mod command;
pub mod envelope;
pub mod message;

pub use command::{Command, CLIENT_SIGNATURE, SUPERVISOR_SIGNATURE, WORKER_SIGNATURE};
pub use envelope::{
    BrokerInbound, BrokerMessage, ClientMessage, JobRequest, ProtocolError, Reply, ServiceReply,
    SupervisorReport, WorkerMessage,
};
pub use message::Message;
