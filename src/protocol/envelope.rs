use bytes::Bytes;
use thiserror::Error;

use crate::protocol::command::{
    Command, CLIENT_SIGNATURE, SUPERVISOR_SIGNATURE, WORKER_SIGNATURE,
};
use crate::protocol::message::Message;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("missing {0} frame")]
    MissingFrame(&'static str),

    #[error("protocol signature mismatch")]
    BadSignature,

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("command frame must be exactly one byte")]
    MalformedCommand,

    #[error("command {0} is not valid in this direction")]
    UnexpectedCommand(Command),

    #[error("{0} frame is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("{0} unexpected trailing frame(s)")]
    TrailingFrames(usize),

    #[error("service name must not be empty")]
    EmptyService,
}

fn take(msg: &mut Message, name: &'static str) -> Result<Bytes, ProtocolError> {
    msg.pop_front().ok_or(ProtocolError::MissingFrame(name))
}

fn take_utf8(msg: &mut Message, name: &'static str) -> Result<String, ProtocolError> {
    let frame = take(msg, name)?;
    String::from_utf8(frame.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(name))
}

fn finish(msg: &Message) -> Result<(), ProtocolError> {
    if msg.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingFrames(msg.len()))
    }
}

fn parse_command(frame: &[u8]) -> Result<Command, ProtocolError> {
    match frame {
        [byte] => Command::from_byte(*byte).ok_or(ProtocolError::UnknownCommand(*byte)),
        _ => Err(ProtocolError::MalformedCommand),
    }
}

/// Validate and strip `[header, signature, command]`, returning the header and
/// command. The remaining frames are the command-specific payload.
pub fn open_envelope(
    msg: &mut Message,
    signature: &[u8],
) -> Result<(Bytes, Command), ProtocolError> {
    if msg.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let header = take(msg, "header")?;
    let found = take(msg, "signature")?;
    if found.as_ref() != signature {
        return Err(ProtocolError::BadSignature);
    }
    let command = parse_command(&take(msg, "command")?)?;
    Ok((header, command))
}

fn seal(header: impl Into<Bytes>, signature: &'static [u8], command: Command) -> Message {
    Message::new()
        .with_frame(header)
        .with_frame(Bytes::from_static(signature))
        .with_frame(command.frame())
}

/// Status replies relayed worker -> broker -> client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Received { job_id: Bytes },
    Started { job_id: Bytes },
    Done { job_id: Bytes, result: Bytes },
    Cancelled { job_id: Bytes },
    /// `job_id` is set when the error ends that job. Untagged errors answer a
    /// request that neither created nor ended a job.
    Error {
        job_id: Option<Bytes>,
        message: String,
    },
}

impl Reply {
    pub fn unknown_job(job_id: &[u8]) -> Self {
        Reply::Error {
            job_id: None,
            message: format!("Unknown job: {}", String::from_utf8_lossy(job_id)),
        }
    }

    pub fn already_running(job_id: &[u8]) -> Self {
        Reply::Error {
            job_id: None,
            message: format!("Job already running: {}", String::from_utf8_lossy(job_id)),
        }
    }

    pub fn job_error(job_id: Bytes, message: impl Into<String>) -> Self {
        Reply::Error {
            job_id: Some(job_id),
            message: message.into(),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Reply::Received { .. } => Command::JobReceived,
            Reply::Started { .. } => Command::JobStarted,
            Reply::Done { .. } => Command::JobDone,
            Reply::Cancelled { .. } => Command::JobCancelled,
            Reply::Error { .. } => Command::Error,
        }
    }

    pub fn job_id(&self) -> Option<&Bytes> {
        match self {
            Reply::Received { job_id }
            | Reply::Started { job_id }
            | Reply::Done { job_id, .. }
            | Reply::Cancelled { job_id } => Some(job_id),
            Reply::Error { job_id, .. } => job_id.as_ref(),
        }
    }

    /// DONE, CANCELLED and ERROR end the exchange; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Reply::Done { .. } | Reply::Cancelled { .. } | Reply::Error { .. }
        )
    }

    /// Append `[command, ...frames]`
    pub fn append_to(&self, msg: &mut Message) {
        msg.push_back(self.command().frame());
        match self {
            Reply::Received { job_id } | Reply::Started { job_id } | Reply::Cancelled { job_id } => {
                msg.push_back(job_id.clone());
            }
            Reply::Done { job_id, result } => {
                msg.push_back(job_id.clone());
                msg.push_back(result.clone());
            }
            Reply::Error { job_id, message } => {
                if let Some(job_id) = job_id {
                    msg.push_back(job_id.clone());
                }
                msg.push_back(message.clone());
            }
        }
    }

    /// Parse `[command, ...frames]`; the message must hold nothing else.
    pub fn read(msg: &mut Message) -> Result<Self, ProtocolError> {
        let command = parse_command(&take(msg, "status")?)?;
        Self::read_after(command, msg)
    }

    /// Parse the frames following an already consumed status command.
    pub fn read_after(command: Command, msg: &mut Message) -> Result<Self, ProtocolError> {
        let reply = match command {
            Command::JobReceived => Reply::Received {
                job_id: take(msg, "job_id")?,
            },
            Command::JobStarted => Reply::Started {
                job_id: take(msg, "job_id")?,
            },
            Command::JobDone => Reply::Done {
                job_id: take(msg, "job_id")?,
                result: take(msg, "result")?,
            },
            Command::JobCancelled => Reply::Cancelled {
                job_id: take(msg, "job_id")?,
            },
            Command::Error => {
                let job_id = match msg.len() {
                    0 => return Err(ProtocolError::MissingFrame("message")),
                    1 => None,
                    _ => Some(take(msg, "job_id")?),
                };
                Reply::Error {
                    job_id,
                    message: take_utf8(msg, "message")?,
                }
            }
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        };
        finish(msg)?;
        Ok(reply)
    }
}

/// A request a client addresses to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRequest {
    Execute { job_id: Bytes, config: Bytes },
    Cancel { job_id: Bytes },
}

impl JobRequest {
    pub fn command(&self) -> Command {
        match self {
            JobRequest::Execute { .. } => Command::Execute,
            JobRequest::Cancel { .. } => Command::Cancel,
        }
    }

    pub fn job_id(&self) -> &Bytes {
        match self {
            JobRequest::Execute { job_id, .. } | JobRequest::Cancel { job_id } => job_id,
        }
    }

    pub fn append_to(&self, msg: &mut Message) {
        msg.push_back(self.command().frame());
        match self {
            JobRequest::Execute { job_id, config } => {
                msg.push_back(job_id.clone());
                msg.push_back(config.clone());
            }
            JobRequest::Cancel { job_id } => msg.push_back(job_id.clone()),
        }
    }

    pub fn read(msg: &mut Message) -> Result<Self, ProtocolError> {
        let command = parse_command(&take(msg, "request")?)?;
        Self::read_after(command, msg)
    }

    pub fn read_after(command: Command, msg: &mut Message) -> Result<Self, ProtocolError> {
        let request = match command {
            Command::Execute => JobRequest::Execute {
                job_id: take(msg, "job_id")?,
                config: take(msg, "config")?,
            },
            Command::Cancel => JobRequest::Cancel {
                job_id: take(msg, "job_id")?,
            },
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        };
        finish(msg)?;
        Ok(request)
    }
}

/// Worker -> broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Ready { service: String, name: String },
    Heartbeat,
    Disconnect,
    /// Status for a job, addressed to `client`. `job_id` is the job the
    /// status concerns, also for untagged errors.
    Reply {
        client: Bytes,
        job_id: Bytes,
        reply: Reply,
    },
}

impl WorkerMessage {
    pub fn command(&self) -> Command {
        match self {
            WorkerMessage::Ready { .. } => Command::Ready,
            WorkerMessage::Heartbeat => Command::Heartbeat,
            WorkerMessage::Disconnect => Command::Disconnect,
            WorkerMessage::Reply { .. } => Command::Reply,
        }
    }

    pub fn encode(&self) -> Message {
        let mut msg = seal(Bytes::new(), WORKER_SIGNATURE, self.command());
        match self {
            WorkerMessage::Ready { service, name } => {
                msg.push_back(service.clone());
                msg.push_back(name.clone());
            }
            WorkerMessage::Heartbeat | WorkerMessage::Disconnect => {}
            WorkerMessage::Reply {
                client,
                job_id,
                reply,
            } => {
                msg.push_back(client.clone());
                msg.push_back(job_id.clone());
                reply.append_to(&mut msg);
            }
        }
        msg
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtocolError> {
        let (_, command) = open_envelope(&mut msg, WORKER_SIGNATURE)?;
        let decoded = match command {
            Command::Ready => {
                let service = take_utf8(&mut msg, "service")?;
                if service.is_empty() {
                    return Err(ProtocolError::EmptyService);
                }
                WorkerMessage::Ready {
                    service,
                    name: take_utf8(&mut msg, "name")?,
                }
            }
            Command::Heartbeat => WorkerMessage::Heartbeat,
            Command::Disconnect => WorkerMessage::Disconnect,
            Command::Reply => {
                let client = take(&mut msg, "client")?;
                let job_id = take(&mut msg, "job_id")?;
                // Reply::read checks for trailing frames
                let reply = Reply::read(&mut msg)?;
                return Ok(WorkerMessage::Reply {
                    client,
                    job_id,
                    reply,
                });
            }
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        };
        finish(&msg)?;
        Ok(decoded)
    }
}

/// Broker -> worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    Request { client: Bytes, request: JobRequest },
    Heartbeat,
    Disconnect,
}

impl BrokerMessage {
    pub fn command(&self) -> Command {
        match self {
            BrokerMessage::Request { .. } => Command::Request,
            BrokerMessage::Heartbeat => Command::Heartbeat,
            BrokerMessage::Disconnect => Command::Disconnect,
        }
    }

    pub fn encode(&self) -> Message {
        let mut msg = seal(Bytes::new(), WORKER_SIGNATURE, self.command());
        if let BrokerMessage::Request { client, request } = self {
            msg.push_back(client.clone());
            request.append_to(&mut msg);
        }
        msg
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtocolError> {
        let (_, command) = open_envelope(&mut msg, WORKER_SIGNATURE)?;
        let decoded = match command {
            Command::Request => {
                let client = take(&mut msg, "client")?;
                let request = JobRequest::read(&mut msg)?;
                return Ok(BrokerMessage::Request { client, request });
            }
            Command::Heartbeat => BrokerMessage::Heartbeat,
            Command::Disconnect => BrokerMessage::Disconnect,
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        };
        finish(&msg)?;
        Ok(decoded)
    }
}

/// Client -> broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub service: String,
    pub request: JobRequest,
}

impl ClientMessage {
    pub fn encode(&self) -> Message {
        let mut msg = Message::new()
            .with_frame(self.service.clone())
            .with_frame(Bytes::from_static(CLIENT_SIGNATURE));
        self.request.append_to(&mut msg);
        msg
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtocolError> {
        let (service, command) = open_envelope(&mut msg, CLIENT_SIGNATURE)?;
        if service.is_empty() {
            return Err(ProtocolError::EmptyService);
        }
        let service =
            String::from_utf8(service.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("service"))?;
        let request = JobRequest::read_after(command, &mut msg)?;
        Ok(Self { service, request })
    }
}

/// Broker -> client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub service: String,
    pub reply: Reply,
}

impl ServiceReply {
    pub fn encode(&self) -> Message {
        let mut msg = Message::new()
            .with_frame(self.service.clone())
            .with_frame(Bytes::from_static(CLIENT_SIGNATURE));
        self.reply.append_to(&mut msg);
        msg
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtocolError> {
        let (service, command) = open_envelope(&mut msg, CLIENT_SIGNATURE)?;
        let service =
            String::from_utf8(service.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("service"))?;
        let reply = Reply::read_after(command, &mut msg)?;
        Ok(Self { service, reply })
    }
}

/// Execution supervisor -> worker, over the worker's private side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorReport {
    Done { job_id: Bytes, payload: Bytes },
    Error { job_id: Bytes, payload: Bytes },
}

impl SupervisorReport {
    pub fn job_id(&self) -> &Bytes {
        match self {
            SupervisorReport::Done { job_id, .. } | SupervisorReport::Error { job_id, .. } => {
                job_id
            }
        }
    }

    pub fn encode(&self) -> Message {
        let (command, job_id, payload) = match self {
            SupervisorReport::Done { job_id, payload } => (Command::JobDone, job_id, payload),
            SupervisorReport::Error { job_id, payload } => (Command::JobError, job_id, payload),
        };
        seal(Bytes::new(), SUPERVISOR_SIGNATURE, command)
            .with_frame(job_id.clone())
            .with_frame(payload.clone())
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtocolError> {
        let (_, command) = open_envelope(&mut msg, SUPERVISOR_SIGNATURE)?;
        let job_id = take(&mut msg, "job_id")?;
        let payload = take(&mut msg, "payload")?;
        finish(&msg)?;
        match command {
            Command::JobDone => Ok(SupervisorReport::Done { job_id, payload }),
            Command::JobError => Ok(SupervisorReport::Error { job_id, payload }),
            other => Err(ProtocolError::UnexpectedCommand(other)),
        }
    }
}

/// Anything the broker's router socket can receive, identity already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerInbound {
    Worker(WorkerMessage),
    Client(ClientMessage),
}

impl BrokerInbound {
    /// Dispatch on the signature frame to the worker or client decoder.
    pub fn decode(msg: Message) -> Result<Self, ProtocolError> {
        if msg.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let signature = msg
            .get(1)
            .ok_or(ProtocolError::MissingFrame("signature"))?
            .clone();
        if signature.as_ref() == WORKER_SIGNATURE {
            WorkerMessage::decode(msg).map(BrokerInbound::Worker)
        } else if signature.as_ref() == CLIENT_SIGNATURE {
            ClientMessage::decode(msg).map(BrokerInbound::Client)
        } else {
            Err(ProtocolError::BadSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &'static str) -> Bytes {
        Bytes::from_static(id.as_bytes())
    }

    #[test]
    fn client_execute_layout_is_fixed() {
        let msg = ClientMessage {
            service: "queue".to_string(),
            request: JobRequest::Execute {
                job_id: job("42"),
                config: Bytes::from_static(br#"{"algorithm":"echo","inputs":{}}"#),
            },
        }
        .encode();

        let frames: Vec<Bytes> = msg.clone().into_frames();
        assert_eq!(frames[0].as_ref(), b"queue");
        assert_eq!(frames[1].as_ref(), CLIENT_SIGNATURE);
        assert_eq!(frames[2].as_ref(), &[Command::Execute.as_byte()]);
        assert_eq!(frames[3].as_ref(), b"42");
        assert_eq!(frames[4].as_ref(), br#"{"algorithm":"echo","inputs":{}}"#);

        let decoded = ClientMessage::decode(msg).unwrap();
        assert_eq!(decoded.service, "queue");
        assert_eq!(decoded.request.job_id().as_ref(), b"42");
    }

    #[test]
    fn service_reply_matches_documented_frames() {
        let msg = ServiceReply {
            service: "queue".to_string(),
            reply: Reply::Received { job_id: job("42") },
        }
        .encode();
        let frames = msg.into_frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].as_ref(), b"queue");
        assert_eq!(frames[1].as_ref(), CLIENT_SIGNATURE);
        assert_eq!(frames[2].as_ref(), &[Command::JobReceived.as_byte()]);
        assert_eq!(frames[3].as_ref(), b"42");
    }

    #[test]
    fn unknown_job_error_is_untagged() {
        let msg = ServiceReply {
            service: "queue".to_string(),
            reply: Reply::unknown_job(b"42"),
        }
        .encode();
        let frames = msg.clone().into_frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3].as_ref(), b"Unknown job: 42");

        let decoded = ServiceReply::decode(msg).unwrap();
        assert_eq!(decoded.reply.job_id(), None);
        assert!(decoded.reply.is_terminal());
    }

    #[test]
    fn tagged_error_keeps_job_id() {
        let mut msg = Message::new();
        Reply::job_error(job("7"), "boom").append_to(&mut msg);
        assert_eq!(msg.len(), 3);
        let reply = Reply::read(&mut msg).unwrap();
        assert_eq!(reply.job_id().map(|j| j.as_ref()), Some(&b"7"[..]));
        assert_eq!(
            reply,
            Reply::Error {
                job_id: Some(job("7")),
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn worker_reply_envelope_carries_client_and_job() {
        let original = WorkerMessage::Reply {
            client: Bytes::from_static(&[9, 9, 9]),
            job_id: job("42"),
            reply: Reply::Done {
                job_id: job("42"),
                result: Bytes::from_static(b"{}"),
            },
        };
        let decoded = WorkerMessage::decode(original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn broker_request_decodes_nested_command() {
        let original = BrokerMessage::Request {
            client: Bytes::from_static(b"c1"),
            request: JobRequest::Cancel { job_id: job("3") },
        };
        let msg = original.encode();
        assert_eq!(msg.get(0).map(|f| f.is_empty()), Some(true));
        assert_eq!(BrokerMessage::decode(msg).unwrap(), original);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut msg = WorkerMessage::Heartbeat.encode();
        // client decoder must not accept the worker family
        assert_eq!(
            ClientMessage::decode(msg.clone()).unwrap_err(),
            ProtocolError::BadSignature
        );
        msg.pop_front();
        msg.push_front("x");
        assert!(WorkerMessage::decode(msg).is_ok());

        let garbage = Message::from_frames(["", "NOPE01", "\u{1}"]);
        assert_eq!(
            BrokerInbound::decode(garbage).unwrap_err(),
            ProtocolError::BadSignature
        );
    }

    #[test]
    fn empty_and_short_messages_are_rejected() {
        assert_eq!(
            BrokerInbound::decode(Message::new()).unwrap_err(),
            ProtocolError::Empty
        );
        assert_eq!(
            BrokerInbound::decode(Message::from_frames(["queue"])).unwrap_err(),
            ProtocolError::MissingFrame("signature")
        );
        let no_command = Message::new()
            .with_frame("")
            .with_frame(Bytes::from_static(WORKER_SIGNATURE));
        assert_eq!(
            WorkerMessage::decode(no_command).unwrap_err(),
            ProtocolError::MissingFrame("command")
        );
    }

    #[test]
    fn unknown_and_misdirected_commands_are_rejected() {
        let unknown = Message::new()
            .with_frame("")
            .with_frame(Bytes::from_static(WORKER_SIGNATURE))
            .with_frame(Bytes::from_static(&[0x7f]));
        assert_eq!(
            WorkerMessage::decode(unknown).unwrap_err(),
            ProtocolError::UnknownCommand(0x7f)
        );

        // REQUEST only flows broker -> worker
        let misdirected = Message::new()
            .with_frame("")
            .with_frame(Bytes::from_static(WORKER_SIGNATURE))
            .with_frame(Command::Request.frame());
        assert_eq!(
            WorkerMessage::decode(misdirected).unwrap_err(),
            ProtocolError::UnexpectedCommand(Command::Request)
        );

        let two_bytes = Message::new()
            .with_frame("")
            .with_frame(Bytes::from_static(WORKER_SIGNATURE))
            .with_frame(Bytes::from_static(&[0x01, 0x02]));
        assert_eq!(
            WorkerMessage::decode(two_bytes).unwrap_err(),
            ProtocolError::MalformedCommand
        );
    }

    #[test]
    fn trailing_frames_are_rejected() {
        let msg = WorkerMessage::Heartbeat.encode().with_frame("extra");
        assert_eq!(
            WorkerMessage::decode(msg).unwrap_err(),
            ProtocolError::TrailingFrames(1)
        );
    }

    #[test]
    fn ready_requires_service_name() {
        let msg = WorkerMessage::Ready {
            service: String::new(),
            name: "w".to_string(),
        }
        .encode();
        assert_eq!(
            WorkerMessage::decode(msg).unwrap_err(),
            ProtocolError::EmptyService
        );
    }

    #[test]
    fn supervisor_report_round_trip_and_job_error_command() {
        let report = SupervisorReport::Error {
            job_id: job("5"),
            payload: Bytes::from_static(b"no such algorithm"),
        };
        let msg = report.encode();
        assert_eq!(msg.get(2).map(|f| f.as_ref()), Some(&[0x25u8][..]));
        assert_eq!(SupervisorReport::decode(msg).unwrap(), report);
    }

    #[test]
    fn inbound_routes_by_signature() {
        let worker = WorkerMessage::Ready {
            service: "queue".to_string(),
            name: "w1".to_string(),
        };
        assert_eq!(
            BrokerInbound::decode(worker.encode()).unwrap(),
            BrokerInbound::Worker(worker)
        );

        let client = ClientMessage {
            service: "queue".to_string(),
            request: JobRequest::Cancel { job_id: job("1") },
        };
        assert_eq!(
            BrokerInbound::decode(client.encode()).unwrap(),
            BrokerInbound::Client(client)
        );
    }
}
