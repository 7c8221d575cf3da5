use bytes::Bytes;

/// Signature frame carried by every worker <-> broker message.
pub const WORKER_SIGNATURE: &[u8] = b"JDPW01";
/// Signature frame carried by every client <-> broker message.
pub const CLIENT_SIGNATURE: &[u8] = b"JDPC01";
/// Signature frame carried on the worker's private side channel.
pub const SUPERVISOR_SIGNATURE: &[u8] = b"JDPS01";

/// Single-byte command discriminants shared by every role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    // Worker <-> broker control
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    Heartbeat = 0x04,
    Disconnect = 0x05,

    // Client requests
    Execute = 0x10,
    Cancel = 0x11,

    // Status replies
    JobReceived = 0x20,
    JobStarted = 0x21,
    JobDone = 0x22,
    JobCancelled = 0x23,
    Error = 0x24,

    // Side channel only
    JobError = 0x25,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let command = match byte {
            0x01 => Command::Ready,
            0x02 => Command::Request,
            0x03 => Command::Reply,
            0x04 => Command::Heartbeat,
            0x05 => Command::Disconnect,
            0x10 => Command::Execute,
            0x11 => Command::Cancel,
            0x20 => Command::JobReceived,
            0x21 => Command::JobStarted,
            0x22 => Command::JobDone,
            0x23 => Command::JobCancelled,
            0x24 => Command::Error,
            0x25 => Command::JobError,
            _ => return None,
        };
        Some(command)
    }

    /// The one-byte frame carrying this command
    pub fn frame(self) -> Bytes {
        Bytes::copy_from_slice(&[self.as_byte()])
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Ready => "READY",
            Command::Request => "REQUEST",
            Command::Reply => "REPLY",
            Command::Heartbeat => "HEARTBEAT",
            Command::Disconnect => "DISCONNECT",
            Command::Execute => "EXECUTE",
            Command::Cancel => "CANCEL",
            Command::JobReceived => "JOB_RECEIVED",
            Command::JobStarted => "JOB_STARTED",
            Command::JobDone => "JOB_DONE",
            Command::JobCancelled => "JOB_CANCELLED",
            Command::Error => "ERROR",
            Command::JobError => "JOB_ERROR",
        };
        write!(f, "{}", name)
    }
}
