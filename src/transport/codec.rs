use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::Message;
use crate::transport::TransportError;

const LEN_PREFIX: usize = 4;

pub const DEFAULT_MAX_FRAMES: usize = 64;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Upper bounds applied to every message read from or written to a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frames: usize,
    pub max_message_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Length-prefixed multipart record:
///
/// ```text
/// [count:u32_be] ([len:u32_be][bytes...]) * count
/// ```
#[derive(Debug, Clone, Default)]
pub struct MultipartCodec {
    limits: FrameLimits,
}

impl MultipartCodec {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

fn read_u32_be(src: &[u8], at: usize) -> Option<usize> {
    let raw: [u8; 4] = src.get(at..at + LEN_PREFIX)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw) as usize)
}

impl Decoder for MultipartCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        let Some(count) = read_u32_be(src, 0) else {
            return Ok(None);
        };
        if count > self.limits.max_frames {
            return Err(TransportError::TooManyFrames(count, self.limits.max_frames));
        }

        // Walk the length prefixes without consuming until the whole record is buffered.
        let mut offset = LEN_PREFIX;
        let mut payload = 0usize;
        for _ in 0..count {
            let Some(len) = read_u32_be(src, offset) else {
                return Ok(None);
            };
            payload += len;
            if payload > self.limits.max_message_bytes {
                return Err(TransportError::MessageTooLarge(
                    payload,
                    self.limits.max_message_bytes,
                ));
            }
            offset += LEN_PREFIX + len;
            if src.len() < offset {
                src.reserve(offset - src.len());
                return Ok(None);
            }
        }

        src.advance(LEN_PREFIX);
        let mut msg = Message::new();
        for _ in 0..count {
            let len = src.get_u32() as usize;
            msg.push_back(src.split_to(len).freeze());
        }
        Ok(Some(msg))
    }
}

impl Encoder<Message> for MultipartCodec {
    type Error = TransportError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        if msg.len() > self.limits.max_frames {
            return Err(TransportError::TooManyFrames(
                msg.len(),
                self.limits.max_frames,
            ));
        }
        let payload = msg.byte_len();
        if payload > self.limits.max_message_bytes {
            return Err(TransportError::MessageTooLarge(
                payload,
                self.limits.max_message_bytes,
            ));
        }

        dst.reserve(LEN_PREFIX * (msg.len() + 1) + payload);
        dst.put_u32(msg.len() as u32);
        for frame in msg.frames() {
            dst.put_u32(frame.len() as u32);
            dst.extend_from_slice(frame);
        }
        Ok(())
    }
}
