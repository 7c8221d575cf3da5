use std::collections::VecDeque;

use bytes::Bytes;

/// An ordered sequence of opaque binary frames.
///
/// On a router socket frame 0 is the routing identity of the peer the message
/// came from (or is going to).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: VecDeque<Bytes>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames<I, F>(frames: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Bytes>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    /// Builder-style append
    pub fn with_frame(mut self, frame: impl Into<Bytes>) -> Self {
        self.frames.push_back(frame.into());
        self
    }

    pub fn push_back(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_back(frame.into());
    }

    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_front(frame.into());
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.frames.front()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    /// Total payload size across all frames
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames.into()
    }
}
