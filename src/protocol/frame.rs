use std::borrow::Cow;
use std::collections::VecDeque;

use bytes::Bytes;
use zeromq::{SocketRecv, SocketSend, ZmqMessage};

use crate::error::{FrameError, Result};

/// An ordered stack of opaque frames, outermost (envelope) first.
///
/// The codec knows nothing about jobs: it only pushes and pops envelope
/// frames and reads or replaces the innermost frame, the body.
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

    /// Message with a single body frame.
    pub fn with_body(body: impl Into<Bytes>) -> Self {
        let mut msg = Self::new();
        msg.push_back(body);
        msg
    }

    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_front(frame.into());
    }

    pub fn push_back(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_back(frame.into());
    }

    pub fn pop_front(&mut self) -> std::result::Result<Bytes, FrameError> {
        self.frames.pop_front().ok_or(FrameError::Empty)
    }

    /// Drop a leading empty delimiter frame, if any. Returns whether one
    /// was present.
    pub fn strip_delimiter(&mut self) -> bool {
        if self.frames.len() > 1 && self.frames.front().is_some_and(|f| f.is_empty()) {
            self.frames.pop_front();
            true
        } else {
            false
        }
    }

    /// Replace the innermost frame, or add one to an empty message.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        match self.frames.back_mut() {
            Some(last) => *last = body.into(),
            None => self.frames.push_back(body.into()),
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.frames.back()
    }

    /// The body decoded lossily as UTF-8; empty when there is no body.
    pub fn body_str(&self) -> Cow<'_, str> {
        match self.frames.back() {
            Some(body) => String::from_utf8_lossy(body),
            None => Cow::Borrowed(""),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames.into()
    }

    /// Send the message as one multipart transport message.
    pub async fn send<S: SocketSend>(self, socket: &mut S) -> Result<()> {
        let zmsg = ZmqMessage::try_from(self)?;
        socket.send(zmsg).await?;
        Ok(())
    }

    /// Receive one multipart transport message.
    pub async fn recv<S: SocketRecv>(socket: &mut S) -> Result<Message> {
        let zmsg = socket.recv().await?;
        Ok(Message::from(zmsg))
    }
}

impl From<ZmqMessage> for Message {
    fn from(zmsg: ZmqMessage) -> Self {
        Self::from_frames(zmsg.into_vec())
    }
}

impl TryFrom<Message> for ZmqMessage {
    type Error = FrameError;

    fn try_from(msg: Message) -> std::result::Result<Self, Self::Error> {
        let mut frames = msg.frames.into_iter();
        let first = frames.next().ok_or(FrameError::Empty)?;
        let mut zmsg = ZmqMessage::from(first);
        for frame in frames {
            zmsg.push_back(frame);
        }
        Ok(zmsg)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            match std::str::from_utf8(frame) {
                Ok(s) if !s.chars().any(char::is_control) => write!(f, "{:?}", s)?,
                _ => write!(f, "0x{}", hex::encode(frame))?,
            }
        }
        Ok(())
    }
}
