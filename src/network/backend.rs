//! Transport backend contract
//!
//! A backend produces sessions, a session produces streams, and a stream
//! moves opaque frames in one direction. The registry owns every object a
//! backend hands out and addresses them by handle; backends never see handles.

use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::TransportError;

/// Direction of a stream, seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Send,
    Receive,
}

impl StreamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamDirection::Send => "send",
            StreamDirection::Receive => "receive",
        }
    }
}

impl TryFrom<u8> for StreamDirection {
    type Error = TransportError;

    /// 0 is receive, 1 is send
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamDirection::Receive),
            1 => Ok(StreamDirection::Send),
            _ => Err(TransportError::InvalidPacket),
        }
    }
}

/// One frame delivered by a receive stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Factory for sessions of one transport technology
pub trait TransportBackend: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    fn create_session(&self, local: SocketAddr) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// A live session, bound to one local endpoint
pub trait TransportSession: Send {
    fn local_endpoint(&self) -> SocketAddr;

    fn create_stream(
        &mut self,
        port: u16,
        direction: StreamDirection,
    ) -> Result<Box<dyn TransportStream>, TransportError>;
}

/// A live stream moving frames in one direction
pub trait TransportStream: Send {
    fn direction(&self) -> StreamDirection;

    fn port(&self) -> u16;

    /// Send one frame. Only valid on send streams.
    fn push_frame(&mut self, payload: &[u8], timestamp: u32) -> Result<(), TransportError>;

    /// Next received frame, if one is waiting. Only valid on receive streams.
    fn pull_frame(&mut self) -> Result<Option<ReceivedFrame>, TransportError>;
}
