//! In-process transport backend
//!
//! Streams are wired through a shared hub keyed by port: a receive stream
//! listens on its port, a send stream delivers to whatever listens on its
//! port. Frames travel in the single-frame wire layout so the framing code is
//! exercised end to end.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TransportError;
use crate::network::backend::{
    ReceivedFrame, StreamDirection, TransportBackend, TransportSession, TransportStream,
};
use crate::network::framing::{decode_single, encode_single};

/// Frames queued per receive stream before sends start failing
pub const LOOPBACK_QUEUE_DEPTH: usize = 256;

type Hub = Arc<Mutex<HashMap<u16, Sender<Bytes>>>>;

/// Backend connecting streams inside one process
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    hub: Hub,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports with a live receive stream
    pub fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.hub.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl TransportBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create_session(&self, local: SocketAddr) -> Result<Box<dyn TransportSession>, TransportError> {
        Ok(Box::new(LoopbackSession {
            hub: self.hub.clone(),
            local,
        }))
    }
}

struct LoopbackSession {
    hub: Hub,
    local: SocketAddr,
}

impl TransportSession for LoopbackSession {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn create_stream(
        &mut self,
        port: u16,
        direction: StreamDirection,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        match direction {
            StreamDirection::Send => Ok(Box::new(LoopbackStream {
                hub: self.hub.clone(),
                port,
                direction,
                rx: None,
            })),
            StreamDirection::Receive => {
                let mut hub = self.hub.lock();
                if hub.contains_key(&port) {
                    return Err(TransportError::BindFailed(format!(
                        "loopback port {} already has a listener",
                        port
                    )));
                }
                let (tx, rx) = bounded(LOOPBACK_QUEUE_DEPTH);
                hub.insert(port, tx);
                Ok(Box::new(LoopbackStream {
                    hub: self.hub.clone(),
                    port,
                    direction,
                    rx: Some(rx),
                }))
            }
        }
    }
}

struct LoopbackStream {
    hub: Hub,
    port: u16,
    direction: StreamDirection,
    rx: Option<Receiver<Bytes>>,
}

impl TransportStream for LoopbackStream {
    fn direction(&self) -> StreamDirection {
        self.direction
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn push_frame(&mut self, payload: &[u8], timestamp: u32) -> Result<(), TransportError> {
        if self.direction != StreamDirection::Send {
            return Err(TransportError::WrongDirection("send"));
        }
        let hub = self.hub.lock();
        let tx = hub
            .get(&self.port)
            .ok_or_else(|| TransportError::SendFailed(format!("no listener on port {}", self.port)))?;
        tx.try_send(encode_single(timestamp, payload)).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::SendFailed("queue full".into()),
            TrySendError::Disconnected(_) => TransportError::SendFailed("listener gone".into()),
        })
    }

    fn pull_frame(&mut self) -> Result<Option<ReceivedFrame>, TransportError> {
        let rx = self.rx.as_ref().ok_or(TransportError::WrongDirection("receive"))?;
        match rx.try_recv() {
            Ok(datagram) => {
                let (timestamp, payload) = decode_single(&datagram)?;
                Ok(Some(ReceivedFrame { timestamp, payload }))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(TransportError::ReceiveFailed("loopback hub closed".into()))
            }
        }
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.hub.lock().remove(&self.port);
        }
    }
}
