//! UDP transport backend
//!
//! Each session binds one non-blocking socket on its local endpoint and sends
//! from it; each receive stream binds its own socket on the session's address
//! at the stream's port. Send streams target the configured remote host at the
//! stream's port.

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::constants::SINGLE_HEADER_LEN;
use crate::error::TransportError;
use crate::network::backend::{
    ReceivedFrame, StreamDirection, TransportBackend, TransportSession, TransportStream,
};
use crate::network::framing::{decode_single, encode_single, Chunker, Reassembler};

/// Datagram layout used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// `[timestamp][payload]`; frames larger than one transport unit are refused
    Single,
    /// The single-frame bytes split into `[count][index][participant low8][chunk]` datagrams
    Chunked { participant: u32 },
}

/// Create a non-blocking UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
    Ok(socket.into())
}

/// Backend sending to one remote host over UDP
#[derive(Debug, Clone)]
pub struct UdpBackend {
    remote: IpAddr,
    max_transport_unit: usize,
    framing: FramingMode,
}

impl UdpBackend {
    pub fn new(remote: IpAddr, max_transport_unit: usize, framing: FramingMode) -> Self {
        Self {
            remote,
            max_transport_unit,
            framing,
        }
    }
}

impl TransportBackend for UdpBackend {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn create_session(&self, local: SocketAddr) -> Result<Box<dyn TransportSession>, TransportError> {
        let socket = create_socket(local)?;
        let local = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        tracing::debug!(%local, remote = %self.remote, "udp session bound");
        Ok(Box::new(UdpSession {
            socket: Arc::new(socket),
            local,
            backend: self.clone(),
        }))
    }
}

struct UdpSession {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    backend: UdpBackend,
}

impl TransportSession for UdpSession {
    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn create_stream(
        &mut self,
        port: u16,
        direction: StreamDirection,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        let mtu = self.backend.max_transport_unit;
        match direction {
            StreamDirection::Send => Ok(Box::new(UdpSendStream {
                socket: self.socket.clone(),
                target: SocketAddr::new(self.backend.remote, port),
                mtu,
                framing: self.backend.framing,
            })),
            StreamDirection::Receive => {
                let socket = create_socket(SocketAddr::new(self.local.ip(), port))?;
                Ok(Box::new(UdpReceiveStream {
                    socket,
                    port,
                    framing: self.backend.framing,
                    reassembler: Reassembler::new(),
                    buffer: vec![0u8; 65536],
                }))
            }
        }
    }
}

struct UdpSendStream {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    mtu: usize,
    framing: FramingMode,
}

impl UdpSendStream {
    fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(datagram, self.target)
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", self.target, e)))
    }
}

impl TransportStream for UdpSendStream {
    fn direction(&self) -> StreamDirection {
        StreamDirection::Send
    }

    fn port(&self) -> u16 {
        self.target.port()
    }

    fn push_frame(&mut self, payload: &[u8], timestamp: u32) -> Result<(), TransportError> {
        let frame = encode_single(timestamp, payload);
        match self.framing {
            FramingMode::Single => {
                if frame.len() > self.mtu {
                    return Err(TransportError::PacketTooLarge(frame.len()));
                }
                self.send(&frame)
            }
            FramingMode::Chunked { participant } => {
                for chunk in Chunker::new(self.mtu).split(&frame, participant)? {
                    self.send(&chunk)?;
                }
                Ok(())
            }
        }
    }

    fn pull_frame(&mut self) -> Result<Option<ReceivedFrame>, TransportError> {
        Err(TransportError::WrongDirection("receive"))
    }
}

struct UdpReceiveStream {
    socket: UdpSocket,
    port: u16,
    framing: FramingMode,
    reassembler: Reassembler,
    buffer: Vec<u8>,
}

impl TransportStream for UdpReceiveStream {
    fn direction(&self) -> StreamDirection {
        StreamDirection::Receive
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn push_frame(&mut self, _payload: &[u8], _timestamp: u32) -> Result<(), TransportError> {
        Err(TransportError::WrongDirection("send"))
    }

    fn pull_frame(&mut self) -> Result<Option<ReceivedFrame>, TransportError> {
        loop {
            let len = match self.socket.recv_from(&mut self.buffer) {
                Ok((len, _from)) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };
            let datagram = &self.buffer[..len];

            let frame = match self.framing {
                FramingMode::Single => Bytes::copy_from_slice(datagram),
                FramingMode::Chunked { .. } => match self.reassembler.accept(datagram) {
                    Ok(Some((_tag, frame))) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::trace!(port = self.port, error = %e, "dropping malformed chunk");
                        continue;
                    }
                },
            };

            if frame.len() < SINGLE_HEADER_LEN {
                tracing::trace!(port = self.port, len = frame.len(), "dropping short datagram");
                continue;
            }
            let (timestamp, payload) = decode_single(&frame)?;
            return Ok(Some(ReceivedFrame { timestamp, payload }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pull_with_timeout(stream: &mut Box<dyn TransportStream>) -> Option<ReceivedFrame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(frame) = stream.pull_frame().unwrap() {
                return Some(frame);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn free_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[test]
    fn test_udp_single_frame() {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let backend = UdpBackend::new(localhost, 1200, FramingMode::Single);
        let mut session = backend
            .create_session("127.0.0.1:0".parse().unwrap())
            .unwrap();

        let port = free_port();
        let mut rx = session.create_stream(port, StreamDirection::Receive).unwrap();
        let mut tx = session.create_stream(port, StreamDirection::Send).unwrap();

        tx.push_frame(&[5, 6, 7], 960).unwrap();
        let frame = pull_with_timeout(&mut rx).unwrap();
        assert_eq!(frame.timestamp, 960);
        assert_eq!(&frame.payload[..], &[5, 6, 7]);
    }

    #[test]
    fn test_udp_chunked_frame() {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let backend = UdpBackend::new(localhost, 16, FramingMode::Chunked { participant: 3 });
        let mut session = backend
            .create_session("127.0.0.1:0".parse().unwrap())
            .unwrap();

        let port = free_port();
        let mut rx = session.create_stream(port, StreamDirection::Receive).unwrap();
        let mut tx = session.create_stream(port, StreamDirection::Send).unwrap();

        let payload: Vec<u8> = (0..40).collect();
        tx.push_frame(&payload, 7).unwrap();
        let frame = pull_with_timeout(&mut rx).unwrap();
        assert_eq!(frame.timestamp, 7);
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_single_frame_too_large() {
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        let backend = UdpBackend::new(localhost, 8, FramingMode::Single);
        let mut session = backend
            .create_session("127.0.0.1:0".parse().unwrap())
            .unwrap();
        let mut tx = session.create_stream(free_port(), StreamDirection::Send).unwrap();
        assert_eq!(tx.push_frame(&[0; 5], 0), Err(TransportError::PacketTooLarge(9)));
    }
}
