//! Transport plumbing: wire framing, backends and the handle registry

pub mod backend;
pub mod framing;
pub mod loopback;
pub mod registry;
#[cfg(feature = "udp")]
pub mod udp;

pub use backend::{ReceivedFrame, StreamDirection, TransportBackend, TransportSession, TransportStream};
pub use loopback::LoopbackBackend;
pub use registry::{SessionHandle, StreamHandle, StreamState, TransportRegistry};
#[cfg(feature = "udp")]
pub use udp::{create_socket, FramingMode, UdpBackend};
