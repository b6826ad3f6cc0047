//! # Mix-minus Data Plane
//!
//! Real-time data plane of a multi-party audio conference. Every participant
//! receives the sum of everybody else ("mix-minus-self"), computed
//! incrementally per time index and shipped as Opus frames over a
//! handle-addressed transport.
//!
//! ## Architecture Overview
//!
//! ```text
//!  host audio (host block size)                       remote peers
//!         │                                                 │
//!         ▼                                                 ▼
//!  ┌──────────────┐                              ┌────────────────────┐
//!  │ Reblocking   │ host → codec block           │ TransportRegistry  │
//!  │ Buffer (tx)  │                              │ pull_frame(handle) │
//!  └──────┬───────┘                              └─────────┬──────────┘
//!         │                                                │ Opus bytes
//!         ▼                                                ▼
//!  ┌──────────────────────────────────────┐      ┌────────────────────┐
//!  │ PerSourceMixer (one per channel)     │◀─────│ CodecPair.decode   │
//!  │  column[t][idx]  row[t] = Σ column   │      └────────────────────┘
//!  │  delta(p) = row[t] − column[t][p]    │
//!  └──────┬──────────────────────┬────────┘
//!         │ per-destination      │ own mix-minus-self
//!         ▼                      ▼
//!  ┌──────────────┐      ┌──────────────┐
//!  │ CodecPair    │      │ Reblocking   │ codec → host block
//!  │ .encode      │      │ Buffer (rx)  │
//!  └──────┬───────┘      └──────┬───────┘
//!         ▼                     ▼
//!  TransportRegistry       host playback
//!  .push_frame(handle)
//! ```

pub mod audio;
pub mod codec;
pub mod conference;
pub mod config;
pub mod error;
pub mod network;

pub use error::{Error, Result};

/// Crate-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Largest channel count a conference accepts
    pub const MAX_CHANNELS: u16 = 8;

    /// Default codec block size in samples per channel (10 ms at 48 kHz)
    pub const DEFAULT_BLOCK_SIZE: usize = 480;

    /// Default host block size in samples per channel
    pub const DEFAULT_HOST_BLOCK_SIZE: usize = 512;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Largest datagram handed to a byte-oriented transport
    pub const MAX_TRANSPORT_UNIT: usize = 1200;

    /// Bytes of timestamp in front of a single-frame payload
    pub const SINGLE_HEADER_LEN: usize = 4;

    /// Bytes of header in front of every chunk of a chunked send
    pub const CHUNK_HEADER_LEN: usize = 3;

    /// Encoder scratch buffer size (max Opus packet is about 1275 bytes)
    pub const MAX_OPUS_PACKET_SIZE: usize = 4000;
}
