//! Error types for the conferencing data plane

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Mixer error: {0}")]
    Mix(#[from] MixError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reblocking buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer overflow: {requested} samples requested, {free} free")]
    Overflow { requested: usize, free: usize },

    #[error("Buffer underrun: {needed} samples needed, {available} buffered")]
    Underrun { needed: usize, available: usize },

    #[error("Output slice too small: {0} samples")]
    OutputTooSmall(usize),

    #[error("Invalid layout: {channels} channels, block size {block_size}")]
    InvalidLayout { channels: u16, block_size: usize },
}

/// Mixer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    #[error("Block of {len} samples, mixer expects {expected}")]
    BlockSize { len: usize, expected: usize },
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Channel unit {index} out of range ({count} units)")]
    ChannelOutOfRange { index: usize, count: usize },

    #[error("Decoded {decoded} samples, expected at most {expected}")]
    Oversized { decoded: usize, expected: usize },
}

/// Transport and registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown session handle: {0}")]
    UnknownSession(u64),

    #[error("Unknown stream handle: {0}")]
    UnknownStream(u64),

    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    #[error("Stream is not a {0} stream")]
    WrongDirection(&'static str),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("Codec already attached to stream {0}")]
    CodecAlreadyAttached(u64),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
