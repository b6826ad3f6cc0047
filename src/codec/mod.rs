//! Opus codec wrappers
//!
//! Stateful per-unit encoders and decoders, grouped per participant
//! into a [`CodecPair`].

pub mod decoder;
pub mod encoder;
pub mod pair;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use pair::CodecPair;
