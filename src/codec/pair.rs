//! Per-participant codec pair
//!
//! A participant's channels are grouped into units of at most two
//! (`[0, 1]`, `[2, 3]`, ...). Each unit has its own encoder and decoder, so
//! an N-channel participant owns `ceil(N / 2)` of each. The pair has no lock
//! of its own: exactly one thread may drive it at a time.

use bytes::Bytes;

use crate::codec::decoder::{DecoderStats, OpusDecoder};
use crate::codec::encoder::{EncoderStats, OpusEncoder};
use crate::config::DataPlaneConfig;
use crate::error::CodecError;

/// Encoder and decoder state for one participant
pub struct CodecPair {
    owner: u32,
    channels: u16,
    block_size: usize,
    encoders: Vec<OpusEncoder>,
    decoders: Vec<OpusDecoder>,
}

impl CodecPair {
    /// Create codec state for `owner` covering `channels` channels
    pub fn new(owner: u32, config: &DataPlaneConfig, channels: u16) -> Result<Self, CodecError> {
        if channels == 0 {
            return Err(CodecError::EncoderInit("zero channels".into()));
        }
        let units = (channels as usize).div_ceil(2);
        let mut encoders = Vec::with_capacity(units);
        let mut decoders = Vec::with_capacity(units);
        for unit in 0..units {
            let width = unit_width(channels, unit);
            encoders.push(OpusEncoder::new(config, width)?);
            decoders.push(OpusDecoder::new(config, width)?);
        }

        tracing::debug!(owner, channels, units, "codec pair created");

        Ok(Self {
            owner,
            channels,
            block_size: config.block_size,
            encoders,
            decoders,
        })
    }

    /// Encode one block of unit `index` (interleaved if the unit is stereo)
    pub fn encode_channel(&mut self, samples: &[f32], index: usize) -> Result<Bytes, CodecError> {
        let owner = self.owner;
        let count = self.encoders.len();
        let Some(encoder) = self.encoders.get_mut(index) else {
            tracing::warn!(owner, index, count, "encode on unknown channel unit");
            return Err(CodecError::ChannelOutOfRange { index, count });
        };

        encoder.encode(samples).inspect_err(|e| {
            tracing::warn!(owner, index, error = %e, "encode failed");
        })
    }

    /// Decode one frame of unit `index` into interleaved samples
    pub fn decode_channel(&mut self, bytes: &[u8], index: usize) -> Result<&[f32], CodecError> {
        let owner = self.owner;
        let count = self.decoders.len();
        let Some(decoder) = self.decoders.get_mut(index) else {
            tracing::warn!(owner, index, count, "decode on unknown channel unit");
            return Err(CodecError::ChannelOutOfRange { index, count });
        };

        match decoder.decode(bytes) {
            Ok(samples) => Ok(samples),
            Err(e) => {
                tracing::warn!(owner, index, len = bytes.len(), error = %e, "decode failed");
                Err(e)
            }
        }
    }

    /// Concealment block for unit `index` when a frame never arrived
    pub fn conceal_channel(&mut self, index: usize) -> Result<&[f32], CodecError> {
        let count = self.decoders.len();
        self.decoders
            .get_mut(index)
            .ok_or(CodecError::ChannelOutOfRange { index, count })?
            .decode_missing()
    }

    /// Reset every encoder and decoder
    pub fn reset(&mut self) -> Result<(), CodecError> {
        for encoder in &mut self.encoders {
            encoder.reset()?;
        }
        for decoder in &mut self.decoders {
            decoder.reset()?;
        }
        Ok(())
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of encoder/decoder units
    pub fn unit_count(&self) -> usize {
        self.encoders.len()
    }

    /// Channels carried by unit `index`
    pub fn unit_channels(&self, index: usize) -> Option<u16> {
        self.encoders.get(index).map(OpusEncoder::channels)
    }

    pub fn encoder_stats(&self) -> Vec<EncoderStats> {
        self.encoders.iter().map(OpusEncoder::stats).collect()
    }

    pub fn decoder_stats(&self) -> Vec<DecoderStats> {
        self.decoders.iter().map(OpusDecoder::stats).collect()
    }
}

impl std::fmt::Debug for CodecPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPair")
            .field("owner", &self.owner)
            .field("channels", &self.channels)
            .field("units", &self.encoders.len())
            .finish()
    }
}

/// Channels in unit `unit` of a `channels`-wide layout
pub fn unit_width(channels: u16, unit: usize) -> u16 {
    (channels as usize - unit * 2).min(2) as u16
}
