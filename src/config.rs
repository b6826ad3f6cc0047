//! Data-plane configuration
//!
//! The values here are handed over by the host's configuration layer;
//! loading them from disk happens elsewhere. [`DataPlaneConfig::from_toml_str`]
//! accepts the TOML text once it has been read.

use serde::{Deserialize, Serialize};

use crate::audio::block::TimeIndex;
use crate::constants::*;
use crate::error::Error;

/// Opus application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecApplication {
    /// Speech-optimised (VoIP)
    #[default]
    Voice,
    /// General audio / music
    Audio,
}

/// Configuration consumed by the mixer, codec pairs and reblocking buffers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    /// Codec block size in samples per channel
    pub block_size: usize,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Host channel count
    pub channels: u16,
    /// Downmix host audio to a single network channel
    pub mono_downmix: bool,
    /// Opus application mode
    pub application: CodecApplication,
    /// Host block size in samples per channel
    pub host_block_size: usize,
    /// Encoder bitrate in bits per second
    pub bitrate: u32,
    /// In-band forward error correction
    pub fec: bool,
    /// Largest datagram handed to a byte-oriented transport
    pub max_transport_unit: usize,
    /// Reblocking buffer capacity, in codec or host blocks (whichever is larger)
    pub reblock_capacity_blocks: usize,
    /// Codec blocks between a host time and the mix rendered at that time.
    /// Leaves room for peers whose blocks for a time index arrive a few
    /// ticks after the local block.
    pub playout_latency_blocks: usize,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            mono_downmix: false,
            application: CodecApplication::Voice,
            host_block_size: DEFAULT_HOST_BLOCK_SIZE,
            bitrate: DEFAULT_BITRATE,
            fec: false,
            max_transport_unit: MAX_TRANSPORT_UNIT,
            reblock_capacity_blocks: 16,
            playout_latency_blocks: 3,
        }
    }
}

impl DataPlaneConfig {
    /// Parse a configuration from TOML text, filling unspecified keys with defaults
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the data plane cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 || self.host_block_size == 0 {
            return Err(Error::Config("block sizes must be non-zero".into()));
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(Error::Config(format!(
                "channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if !is_valid_opus_frame_size(self.block_size, self.sample_rate) {
            return Err(Error::Config(format!(
                "block size {} is not a valid Opus frame at {} Hz",
                self.block_size, self.sample_rate
            )));
        }
        if self.max_transport_unit <= CHUNK_HEADER_LEN {
            return Err(Error::Config(format!(
                "transport unit {} leaves no room for payload",
                self.max_transport_unit
            )));
        }
        if self.reblock_capacity_blocks < 2 {
            return Err(Error::Config("reblock capacity must hold at least 2 blocks".into()));
        }
        if self.playout_latency_blocks >= self.reblock_capacity_blocks {
            return Err(Error::Config(format!(
                "playout latency of {} blocks exceeds the reblock capacity",
                self.playout_latency_blocks
            )));
        }
        Ok(())
    }

    /// Channels carried over the network
    pub fn network_channels(&self) -> u16 {
        if self.mono_downmix {
            1
        } else {
            self.channels
        }
    }

    /// Block duration in milliseconds
    pub fn block_duration_ms(&self) -> f32 {
        self.block_size as f32 * 1000.0 / self.sample_rate as f32
    }

    /// Playout latency in frames
    pub fn playout_latency_frames(&self) -> TimeIndex {
        (self.playout_latency_blocks * self.block_size) as TimeIndex
    }

    /// Reblocking capacity in frames for a buffer moving between the two block sizes
    pub fn reblock_capacity_frames(&self) -> usize {
        self.block_size.max(self.host_block_size) * self.reblock_capacity_blocks
    }
}

const VALID_FRAME_DURATIONS_MS: [f64; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

/// Whether `samples_per_channel` is a frame length Opus accepts at `sample_rate`
pub fn is_valid_opus_frame_size(samples_per_channel: usize, sample_rate: u32) -> bool {
    VALID_FRAME_DURATIONS_MS
        .iter()
        .any(|&ms| (sample_rate as f64 * ms / 1000.0) as usize == samples_per_channel)
}
