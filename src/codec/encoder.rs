//! Opus encoder wrapper
//!
//! One encoder covers one channel unit (mono or stereo) of one participant.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::{CodecApplication, DataPlaneConfig};
use crate::constants::MAX_OPUS_PACKET_SIZE;
use crate::error::CodecError;

pub(crate) fn opus_channels(channels: u16) -> Result<Channels, String> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(format!("Unsupported channel count: {}", channels)),
    }
}

/// Stateful Opus encoder for one channel unit
pub struct OpusEncoder {
    encoder: Encoder,
    channels: u16,
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create an encoder for `channels` (1 or 2) interleaved channels
    pub fn new(config: &DataPlaneConfig, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = opus_channels(channels).map_err(CodecError::EncoderInit)?;

        let application = match config.application {
            CodecApplication::Voice => Application::Voip,
            CodecApplication::Audio => Application::Audio,
        };

        let mut encoder = Encoder::new(config.sample_rate, opus_channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, config)?;

        Ok(Self {
            encoder,
            channels,
            frame_size: config.block_size,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET_SIZE],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &DataPlaneConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(10)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Encode one block of interleaved samples.
    ///
    /// The returned payload is sized to what the encoder produced.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Drop prediction history, e.g. after a seek
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Expected frame size in samples per channel
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Expected total samples per frame (all channels)
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_creation() {
        let config = DataPlaneConfig::default();
        let encoder = OpusEncoder::new(&config, 2).unwrap();
        assert_eq!(encoder.samples_per_frame(), 960);
        assert!(OpusEncoder::new(&config, 3).is_err());
    }

    #[test]
    fn test_encoding_silence() {
        let config = DataPlaneConfig::default();
        let mut encoder = OpusEncoder::new(&config, 1).unwrap();
        let encoded = encoder.encode(&vec![0.0f32; 480]).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < 480 * 4);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_wrong_frame_size() {
        let config = DataPlaneConfig::default();
        let mut encoder = OpusEncoder::new(&config, 2).unwrap();
        let result = encoder.encode(&[0.0; 100]);
        assert_eq!(result, Err(CodecError::InvalidFrameSize(100)));
    }
}
