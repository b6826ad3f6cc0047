//! Opus decoder wrapper

use opus::Decoder;

use crate::codec::encoder::opus_channels;
use crate::config::DataPlaneConfig;
use crate::error::CodecError;

/// Stateful Opus decoder for one channel unit
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer, one block of all channels
    decode_buffer: Vec<f32>,
    frames_decoded: u64,
    frames_lost: u64,
}

impl OpusDecoder {
    pub fn new(config: &DataPlaneConfig, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = opus_channels(channels).map_err(CodecError::DecoderInit)?;

        let decoder = Decoder::new(config.sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate: config.sample_rate,
            channels,
            frame_size: config.block_size,
            decode_buffer: vec![0.0f32; config.block_size * channels as usize],
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Decode one packet into interleaved samples.
    ///
    /// Packets that would decode to more than one block are rejected.
    pub fn decode(&mut self, data: &[u8]) -> Result<&[f32], CodecError> {
        let expected = self.frame_size;
        let packet_frames = opus::packet::get_nb_samples(data, self.sample_rate)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        if packet_frames > expected {
            return Err(CodecError::Oversized {
                decoded: packet_frames,
                expected,
            });
        }

        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if samples > expected {
            return Err(CodecError::Oversized {
                decoded: samples,
                expected,
            });
        }

        self.frames_decoded += 1;
        Ok(&self.decode_buffer[..samples * self.channels as usize])
    }

    /// Packet loss concealment for one missing block
    pub fn decode_missing(&mut self) -> Result<&[f32], CodecError> {
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(&self.decode_buffer[..samples * self.channels as usize])
    }

    /// Drop prediction history
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusEncoder;

    #[test]
    fn test_encode_decode_roundtrip() {
        let config = DataPlaneConfig::default();
        let mut encoder = OpusEncoder::new(&config, 2).unwrap();
        let mut decoder = OpusDecoder::new(&config, 2).unwrap();

        let mut samples = Vec::with_capacity(960);
        for i in 0..480 {
            let t = i as f32 / 48000.0;
            let val = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            samples.push(val);
            samples.push(val);
        }

        let encoded = encoder.encode(&samples).unwrap();
        let decoded = decoder.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), 960);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let big = DataPlaneConfig {
            block_size: 960,
            ..Default::default()
        };
        let mut encoder = OpusEncoder::new(&big, 1).unwrap();
        let packet = encoder.encode(&vec![0.0; 960]).unwrap();

        let mut decoder = OpusDecoder::new(&DataPlaneConfig::default(), 1).unwrap();
        assert!(matches!(
            decoder.decode(&packet),
            Err(CodecError::Oversized { decoded: 960, expected: 480 })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let mut decoder = OpusDecoder::new(&DataPlaneConfig::default(), 1).unwrap();
        assert!(decoder.decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_plc() {
        let mut decoder = OpusDecoder::new(&DataPlaneConfig::default(), 2).unwrap();
        assert!(decoder.decode_missing().is_ok());
        assert_eq!(decoder.stats().frames_lost, 1);
    }
}
