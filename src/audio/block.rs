//! Fixed-size audio blocks and sample layout helpers

use std::ops::{Deref, DerefMut};

/// Absolute sample position of a block
pub type TimeIndex = i64;

/// Participant identifier
pub type SourceId = u32;

/// Time index used when the host has no playhead
pub const NO_PLAYHEAD: TimeIndex = i64::MIN;

/// One codec-block-sized run of mono samples
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    samples: Vec<f32>,
}

impl Block {
    /// Silent block of `len` samples
    pub fn zeroed(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
        }
    }

    /// Block filled with `value`
    pub fn filled(len: usize, value: f32) -> Self {
        Self {
            samples: vec![value; len],
        }
    }

    pub fn from_slice(samples: &[f32]) -> Self {
        Self {
            samples: samples.to_vec(),
        }
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.samples
    }

    /// `self + add - sub`, element by element
    pub fn plus_minus(&self, add: &Block, sub: &Block) -> Block {
        let samples = self
            .samples
            .iter()
            .zip(&add.samples)
            .zip(&sub.samples)
            .map(|((&s, &a), &b)| s + a - b)
            .collect();
        Block { samples }
    }

    /// `self - other`, element by element
    pub fn minus(&self, other: &Block) -> Block {
        let samples = self
            .samples
            .iter()
            .zip(&other.samples)
            .map(|(&a, &b)| a - b)
            .collect();
        Block { samples }
    }

    /// Accumulate `other` into `self`
    pub fn add_assign(&mut self, other: &Block) {
        for (dst, &src) in self.samples.iter_mut().zip(&other.samples) {
            *dst += src;
        }
    }

    /// Peak absolute sample value
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

impl From<Vec<f32>> for Block {
    fn from(samples: Vec<f32>) -> Self {
        Self { samples }
    }
}

impl AsRef<[f32]> for Block {
    fn as_ref(&self) -> &[f32] {
        &self.samples
    }
}

impl Deref for Block {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.samples
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }
}

/// Split interleaved samples into one block per channel.
///
/// Trailing samples that do not form a whole frame are ignored.
pub fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Block> {
    if channels == 0 {
        return Vec::new();
    }
    let frames = interleaved.len() / channels;
    let mut blocks: Vec<Vec<f32>> = (0..channels).map(|_| Vec::with_capacity(frames)).collect();
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in frame.iter().enumerate() {
            blocks[channel].push(sample);
        }
    }
    blocks.into_iter().map(Block::from).collect()
}

/// Interleave equally long channel slices into `out`
pub fn interleave_into<S: AsRef<[f32]>>(channels: &[S], out: &mut Vec<f32>) {
    out.clear();
    let frames = channels.iter().map(|c| c.as_ref().len()).min().unwrap_or(0);
    out.reserve(frames * channels.len());
    for frame in 0..frames {
        for channel in channels {
            out.push(channel.as_ref()[frame]);
        }
    }
}

/// Interleave equally long channel slices
pub fn interleave<S: AsRef<[f32]>>(channels: &[S]) -> Vec<f32> {
    let mut out = Vec::new();
    interleave_into(channels, &mut out);
    out
}

/// Average interleaved frames down to mono
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Copy a mono signal into every channel of an interleaved buffer
pub fn upmix_from_mono(mono: &[f32], channels: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(mono.len() * channels);
    for &sample in mono {
        out.extend(std::iter::repeat(sample).take(channels));
    }
    out
}
