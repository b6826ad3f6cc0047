//! Wire framing for byte-oriented transports
//!
//! Single frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────┐
//! │ timestamp (u32, BE)  │ payload (N bytes)│
//! └──────────────────────┴──────────────────┘
//! ```
//!
//! Chunked frame, one datagram per chunk, each at most one transport unit:
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────────────┬───────────────┐
//! │ frame count │ frame index │ participant low8 │ payload chunk │
//! └─────────────┴─────────────┴──────────────────┴───────────────┘
//! ```
//!
//! Neither layout carries a length field; the datagram boundary delimits it.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::constants::{CHUNK_HEADER_LEN, SINGLE_HEADER_LEN};
use crate::error::TransportError;

/// Prefix `payload` with its timestamp
pub fn encode_single(timestamp: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SINGLE_HEADER_LEN + payload.len());
    buf.put_u32(timestamp);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a single frame into timestamp and payload
pub fn decode_single(datagram: &Bytes) -> Result<(u32, Bytes), TransportError> {
    if datagram.len() < SINGLE_HEADER_LEN {
        return Err(TransportError::InvalidPacket);
    }
    let mut ts = [0u8; SINGLE_HEADER_LEN];
    ts.copy_from_slice(&datagram[..SINGLE_HEADER_LEN]);
    Ok((u32::from_be_bytes(ts), datagram.slice(SINGLE_HEADER_LEN..)))
}

/// Splits payloads into chunked datagrams
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_transport_unit: usize,
}

impl Chunker {
    pub fn new(max_transport_unit: usize) -> Self {
        Self { max_transport_unit }
    }

    /// Payload bytes per chunk
    pub fn chunk_payload(&self) -> usize {
        self.max_transport_unit.saturating_sub(CHUNK_HEADER_LEN)
    }

    /// Split `payload` into datagrams tagged with the low byte of `participant`
    pub fn split(&self, payload: &[u8], participant: u32) -> Result<Vec<Bytes>, TransportError> {
        let per_chunk = self.chunk_payload();
        if per_chunk == 0 {
            return Err(TransportError::PacketTooLarge(payload.len()));
        }
        let count = payload.len().div_ceil(per_chunk).max(1);
        if count > u8::MAX as usize {
            return Err(TransportError::PacketTooLarge(payload.len()));
        }

        let tag = (participant & 0xff) as u8;
        let mut chunks = Vec::with_capacity(count);
        for index in 0..count {
            let start = index * per_chunk;
            let end = (start + per_chunk).min(payload.len());
            let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + end - start);
            buf.put_u8(count as u8);
            buf.put_u8(index as u8);
            buf.put_u8(tag);
            buf.put_slice(&payload[start..end]);
            chunks.push(buf.freeze());
        }
        Ok(chunks)
    }
}

#[derive(Default)]
struct Partial {
    count: u8,
    next_index: u8,
    data: BytesMut,
}

/// Reassembles chunked datagrams, one partial frame per participant tag.
///
/// Chunks must arrive in order. A chunk whose count differs from the partial
/// frame's, or whose index is not the next expected one, discards the partial
/// frame; an index of 0 always starts a new one.
#[derive(Default)]
pub struct Reassembler {
    partials: HashMap<u8, Partial>,
    discarded: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram; returns `(participant_low8, payload)` once a frame completes
    pub fn accept(&mut self, datagram: &[u8]) -> Result<Option<(u8, Bytes)>, TransportError> {
        if datagram.len() < CHUNK_HEADER_LEN {
            return Err(TransportError::InvalidPacket);
        }
        let (count, index, tag) = (datagram[0], datagram[1], datagram[2]);
        if count == 0 || index >= count {
            return Err(TransportError::InvalidPacket);
        }
        let body = &datagram[CHUNK_HEADER_LEN..];

        let partial = self.partials.entry(tag).or_default();
        if index == 0 || partial.count != count || partial.next_index != index {
            if partial.next_index != 0 {
                self.discarded += 1;
                tracing::trace!(tag, count, index, "discarding partial chunked frame");
            }
            *partial = Partial::default();
            if index != 0 {
                return Ok(None);
            }
            partial.count = count;
        }

        partial.data.extend_from_slice(body);
        partial.next_index = index + 1;

        if partial.next_index == count {
            let done = std::mem::take(partial);
            return Ok(Some((tag, done.data.freeze())));
        }
        Ok(None)
    }

    /// Partial frames thrown away so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
