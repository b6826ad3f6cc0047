//! Conference wiring
//!
//! Connects the pieces along the data path:
//!
//! - outbound: host audio → capture reblocking buffer → one mixer per
//!   network channel → per-destination deltas → codec pair → registry
//! - inbound: registry → codec pair → mixers (which route the new deltas
//!   on to every other peer)
//! - playback: own mix-minus-self → playback reblocking buffer → host
//!
//! Every method takes `&self`; the audio thread and the network thread may
//! share one `Conference`.

use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as TimeOrder;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::block::{
    deinterleave, downmix_to_mono, interleave, interleave_into, upmix_from_mono, Block, SourceId,
    TimeIndex, NO_PLAYHEAD,
};
use crate::audio::mixer::{DeltaMap, PerSourceMixer};
use crate::audio::reblock::ReblockingBuffer;
use crate::codec::pair::unit_width;
use crate::codec::CodecPair;
use crate::config::DataPlaneConfig;
use crate::error::{Error, MixError, Result};
use crate::network::{
    ReceivedFrame, SessionHandle, StreamDirection, StreamHandle, TransportRegistry,
};

/// Ports used for one peer. Channel unit `u` uses `base + u`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPorts {
    pub send_base: u16,
    pub receive_base: u16,
}

#[derive(Debug, Clone)]
struct Peer {
    send_streams: Vec<StreamHandle>,
    receive_streams: Vec<StreamHandle>,
    /// Latest time index received from this peer
    last_time: Option<TimeIndex>,
    /// Frames pulled ahead of the block they belong to, one slot per unit
    pending: Arc<Mutex<Vec<Option<ReceivedFrame>>>>,
}

impl Peer {
    /// Stream the peer's codec pair is attached to
    fn codec_stream(&self) -> StreamHandle {
        self.send_streams[0]
    }
}

#[derive(Default)]
struct Playout {
    /// Time index of the next codec block fed to the playback buffer
    cursor: Option<TimeIndex>,
    /// Host time of the last render
    last_render: Option<TimeIndex>,
}

/// Conference statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConferenceStats {
    pub blocks_mixed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub encode_failures: u64,
    pub decode_failures: u64,
    pub send_failures: u64,
    pub stale_frames: u64,
    pub codec_resets: u64,
}

#[derive(Default)]
struct Counters {
    blocks_mixed: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    encode_failures: AtomicU64,
    decode_failures: AtomicU64,
    send_failures: AtomicU64,
    stale_frames: AtomicU64,
    codec_resets: AtomicU64,
}

/// Widen a 32-bit wire timestamp to the time index closest to `near`
pub fn extend_timestamp(wire: u32, near: TimeIndex) -> TimeIndex {
    let base = near & !0xffff_ffff;
    [base.checked_sub(1 << 32), Some(base), base.checked_add(1 << 32)]
        .into_iter()
        .flatten()
        .map(|b| b | wire as TimeIndex)
        .min_by_key(|candidate| candidate.abs_diff(near))
        .unwrap_or(wire as TimeIndex)
}

/// One local participant's view of a conference
pub struct Conference {
    config: DataPlaneConfig,
    local_id: SourceId,
    registry: Arc<TransportRegistry>,
    session: SessionHandle,
    mixers: Vec<PerSourceMixer>,
    peers: RwLock<BTreeMap<SourceId, Peer>>,
    capture: ReblockingBuffer,
    playback: ReblockingBuffer,
    playout: Mutex<Playout>,
    /// Host time expected for the next capture push
    capture_clock: Mutex<Option<TimeIndex>>,
    counters: Counters,
}

impl Conference {
    /// Open a session on `local` and set up mixers and reblocking buffers
    pub fn new(
        config: DataPlaneConfig,
        local_id: SourceId,
        registry: Arc<TransportRegistry>,
        local: SocketAddr,
    ) -> Result<Self> {
        config.validate()?;
        let network_channels = config.network_channels();
        let capacity = config.reblock_capacity_frames();

        let capture = ReblockingBuffer::new(capacity, network_channels, config.block_size)?;
        let playback = ReblockingBuffer::new(capacity, config.channels, config.host_block_size)?;
        let mixers = (0..network_channels)
            .map(|_| PerSourceMixer::new(config.block_size, local_id))
            .collect();

        let session = registry.create_session(local)?;
        tracing::info!(
            local_id,
            %session,
            endpoint = ?registry.session_endpoint(session),
            backend = registry.backend_name(),
            channels = network_channels,
            block_size = config.block_size,
            "conference started"
        );

        Ok(Self {
            config,
            local_id,
            registry,
            session,
            mixers,
            peers: RwLock::new(BTreeMap::new()),
            capture,
            playback,
            playout: Mutex::new(Playout::default()),
            capture_clock: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &DataPlaneConfig {
        &self.config
    }

    pub fn local_id(&self) -> SourceId {
        self.local_id
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Mixer of network channel `channel`
    pub fn mixer(&self, channel: usize) -> Option<&PerSourceMixer> {
        self.mixers.get(channel)
    }

    fn units(&self) -> usize {
        (self.config.network_channels() as usize).div_ceil(2)
    }

    /// Open streams and codec state for a new peer
    pub fn add_peer(&self, peer_id: SourceId, ports: PeerPorts) -> Result<()> {
        if peer_id == self.local_id {
            return Err(Error::Config(format!("peer id {} is the local id", peer_id)));
        }
        if self.peers.read().contains_key(&peer_id) {
            return Err(Error::Config(format!("peer {} already added", peer_id)));
        }

        let mut created = Vec::new();
        let result = self.open_peer_streams(peer_id, ports, &mut created);
        let peer = match result {
            Ok(peer) => peer,
            Err(e) => {
                for stream in created {
                    self.registry.destroy_stream(stream);
                }
                return Err(e);
            }
        };

        for mixer in &self.mixers {
            mixer.register_source(peer_id);
        }
        tracing::info!(peer_id, units = peer.send_streams.len(), "peer added");
        self.peers.write().insert(peer_id, peer);
        Ok(())
    }

    fn open_peer_streams(
        &self,
        peer_id: SourceId,
        ports: PeerPorts,
        created: &mut Vec<StreamHandle>,
    ) -> Result<Peer> {
        let mut send_streams = Vec::new();
        let mut receive_streams = Vec::new();
        for unit in 0..self.units() {
            let offset = unit as u16;
            let tx = self.registry.create_stream(
                self.session,
                ports.send_base.wrapping_add(offset),
                StreamDirection::Send,
            )?;
            created.push(tx);
            send_streams.push(tx);

            let rx = self.registry.create_stream(
                self.session,
                ports.receive_base.wrapping_add(offset),
                StreamDirection::Receive,
            )?;
            created.push(rx);
            receive_streams.push(rx);
        }

        let codec = CodecPair::new(peer_id, &self.config, self.config.network_channels())?;
        self.registry.attach_codec(send_streams[0], codec)?;

        let units = receive_streams.len();
        Ok(Peer {
            send_streams,
            receive_streams,
            last_time: None,
            pending: Arc::new(Mutex::new(vec![None; units])),
        })
    }

    /// Tear down a peer's streams and codec state. Its column stays in the
    /// mixers; its last contribution ages out with the cache.
    pub fn remove_peer(&self, peer_id: SourceId) -> bool {
        let Some(peer) = self.peers.write().remove(&peer_id) else {
            return false;
        };
        for stream in peer.send_streams.iter().chain(&peer.receive_streams) {
            self.registry.destroy_stream(*stream);
        }
        tracing::info!(peer_id, "peer removed");
        true
    }

    pub fn peer_ids(&self) -> Vec<SourceId> {
        self.peers.read().keys().copied().collect()
    }

    /// Feed one host block (interleaved, host channel count) stamped with its
    /// sample position. Returns the number of codec blocks mixed and sent.
    ///
    /// With [`NO_PLAYHEAD`] the block continues where the previous push ended,
    /// starting from 0. A time before that point is a seek: buffered capture
    /// is dropped and every peer's codec state is reset.
    pub fn push_host_audio(&self, time: TimeIndex, interleaved: &[f32]) -> Result<usize> {
        let channels = self.config.channels as usize;
        let frames = interleaved.len() / channels;
        let (time, seek) = self.advance_capture_clock(time, frames);
        if seek {
            self.capture.clear();
            self.reset_codecs();
        }

        if self.config.mono_downmix {
            self.capture.push(&downmix_to_mono(interleaved, channels), time)?;
        } else {
            self.capture.push(interleaved, time)?;
        }

        let mut block = vec![0.0f32; self.capture.output_len()];
        let mut mixed = 0;
        while self.capture.data_ready() {
            let ts = self.capture.pop(&mut block)?;
            let blocks = deinterleave(&block, self.mixers.len());
            self.mix_and_route(ts, &blocks, self.local_id)?;
            mixed += 1;
        }
        Ok(mixed)
    }

    /// Resolve the time of a capture push and move the clock past it.
    /// Returns the resolved time and whether it rewinds the clock.
    fn advance_capture_clock(&self, time: TimeIndex, frames: usize) -> (TimeIndex, bool) {
        let mut clock = self.capture_clock.lock();
        let time = if time == NO_PLAYHEAD {
            clock.unwrap_or(0)
        } else {
            time
        };
        let seek = clock.is_some_and(|expected| time < expected);
        *clock = Some(time + frames as TimeIndex);
        (time, seek)
    }

    /// Drop prediction history of every peer's codec pair
    fn reset_codecs(&self) {
        let peers: Vec<(SourceId, StreamHandle)> = self
            .peers
            .read()
            .iter()
            .map(|(&id, peer)| (id, peer.codec_stream()))
            .collect();
        for (peer_id, stream) in peers {
            match self.registry.with_codec(stream, |codec| codec.reset()) {
                Some(Ok(())) => {
                    self.counters.codec_resets.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(e)) => tracing::warn!(peer_id, error = %e, "codec reset failed"),
                None => {}
            }
        }
        tracing::debug!(local_id = self.local_id, "capture seek, codecs reset");
    }

    /// Apply one block per channel for `source` and send the resulting deltas
    fn mix_and_route(
        &self,
        time: TimeIndex,
        blocks: &[Block],
        source: SourceId,
    ) -> std::result::Result<(), MixError> {
        let mut per_channel: Vec<DeltaMap> = Vec::with_capacity(self.mixers.len());
        for (mixer, block) in self.mixers.iter().zip(blocks) {
            let mut deltas = DeltaMap::new();
            mixer.mix(time, block, source, &mut deltas)?;
            per_channel.push(deltas);
        }
        self.counters.blocks_mixed.fetch_add(1, Ordering::Relaxed);

        let destinations: Vec<SourceId> = per_channel
            .first()
            .map(|deltas| deltas.keys().copied().collect())
            .unwrap_or_default();

        for destination in destinations {
            let channel_blocks: Option<Vec<Block>> = per_channel
                .iter_mut()
                .map(|deltas| deltas.get_mut(&destination).and_then(Vec::pop))
                .collect();
            if let Some(channel_blocks) = channel_blocks {
                self.transmit(destination, time, &channel_blocks);
            }
        }
        Ok(())
    }

    /// Encode one block per channel for `destination` and push it
    fn transmit(&self, destination: SourceId, time: TimeIndex, channel_blocks: &[Block]) {
        let Some(peer) = self.peers.read().get(&destination).cloned() else {
            return;
        };
        let channels = self.config.network_channels();
        let mut samples = Vec::new();

        for (unit, &stream) in peer.send_streams.iter().enumerate() {
            let first = unit * 2;
            let width = unit_width(channels, unit) as usize;
            interleave_into(&channel_blocks[first..first + width], &mut samples);

            let encoded = self
                .registry
                .with_codec(peer.codec_stream(), |codec| codec.encode_channel(&samples, unit));
            let payload = match encoded {
                Some(Ok(payload)) => payload,
                Some(Err(_)) | None => {
                    self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            match self.registry.push_frame(stream, &payload, time as u32) {
                Ok(()) => {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drain every peer's receive streams into the mixers, forwarding the
    /// resulting deltas. Returns the number of blocks mixed.
    pub fn pump_inbound(&self) -> usize {
        let peers: Vec<(SourceId, Peer)> = self
            .peers
            .read()
            .iter()
            .map(|(&id, peer)| (id, peer.clone()))
            .collect();

        let mut mixed = 0;
        for (peer_id, peer) in peers {
            while let Some((time, blocks)) = self.receive_block(peer_id, &peer) {
                if let Err(e) = self.mix_and_route(time, &blocks, peer_id) {
                    tracing::warn!(peer_id, time, error = %e, "inbound block dropped");
                    continue;
                }
                mixed += 1;
            }
        }
        mixed
    }

    /// Pull and decode one block (all units) from a peer.
    ///
    /// Unit 0 decides which block comes next. Every other unit must carry the
    /// same wire timestamp: older frames are dropped, newer ones are held for
    /// a later block, and the unit is concealed in both cases.
    fn receive_block(&self, peer_id: SourceId, peer: &Peer) -> Option<(TimeIndex, Vec<Block>)> {
        let channels = self.config.network_channels();
        let block_size = self.config.block_size;
        let mut channel_blocks: Vec<Block> = Vec::with_capacity(channels as usize);

        let first = match self.registry.pull_frame(peer.receive_streams[0]) {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => return None,
        };
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let wire_time = first.timestamp;
        let mut first = Some(first);

        for (unit, &stream) in peer.receive_streams.iter().enumerate() {
            let width = unit_width(channels, unit) as usize;
            let frame = match unit {
                0 => first.take(),
                _ => self.aligned_frame(peer_id, peer, unit, stream, wire_time),
            };

            let decoded = match frame {
                Some(frame) => self.registry.with_codec(peer.codec_stream(), |codec| {
                    let decoded = codec
                        .decode_channel(&frame.payload, unit)
                        .map(<[f32]>::to_vec);
                    decoded.map_err(|e| {
                        let concealed = codec.conceal_channel(unit).map(<[f32]>::to_vec);
                        (e, concealed.unwrap_or_default())
                    })
                }),
                None => self
                    .registry
                    .with_codec(peer.codec_stream(), |codec| {
                        codec.conceal_channel(unit).map(<[f32]>::to_vec)
                    })
                    .map(|r| r.map_err(|e| (e, Vec::new()))),
            };

            let samples = match decoded {
                Some(Ok(samples)) => samples,
                Some(Err((e, concealed))) => {
                    self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer_id, unit, error = %e, "inbound frame concealed");
                    concealed
                }
                None => return None,
            };

            let mut unit_blocks = deinterleave(&samples, width);
            unit_blocks.resize_with(width, Block::default);
            for block in unit_blocks {
                let mut padded = block.into_inner();
                padded.resize(block_size, 0.0);
                channel_blocks.push(Block::from(padded));
            }
        }

        let last_time = self.peers.read().get(&peer_id).and_then(|p| p.last_time);
        let near = last_time
            .or_else(|| self.capture.read_timestamp())
            .unwrap_or(0);
        let time = extend_timestamp(wire_time, near);
        if let Some(entry) = self.peers.write().get_mut(&peer_id) {
            entry.last_time = Some(time);
        }
        Some((time, channel_blocks))
    }

    /// Next frame of `unit` stamped `wire_time`, or `None` if that unit has
    /// nothing for this block
    fn aligned_frame(
        &self,
        peer_id: SourceId,
        peer: &Peer,
        unit: usize,
        stream: StreamHandle,
        wire_time: u32,
    ) -> Option<ReceivedFrame> {
        let mut pending = peer.pending.lock();
        loop {
            let frame = match pending[unit].take() {
                Some(frame) => frame,
                None => {
                    let frame = self.registry.pull_frame(stream).ok().flatten()?;
                    self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    frame
                }
            };
            // Wire timestamps wrap; compare by signed distance
            match (frame.timestamp.wrapping_sub(wire_time) as i32).cmp(&0) {
                TimeOrder::Equal => return Some(frame),
                TimeOrder::Less => {
                    self.counters.stale_frames.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        peer_id,
                        unit,
                        wire_time,
                        stale = frame.timestamp,
                        "stale frame dropped"
                    );
                }
                TimeOrder::Greater => {
                    pending[unit] = Some(frame);
                    return None;
                }
            }
        }
    }

    /// Fill `out` (host block, host channel count, interleaved) with the local
    /// participant's mix-minus-self for host time `time`, delayed by the
    /// configured playout latency. Returns the time index of the rendered
    /// block.
    ///
    /// With [`NO_PLAYHEAD`] the render follows on from the previous one.
    /// A time at or before the previous render restarts playout.
    pub fn render_host_audio(&self, time: TimeIndex, out: &mut [f32]) -> Result<TimeIndex> {
        let mut playout = self.playout.lock();
        let time = if time == NO_PLAYHEAD {
            playout
                .last_render
                .map_or(0, |last| last + self.config.host_block_size as TimeIndex)
        } else {
            time
        };
        let seek = match (playout.cursor, playout.last_render) {
            (Some(_), Some(last)) => time <= last,
            _ => true,
        };
        playout.last_render = Some(time);
        if seek {
            self.playback.clear();
            playout.cursor = Some(time - self.config.playout_latency_frames());
        }

        let host_channels = self.config.channels as usize;
        while !self.playback.data_ready() {
            let cursor = playout
                .cursor
                .unwrap_or(time - self.config.playout_latency_frames());
            let own: Vec<Block> = self
                .mixers
                .iter()
                .map(|mixer| {
                    mixer
                        .get_stream(cursor, self.local_id)
                        .unwrap_or_else(|| Block::zeroed(self.config.block_size))
                })
                .collect();
            let interleaved = interleave(&own);
            let samples = if self.config.mono_downmix {
                upmix_from_mono(&interleaved, host_channels)
            } else {
                interleaved
            };
            self.playback.push(&samples, cursor)?;
            playout.cursor = Some(cursor + self.config.block_size as TimeIndex);
        }

        Ok(self.playback.pop(out)?)
    }

    /// Forget every mixed time index below `time`
    pub fn reset_cache(&self, time: TimeIndex) {
        for mixer in &self.mixers {
            mixer.retain_from(time);
        }
    }

    pub fn stats(&self) -> ConferenceStats {
        let c = &self.counters;
        ConferenceStats {
            blocks_mixed: c.blocks_mixed.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            encode_failures: c.encode_failures.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            stale_frames: c.stale_frames.load(Ordering::Relaxed),
            codec_resets: c.codec_resets.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Conference {
    fn drop(&mut self) {
        self.registry.destroy_session(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackBackend;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn mono_config() -> DataPlaneConfig {
        DataPlaneConfig {
            channels: 1,
            host_block_size: 480,
            ..Default::default()
        }
    }

    #[test]
    fn test_extend_timestamp() {
        assert_eq!(extend_timestamp(480, 0), 480);
        assert_eq!(extend_timestamp(5, (1 << 32) - 10), (1 << 32) + 5);
        assert_eq!(extend_timestamp(u32::MAX, 1 << 32), (1 << 32) - 1);
        assert_eq!(extend_timestamp(100, 7 << 32), (7 << 32) + 100);
    }

    #[test]
    fn test_add_and_remove_peer() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let conference = Conference::new(DataPlaneConfig::default(), 0, registry.clone(), local()).unwrap();

        let ports = PeerPorts {
            send_base: 9000,
            receive_base: 9100,
        };
        conference.add_peer(1, ports).unwrap();
        assert_eq!(registry.stream_count(), 2);
        assert!(conference.add_peer(1, ports).is_err());
        assert!(conference.add_peer(0, ports).is_err());
        assert_eq!(conference.mixer(0).unwrap().source_index(1), Some(1));

        assert!(conference.remove_peer(1));
        assert!(!conference.remove_peer(1));
        assert_eq!(registry.stream_count(), 0);
    }

    #[test]
    fn test_failed_peer_setup_rolls_back() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let conference = Conference::new(DataPlaneConfig::default(), 0, registry.clone(), local()).unwrap();

        conference
            .add_peer(1, PeerPorts { send_base: 9000, receive_base: 9100 })
            .unwrap();
        // Receive port 9100 is taken; the send stream created first must be undone
        let result = conference.add_peer(2, PeerPorts { send_base: 9200, receive_base: 9100 });
        assert!(result.is_err());
        assert_eq!(registry.stream_count(), 2);
        assert_eq!(conference.peer_ids(), vec![1]);
    }

    #[test]
    fn test_two_party_exchange() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let alice = Conference::new(mono_config(), 1, registry.clone(), local()).unwrap();
        let bob = Conference::new(mono_config(), 2, registry.clone(), local()).unwrap();

        alice
            .add_peer(2, PeerPorts { send_base: 9002, receive_base: 9001 })
            .unwrap();
        bob.add_peer(1, PeerPorts { send_base: 9001, receive_base: 9002 })
            .unwrap();

        for block in 0..3 {
            let start = block * 480;
            let tone: Vec<f32> = (start..start + 480)
                .map(|i| (i as f32 * 0.05).sin() * 0.3)
                .collect();
            assert_eq!(alice.push_host_audio(start as TimeIndex, &tone).unwrap(), 1);
        }
        assert_eq!(alice.stats().frames_sent, 3);

        assert_eq!(bob.pump_inbound(), 3);
        let stats = bob.stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.decode_failures, 0);
        assert_eq!(bob.mixer(0).unwrap().time_indices(), vec![0, 480, 960]);

        // Bob hears Alice; Alice's own playback does not contain herself
        let latency = bob.config().playout_latency_frames();
        let mut heard = 0.0f32;
        let mut own_peak = 0.0f32;
        let mut out = vec![0.0f32; 480];
        for t in [0, 480, 960] {
            assert_eq!(bob.render_host_audio(t + latency, &mut out).unwrap(), t);
            heard = out.iter().fold(heard, |acc, s| acc.max(s.abs()));
            alice.render_host_audio(t + latency, &mut out).unwrap();
            own_peak = out.iter().fold(own_peak, |acc, s| acc.max(s.abs()));
        }
        assert!(heard > 1e-3);
        assert_eq!(own_peak, 0.0);
    }

    #[test]
    fn test_interleaved_ticks_hear_each_other() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let alice = Conference::new(mono_config(), 1, registry.clone(), local()).unwrap();
        let bob = Conference::new(mono_config(), 2, registry.clone(), local()).unwrap();
        alice
            .add_peer(2, PeerPorts { send_base: 9012, receive_base: 9011 })
            .unwrap();
        bob.add_peer(1, PeerPorts { send_base: 9011, receive_base: 9012 })
            .unwrap();

        // Each node runs push, pump, render in turn, so one of them always
        // renders before the other has sent the same time index
        let mut heard = [0.0f32; 2];
        let mut out = vec![0.0f32; 480];
        for tick in 0..20 {
            let start = tick * 480;
            for (i, node) in [&alice, &bob].into_iter().enumerate() {
                let step = 0.05 + 0.02 * i as f32;
                let tone: Vec<f32> = (start..start + 480)
                    .map(|n| (n as f32 * step).sin() * 0.3)
                    .collect();
                node.push_host_audio(start as TimeIndex, &tone).unwrap();
                node.pump_inbound();
                node.render_host_audio(start as TimeIndex, &mut out).unwrap();
                heard[i] = out.iter().fold(heard[i], |acc, s| acc.max(s.abs()));
            }
        }
        assert!(heard[0] > 1e-3, "alice heard nothing from bob");
        assert!(heard[1] > 1e-3, "bob heard nothing from alice");
    }

    #[test]
    fn test_no_playhead_follows_pushed_frames() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let config = DataPlaneConfig {
            channels: 1,
            host_block_size: 512,
            ..Default::default()
        };
        let conference = Conference::new(config, 0, registry, local()).unwrap();

        let host_block = vec![0.0f32; 512];
        let mixed: usize = (0..15)
            .map(|_| conference.push_host_audio(NO_PLAYHEAD, &host_block).unwrap())
            .sum();
        assert_eq!(mixed, 16);
        let expected: Vec<TimeIndex> = (0..16).map(|i| i * 480).collect();
        assert_eq!(conference.mixer(0).unwrap().time_indices(), expected);
        assert_eq!(conference.stats().codec_resets, 0);

        let latency = conference.config().playout_latency_frames();
        let mut out = vec![0.0f32; 512];
        assert_eq!(conference.render_host_audio(NO_PLAYHEAD, &mut out).unwrap(), -latency);
        assert_eq!(
            conference.render_host_audio(NO_PLAYHEAD, &mut out).unwrap(),
            512 - latency
        );
    }

    #[test]
    fn test_units_realigned_by_timestamp() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let config = DataPlaneConfig {
            channels: 4,
            host_block_size: 480,
            ..Default::default()
        };
        let alice = Conference::new(config.clone(), 1, registry.clone(), local()).unwrap();
        alice
            .add_peer(2, PeerPorts { send_base: 9300, receive_base: 9400 })
            .unwrap();

        // Stand-in for the remote peer: two unit streams and its own encoder
        let remote = registry.create_session(local()).unwrap();
        let units = [
            registry.create_stream(remote, 9400, StreamDirection::Send).unwrap(),
            registry.create_stream(remote, 9401, StreamDirection::Send).unwrap(),
        ];
        let mut codec = CodecPair::new(2, &config, 4).unwrap();
        let stereo = vec![0.1f32; 960];
        let mut send = |unit: usize, timestamp: u32| {
            let payload = codec.encode_channel(&stereo, unit).unwrap();
            registry.push_frame(units[unit], &payload, timestamp).unwrap();
        };

        // Unit 1 of block 0 is late
        send(0, 0);
        assert_eq!(alice.pump_inbound(), 1);
        send(1, 0);
        send(0, 480);
        send(1, 480);
        assert_eq!(alice.pump_inbound(), 1);
        assert_eq!(alice.stats().stale_frames, 1);

        // Unit 1 of block 1440 is early and waits for its block
        send(1, 1440);
        send(0, 960);
        assert_eq!(alice.pump_inbound(), 1);
        send(0, 1440);
        assert_eq!(alice.pump_inbound(), 1);

        assert_eq!(alice.mixer(0).unwrap().time_indices(), vec![0, 480, 960, 1440]);
        let stats = alice.stats();
        assert_eq!(stats.stale_frames, 1);
        assert_eq!(stats.frames_received, 7);
    }

    #[test]
    fn test_capture_seek_resets_codecs() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let alice = Conference::new(mono_config(), 1, registry.clone(), local()).unwrap();
        let bob = Conference::new(mono_config(), 2, registry.clone(), local()).unwrap();
        alice
            .add_peer(2, PeerPorts { send_base: 9022, receive_base: 9021 })
            .unwrap();
        bob.add_peer(1, PeerPorts { send_base: 9021, receive_base: 9022 })
            .unwrap();

        let tone = vec![0.2f32; 480];
        for start in [0, 480, 960] {
            alice.push_host_audio(start, &tone).unwrap();
        }
        assert_eq!(alice.stats().codec_resets, 0);

        // Host jumps back to the start
        assert_eq!(alice.push_host_audio(0, &tone).unwrap(), 1);
        assert_eq!(alice.stats().codec_resets, 1);

        // Playback continues from the seek point without another reset
        assert_eq!(alice.push_host_audio(NO_PLAYHEAD, &tone).unwrap(), 1);
        assert_eq!(alice.stats().codec_resets, 1);
        assert_eq!(alice.mixer(0).unwrap().time_indices(), vec![0, 480, 960]);
        assert_eq!(alice.stats().send_failures, 0);
        assert_eq!(bob.pump_inbound(), 5);
    }

    #[test]
    fn test_reblocking_host_blocks() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        let config = DataPlaneConfig {
            channels: 2,
            host_block_size: 256,
            ..Default::default()
        };
        let conference = Conference::new(config, 0, registry, local()).unwrap();

        let host_block = vec![0.0f32; 512];
        assert_eq!(conference.push_host_audio(0, &host_block).unwrap(), 0);
        assert_eq!(conference.push_host_audio(256, &host_block).unwrap(), 1);
        assert_eq!(conference.mixer(0).unwrap().time_indices(), vec![0]);

        conference.reset_cache(480);
        assert!(conference.mixer(0).unwrap().time_indices().is_empty());
    }

    #[test]
    fn test_session_closed_on_drop() {
        let registry = Arc::new(TransportRegistry::new(LoopbackBackend::new()));
        {
            let conference = Conference::new(DataPlaneConfig::default(), 0, registry.clone(), local()).unwrap();
            assert!(registry.is_session_live(conference.session()));
        }
        assert_eq!(registry.session_count(), 0);
    }
}
