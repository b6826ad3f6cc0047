//! Per-source mix-minus mixer
//!
//! For every time index the mixer keeps one block per known participant
//! (the column) and the running sum of all of them (the row). A participant's
//! personalised signal is `row - column[own index]`.
//!
//! The row is updated incrementally: replacing a participant's block costs one
//! pass over the samples regardless of how many participants there are.
//! Float error from the incremental updates is not corrected automatically;
//! [`PerSourceMixer::resync`] recomputes a row from its column on demand.
//!
//! Index 0 always belongs to the local participant (the "own mix"), which
//! never receives a delta from the mixer.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::audio::block::{Block, SourceId, TimeIndex};
use crate::error::MixError;

/// Personalised blocks produced by one `mix` call, keyed by destination
pub type DeltaMap = HashMap<SourceId, Vec<Block>>;

struct MixerState {
    block_size: usize,
    /// participant → stable column index (append-only)
    sources: HashMap<SourceId, usize>,
    /// column index → participant
    source_ids: Vec<SourceId>,
    columns: BTreeMap<TimeIndex, Vec<Block>>,
    rows: BTreeMap<TimeIndex, Block>,
}

impl MixerState {
    /// Index of `source`, registering it when unseen.
    ///
    /// A new source gets a silent block appended to every existing column.
    fn index_of(&mut self, source: SourceId) -> usize {
        if let Some(&idx) = self.sources.get(&source) {
            return idx;
        }
        let idx = self.source_ids.len();
        self.sources.insert(source, idx);
        self.source_ids.push(source);
        for column in self.columns.values_mut() {
            column.push(Block::zeroed(self.block_size));
        }
        tracing::debug!(source, idx, "mixer registered source");
        idx
    }

    /// Make sure column and row exist for `time`
    fn touch(&mut self, time: TimeIndex) {
        let sources = self.source_ids.len();
        let block_size = self.block_size;
        self.columns
            .entry(time)
            .or_insert_with(|| vec![Block::zeroed(block_size); sources]);
        self.rows
            .entry(time)
            .or_insert_with(|| Block::zeroed(block_size));
    }

    /// Apply `block` for `source` at `time`; returns the deltas to route
    fn mix(
        &mut self,
        time: TimeIndex,
        block: &Block,
        source: SourceId,
    ) -> Vec<(SourceId, Block)> {
        let members_before = self
            .columns
            .get(&time)
            .map(Vec::len)
            .unwrap_or(self.source_ids.len());

        let idx = self.index_of(source);
        self.touch(time);

        let (Some(column), Some(row)) = (self.columns.get_mut(&time), self.rows.get_mut(&time))
        else {
            return Vec::new();
        };

        let new_sum = row.plus_minus(block, &column[idx]);
        column[idx] = block.clone();
        *row = new_sum;

        if members_before < 2 {
            return Vec::new();
        }

        column
            .iter()
            .enumerate()
            .filter(|&(p, _)| p != idx && p != 0)
            .map(|(p, contribution)| (self.source_ids[p], row.minus(contribution)))
            .collect()
    }
}

/// Mix-minus mixer for one audio channel
pub struct PerSourceMixer {
    state: ReentrantMutex<RefCell<MixerState>>,
}

impl PerSourceMixer {
    /// Create a mixer whose own-mix slot (index 0) belongs to `local_source`
    pub fn new(block_size: usize, local_source: SourceId) -> Self {
        let mut sources = HashMap::new();
        sources.insert(local_source, 0);
        Self {
            state: ReentrantMutex::new(RefCell::new(MixerState {
                block_size,
                sources,
                source_ids: vec![local_source],
                columns: BTreeMap::new(),
                rows: BTreeMap::new(),
            })),
        }
    }

    /// Replace `source`'s block at `time` and append each other participant's
    /// refreshed mix-minus-self to `deltas`.
    ///
    /// `block` must hold exactly one block of samples; anything else is
    /// rejected with [`MixError::BlockSize`] and leaves the mixer untouched.
    pub fn mix(
        &self,
        time: TimeIndex,
        block: &Block,
        source: SourceId,
        deltas: &mut DeltaMap,
    ) -> Result<(), MixError> {
        self.mix_with(time, block, source, |destination, delta| {
            deltas.entry(destination).or_default().push(delta);
        })
    }

    /// Like [`mix`](Self::mix) but hands each delta to `emit` while the
    /// mixer lock is still held. `emit` may call back into this mixer.
    pub fn mix_with<F>(
        &self,
        time: TimeIndex,
        block: &Block,
        source: SourceId,
        mut emit: F,
    ) -> Result<(), MixError>
    where
        F: FnMut(SourceId, Block),
    {
        let guard = self.state.lock();
        let emitted = {
            let mut state = guard.borrow_mut();
            if block.len() != state.block_size {
                tracing::warn!(
                    source,
                    time,
                    len = block.len(),
                    expected = state.block_size,
                    "mix rejected block of wrong size"
                );
                return Err(MixError::BlockSize {
                    len: block.len(),
                    expected: state.block_size,
                });
            }
            state.mix(time, block, source)
        };
        tracing::trace!(source, time, deltas = emitted.len(), "mixed block");
        for (destination, delta) in emitted {
            emit(destination, delta);
        }
        Ok(())
    }

    /// Full mix at `time`. Creates a silent entry if `time` is unknown.
    pub fn get_block(&self, time: TimeIndex) -> Block {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.touch(time);
        state.rows.get(&time).cloned().unwrap_or_default()
    }

    /// Every participant's mix-minus-self at `time`, in column order.
    /// Creates a silent entry if `time` is unknown.
    pub fn get_stream_column(&self, time: TimeIndex) -> Vec<Block> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.touch(time);
        match (state.columns.get(&time), state.rows.get(&time)) {
            (Some(column), Some(row)) => column.iter().map(|c| row.minus(c)).collect(),
            _ => Vec::new(),
        }
    }

    /// Mix-minus-self of one participant at `time`, if the participant is known
    pub fn get_stream(&self, time: TimeIndex, source: SourceId) -> Option<Block> {
        let guard = self.state.lock();
        let idx = guard.borrow().sources.get(&source).copied()?;
        self.get_stream_column(time).into_iter().nth(idx)
    }

    /// Recompute the row at `time` from its column. Returns the largest
    /// absolute correction applied, or `None` if `time` is unknown.
    pub fn resync(&self, time: TimeIndex) -> Option<f32> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let block_size = state.block_size;
        let mut fresh = Block::zeroed(block_size);
        for block in state.columns.get(&time)? {
            fresh.add_assign(block);
        }
        let row = state.rows.get_mut(&time)?;
        let drift = fresh.minus(row).peak();
        *row = fresh;
        Some(drift)
    }

    /// Register `source` ahead of its first block so it starts receiving
    /// deltas right away. Returns its column index.
    pub fn register_source(&self, source: SourceId) -> usize {
        let guard = self.state.lock();
        let idx = guard.borrow_mut().index_of(source);
        idx
    }

    /// Column index of `source`
    pub fn source_index(&self, source: SourceId) -> Option<usize> {
        self.state.lock().borrow().sources.get(&source).copied()
    }

    /// Participant at column index `idx`
    pub fn source_at(&self, idx: usize) -> Option<SourceId> {
        self.state.lock().borrow().source_ids.get(idx).copied()
    }

    /// Number of known participants, the own-mix slot included
    pub fn source_count(&self) -> usize {
        self.state.lock().borrow().source_ids.len()
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().borrow().block_size
    }

    /// Time indices currently held, in ascending order
    pub fn time_indices(&self) -> Vec<TimeIndex> {
        self.state.lock().borrow().rows.keys().copied().collect()
    }

    /// Drop every time index below `time`
    pub fn retain_from(&self, time: TimeIndex) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.columns = state.columns.split_off(&time);
        state.rows = state.rows.split_off(&time);
    }

    /// Drop all time indices; known participants keep their indices
    pub fn clear(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.columns.clear();
        state.rows.clear();
    }
}
