//! Audio data structures: blocks, reblocking and mixing

pub mod block;
pub mod mixer;
pub mod reblock;

pub use block::{Block, SourceId, TimeIndex, NO_PLAYHEAD};
pub use mixer::{DeltaMap, PerSourceMixer};
pub use reblock::ReblockingBuffer;
