//! Replay memory: a bounded sample buffer with pluggable eviction and sampling.
//!
//! - `sample`: the buffered item and its optional scores
//! - `policy`: one [`ReplayPolicy`] per variant (Random, Importance,
//!   GradientBased, ClusterBased)
//! - `buffer`: the bounded [`MemoryBuffer`]

pub mod buffer;
pub mod policy;
pub mod sample;

pub use buffer::{BufferOpResult, BufferStats, MemoryBuffer, SampleBatch};
pub use policy::{PolicyKind, ReplayPolicy, policy_for};
pub use sample::MemorySample;
