//! Per-Shard Extent Containers
//!
//! The central data structures of the core: [`ShardExtentSet`] tracks which
//! byte ranges of each shard an operation touches, and [`ShardExtentMap`]
//! carries the actual per-shard buffers through the read and write
//! pipelines, acting as both codec input (encode/decode) and read output.

pub mod map;
pub mod set;

pub use map::{ShardExtentMap, ShardSlice};
pub use set::ShardExtentSet;
