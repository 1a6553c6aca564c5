//! ecshard - Erasure-Coded Object Storage Core
//!
//! The per-object read/write coordination layer of an erasure-coded
//! placement group: stripe geometry, per-shard extent containers, an
//! in-memory extent cache that serializes and coalesces overlapping
//! operations, and the read and read-modify-write pipelines that drive
//! shard I/O through a pluggable codec and messenger.
//!
//! # Architecture
//!
//! ```text
//! client op ──► RmwPipeline ──► ExtentCache ──► ReadPipeline ──► Messenger/peers
//!                   │               │                │
//!                   ▼               ▼                ▼
//!              ShardExtentMap.encode/decode ◄── ErasureCodec
//! ```
//!
//! # Modules
//!
//! - [`extent`] - Scatter-gather buffers, interval sets and interval maps
//! - [`shard`] - Shard ids and dense shard containers
//! - [`stripe`] - Immutable stripe geometry
//! - [`layout`] - Per-shard extent set/map, the central data container
//! - [`codec`] - Erasure codec capability and profiles
//! - [`hash_info`] - Rolling per-shard hash chains
//! - [`cache`] - The per-object extent cache
//! - [`read`] - Read pipeline: planning, dispatch, reconstruction
//! - [`rmw`] - Read-modify-write pipeline
//! - [`messenger`] - Peer messaging interface and sub-op messages
//! - [`store`] - Shard-local store interface and implementations
//! - [`consistency`] - Offline shard consistency checking
//! - [`error`] - Error types

pub mod cache;
pub mod codec;
pub mod consistency;
pub mod error;
pub mod extent;
pub mod hash_info;
pub mod layout;
pub mod messenger;
pub mod read;
pub mod rmw;
pub mod shard;
pub mod store;
pub mod stripe;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{BackendRead, ExtentCache, Lru};
pub use codec::{codec_from_profile, CodecProfile, ErasureCodec, PluginFlags};
pub use error::{Error, Result};
pub use extent::{BufferList, ExtentMap, ExtentSet};
pub use hash_info::{HashInfo, HashInfoRegistry};
pub use layout::{ShardExtentMap, ShardExtentSet};
pub use read::ReadPipeline;
pub use rmw::RmwPipeline;
pub use shard::{ShardId, ShardMap, ShardSet};
pub use stripe::StripeInfo;

/// Identifier of one user-visible object within a placement group (value
/// object).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(name: String) -> Self {
        Self(name)
    }
}
