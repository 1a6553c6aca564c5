//! Rolling Shard Hash Chains
//!
//! When the pool does not support EC overwrites, every write is a
//! stripe-aligned append, and each shard carries a cumulative crc32c chain
//! over its chunk stream. [`HashInfo`] is the persisted record;
//! [`HashInfoRegistry`] caches the not-yet-stable records per object while
//! writes are in flight.
//!
//! The attribute blob is a versioned little-endian record; see
//! [`HashInfo::encode`].

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ObjectId;

const HASH_INFO_VERSION: u8 = 1;

/// Object-attribute name the hash record is persisted under.
pub const HINFO_KEY: &str = "hinfo_key";

/// Seed for an empty chain, matching crc32c folding from `-1`.
const HASH_SEED: u32 = u32::MAX;

/// Cumulative per-shard hash chain plus the hashed shard length.
///
/// Hashes are indexed in raw (codec) order. `total_chunk_size` is the
/// per-shard byte count covered by the chains; with stripe-aligned appends
/// every shard shares one size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashInfo {
    total_chunk_size: u64,
    cumulative_shard_hashes: Vec<u32>,
}

impl HashInfo {
    /// Fresh record with `num_chunks` seeded chains.
    pub fn new(num_chunks: usize) -> Self {
        Self {
            total_chunk_size: 0,
            cumulative_shard_hashes: vec![HASH_SEED; num_chunks],
        }
    }

    pub fn total_chunk_size(&self) -> u64 {
        self.total_chunk_size
    }

    pub fn has_chunk_hash(&self) -> bool {
        !self.cumulative_shard_hashes.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.cumulative_shard_hashes.len()
    }

    /// Current chain value for a raw chunk index.
    pub fn chunk_hash(&self, raw_shard: usize) -> u32 {
        assert!(
            raw_shard < self.cumulative_shard_hashes.len(),
            "chunk hash {raw_shard} out of range"
        );
        self.cumulative_shard_hashes[raw_shard]
    }

    /// Fold one appended stripe row into the chains. `offset` must equal
    /// the hashed size so far, and all chunks must share one length;
    /// anything else is a corrupted append sequence and fatal.
    pub fn append(&mut self, offset: u64, chunks: &[Bytes]) {
        assert_eq!(
            offset, self.total_chunk_size,
            "hash append at {offset} but chains cover {}",
            self.total_chunk_size
        );
        assert_eq!(chunks.len(), self.cumulative_shard_hashes.len());
        if chunks.is_empty() {
            return;
        }
        let len = chunks[0].len();
        for (hash, chunk) in self.cumulative_shard_hashes.iter_mut().zip(chunks) {
            assert_eq!(chunk.len(), len, "uneven chunk lengths in hash append");
            *hash = crc32c::crc32c_append(*hash, chunk);
        }
        self.total_chunk_size += len as u64;
    }

    pub fn clear(&mut self) {
        self.total_chunk_size = 0;
        let n = self.cumulative_shard_hashes.len();
        self.cumulative_shard_hashes = vec![HASH_SEED; n];
    }

    /// Keep the size but drop the chains, for objects that can no longer
    /// maintain a linear hash.
    pub fn set_total_chunk_size_clear_hash(&mut self, new_chunk_size: u64) {
        self.cumulative_shard_hashes.clear();
        self.total_chunk_size = new_chunk_size;
    }

    // =========================================================================
    // Wire format
    // =========================================================================

    /// Serialize as the persisted attribute blob: version byte, then
    /// `total_chunk_size` (u64 LE), hash count (u32 LE) and the chain
    /// values (u32 LE each).
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(13 + 4 * self.cumulative_shard_hashes.len());
        out.put_u8(HASH_INFO_VERSION);
        out.put_u64_le(self.total_chunk_size);
        out.put_u32_le(self.cumulative_shard_hashes.len() as u32);
        for hash in &self.cumulative_shard_hashes {
            out.put_u32_le(*hash);
        }
        out.freeze()
    }

    pub fn decode(mut blob: &[u8]) -> Result<Self> {
        if blob.len() < 13 {
            return Err(Error::HashInfoDecode(format!(
                "blob of {} bytes is too short",
                blob.len()
            )));
        }
        let version = blob.get_u8();
        if version != HASH_INFO_VERSION {
            return Err(Error::HashInfoDecode(format!(
                "unsupported version {version}"
            )));
        }
        let total_chunk_size = blob.get_u64_le();
        let count = blob.get_u32_le() as usize;
        if blob.len() < count * 4 {
            return Err(Error::HashInfoDecode(format!(
                "truncated: {count} hashes declared, {} bytes left",
                blob.len()
            )));
        }
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(blob.get_u32_le());
        }
        Ok(Self {
            total_chunk_size,
            cumulative_shard_hashes: hashes,
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

pub type HashInfoRef = Arc<Mutex<HashInfo>>;

/// Cache of in-flight (not yet persisted) hash records per object.
pub struct HashInfoRegistry {
    chunk_count: usize,
    registry: DashMap<ObjectId, HashInfoRef>,
}

impl HashInfoRegistry {
    pub fn new(chunk_count: usize) -> Self {
        Self {
            chunk_count,
            registry: DashMap::new(),
        }
    }

    /// Fetch or create the record for `oid`.
    ///
    /// `attr` is the stored attribute blob, if any; `shard_size` the
    /// on-disk per-shard size it must agree with. Returns `None` when the
    /// attribute is undecodable or disagrees with the shard size, or when
    /// the object is non-empty, has no attribute and `create` was not
    /// requested.
    pub fn get_hash_info(
        &self,
        oid: &ObjectId,
        attr: Option<&[u8]>,
        shard_size: u64,
        mut create: bool,
    ) -> Option<HashInfoRef> {
        if let Some(existing) = self.registry.get(oid) {
            return Some(existing.clone());
        }
        let mut hinfo = HashInfo::new(self.chunk_count);
        match attr {
            Some(blob) if !blob.is_empty() => {
                match HashInfo::decode(blob) {
                    Ok(decoded) => hinfo = decoded,
                    Err(err) => {
                        debug!(%oid, %err, "undecodable hash info attribute");
                        return None;
                    }
                }
                if hinfo.total_chunk_size() != shard_size {
                    debug!(
                        %oid,
                        hashed = hinfo.total_chunk_size(),
                        shard_size,
                        "hash info does not match shard size"
                    );
                    return None;
                }
                create = true;
            }
            _ => {
                // An empty object without the attribute legitimately has
                // no hash info yet.
                if shard_size == 0 {
                    create = true;
                }
            }
        }
        if !create {
            return None;
        }
        Some(self.maybe_put_hash_info(oid, hinfo))
    }

    /// Insert `hinfo` unless a record already exists; returns the cached
    /// one either way.
    pub fn maybe_put_hash_info(&self, oid: &ObjectId, hinfo: HashInfo) -> HashInfoRef {
        self.registry
            .entry(oid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(hinfo)))
            .clone()
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.registry.contains_key(oid)
    }

    pub fn remove(&self, oid: &ObjectId) {
        self.registry.remove(oid);
    }

    /// Drop every cached record (interval change).
    pub fn clear(&self) {
        self.registry.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
