//! Offline Shard Consistency Checking
//!
//! Reads every shard of an object back from a [`ShardStore`], re-encodes
//! the data shards and compares the generated parity (and, when hash
//! chains are enabled, the stored hash record) against what is on disk.
//! This is the library side of the `ecshard check` command; the CLI is a
//! thin wrapper.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::codec::ErasureCodec;
use crate::error::{Error, Result};
use crate::extent::ExtentSet;
use crate::hash_info::{HashInfo, HINFO_KEY};
use crate::layout::ShardExtentMap;
use crate::shard::ShardId;
use crate::store::ShardStore;
use crate::stripe::{align_page_next, StripeInfo};
use crate::ObjectId;

/// Outcome of checking one object.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub oid: ObjectId,
    pub parity_match: bool,
    /// `None` when the object carries no hash record.
    pub hash_match: Option<bool>,
    pub mismatched_shards: Vec<u8>,
    pub notes: Vec<String>,
}

impl CheckReport {
    pub fn consistent(&self) -> bool {
        self.parity_match && self.hash_match.unwrap_or(true)
    }
}

/// Re-encode-and-compare checker over one placement group's store.
pub struct ConsistencyChecker {
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    store: Arc<dyn ShardStore>,
}

impl ConsistencyChecker {
    pub fn new(
        sinfo: Arc<StripeInfo>,
        codec: Arc<dyn ErasureCodec>,
        store: Arc<dyn ShardStore>,
    ) -> Self {
        Self {
            sinfo,
            codec,
            store,
        }
    }

    /// Check a single object: read all shards, regenerate parity from the
    /// data shards and compare against the stored parity bytes.
    pub fn check_object(&self, oid: &ObjectId) -> Result<CheckReport> {
        let mut report = CheckReport {
            oid: oid.clone(),
            parity_match: true,
            hash_match: None,
            mismatched_shards: Vec::new(),
            notes: Vec::new(),
        };

        // Read every shard in full.
        let mut stored = ShardExtentMap::new(self.sinfo.clone());
        let mut shard_sizes = Vec::new();
        for shard in self.sinfo.chunk_mapping().to_vec() {
            let size = self.store.shard_size(oid, shard)?;
            shard_sizes.push((shard, size));
            if size == 0 {
                continue;
            }
            let data = self
                .store
                .read(oid, shard, &ExtentSet::from_range(0, size))?;
            for (off, _, buf) in data.iter() {
                stored.insert_in_shard(shard, off, buf.clone());
            }
        }
        if stored.is_empty() && shard_sizes.iter().all(|(_, size)| *size == 0) {
            debug!(%oid, "empty object is trivially consistent");
            return Ok(report);
        }

        // Rebuild parity from the data shards alone. Data is padded to
        // page bounds so the short tail of the last page encodes as the
        // zeros it represents on disk.
        let mut computed = ShardExtentMap::new(self.sinfo.clone());
        for shard in self.sinfo.data_shards().collect::<Vec<_>>() {
            if let Some(emap) = stored.get_extent_map(shard) {
                for (off, _, buf) in emap.iter() {
                    computed.insert_in_shard(shard, off, buf.clone());
                }
            }
        }
        let widest = align_page_next(
            shard_sizes
                .iter()
                .filter(|(shard, _)| self.sinfo.is_data_shard(*shard))
                .map(|(_, size)| *size)
                .max()
                .unwrap_or(0),
        );
        for shard in self.sinfo.data_shards().collect::<Vec<_>>() {
            computed.zero_pad(shard, 0, widest);
        }
        computed.insert_parity_buffers();
        computed.pad_and_rebuild_to_page_align();
        computed.encode(&*self.codec, None, 0)?;

        // Compare the stored parity bytes against the regenerated ones.
        for shard in self.sinfo.parity_shards().collect::<Vec<_>>() {
            let Some(emap) = stored.get_extent_map(shard) else {
                continue;
            };
            for (off, len, buf) in emap.iter() {
                let expect = computed.get_buffer(shard, off, len)?;
                if !buf.contents_equal(&expect) {
                    report.parity_match = false;
                    report.mismatched_shards.push(shard.0);
                    report
                        .notes
                        .push(format!("parity shard {shard} differs at [{off}, +{len})"));
                    break;
                }
            }
        }

        // Verify the hash record when one is stored.
        if let Some(blob) = self.store.get_attr(oid, self.sinfo.get_shard(0), HINFO_KEY)? {
            report.hash_match = Some(self.check_hashes(oid, &blob, &mut report.notes)?);
        }

        info!(%oid, consistent = report.consistent(), "checked object");
        Ok(report)
    }

    fn check_hashes(&self, oid: &ObjectId, blob: &[u8], notes: &mut Vec<String>) -> Result<bool> {
        let stored = HashInfo::decode(blob)?;
        if !stored.has_chunk_hash() {
            return Ok(true);
        }
        let hashed = stored.total_chunk_size();
        let mut recomputed = HashInfo::new(self.sinfo.k_plus_m());
        let mut chunks = Vec::with_capacity(self.sinfo.k_plus_m());
        for raw in 0..self.sinfo.k_plus_m() {
            let shard = self.sinfo.get_shard(raw);
            let data = self
                .store
                .read(oid, shard, &ExtentSet::from_range(0, hashed))?;
            let buf = data.get_buffer(0, hashed).map_err(|_| Error::Inconsistent {
                oid: oid.to_string(),
                reason: format!("shard {shard} shorter than its hashed size {hashed}"),
            })?;
            chunks.push(buf.to_bytes());
        }
        recomputed.append(0, &chunks);

        let mut ok = true;
        for raw in 0..self.sinfo.k_plus_m() {
            if recomputed.chunk_hash(raw) != stored.chunk_hash(raw) {
                ok = false;
                notes.push(format!(
                    "hash chain mismatch on raw shard {raw}: stored {:#010x}, computed {:#010x}",
                    stored.chunk_hash(raw),
                    recomputed.chunk_hash(raw)
                ));
            }
        }
        Ok(ok)
    }

    /// Check every object in the store.
    pub fn check_all(&self) -> Result<Vec<CheckReport>> {
        let mut reports = Vec::new();
        for oid in self.store.list_objects()? {
            reports.push(self.check_object(&oid)?);
        }
        Ok(reports)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReedSolomonCodec;
    use crate::extent::{BufferList, ExtentMap};
    use crate::store::MemStore;
    use bytes::Bytes;

    const CHUNK: u64 = 4096;

    fn setup(k: usize, m: usize) -> (Arc<StripeInfo>, Arc<ReedSolomonCodec>, Arc<MemStore>) {
        (
            Arc::new(StripeInfo::new(k, m, CHUNK * k as u64).unwrap()),
            Arc::new(ReedSolomonCodec::new(k, m, Vec::new()).unwrap()),
            Arc::new(MemStore::new()),
        )
    }

    fn store_object(
        sinfo: &Arc<StripeInfo>,
        codec: &ReedSolomonCodec,
        store: &MemStore,
        oid: &ObjectId,
        data: &[u8],
    ) {
        let mut semap = ShardExtentMap::new(sinfo.clone());
        let mut emap = ExtentMap::new();
        emap.insert(0, BufferList::from(data.to_vec()));
        semap.insert_ro_extent_map(&emap);
        for shard in sinfo.data_shards().collect::<Vec<_>>() {
            let size = sinfo.object_size_to_shard_size(data.len() as u64, shard);
            semap.zero_pad(shard, 0, align_page_next(size));
        }
        semap.insert_parity_buffers();
        semap.pad_and_rebuild_to_page_align();
        semap.encode(codec, None, 0).unwrap();

        for shard in sinfo.chunk_mapping().to_vec() {
            let size = sinfo.object_size_to_shard_size(data.len() as u64, shard);
            let mut writes = ExtentMap::new();
            if let Some(emap) = semap.get_extent_map(shard) {
                for (off, _, buf) in emap.iter() {
                    writes.insert(off, buf.clone());
                }
            }
            store.write(oid, shard, &writes, size).unwrap();
        }
    }

    #[test]
    fn test_clean_object_is_consistent() {
        let (sinfo, codec, store) = setup(2, 1);
        let oid = ObjectId::new("clean");
        let data: Vec<u8> = (0..2 * CHUNK).map(|i| (i % 239) as u8).collect();
        store_object(&sinfo, &codec, &store, &oid, &data);

        let checker = ConsistencyChecker::new(sinfo, codec, store);
        let report = checker.check_object(&oid).unwrap();
        assert!(report.consistent(), "notes: {:?}", report.notes);
        assert!(report.parity_match);
    }

    #[test]
    fn test_unaligned_object_is_consistent() {
        let (sinfo, codec, store) = setup(4, 2);
        let oid = ObjectId::new("tail");
        // An object ending mid-chunk: the short tail encodes as zeros.
        let data: Vec<u8> = (0..5 * CHUNK + 100).map(|i| (i % 251) as u8).collect();
        store_object(&sinfo, &codec, &store, &oid, &data);

        let checker = ConsistencyChecker::new(sinfo, codec, store);
        let report = checker.check_object(&oid).unwrap();
        assert!(report.consistent(), "notes: {:?}", report.notes);
    }

    #[test]
    fn test_corrupt_parity_detected() {
        let (sinfo, codec, store) = setup(2, 1);
        let oid = ObjectId::new("bad-parity");
        let data: Vec<u8> = (0..2 * CHUNK).map(|i| (i % 233) as u8).collect();
        store_object(&sinfo, &codec, &store, &oid, &data);

        // Flip one parity byte.
        let mut writes = ExtentMap::new();
        writes.insert(100, BufferList::from(Bytes::from_static(b"\xFF")));
        store.write(&oid, ShardId(2), &writes, CHUNK).unwrap();

        let checker = ConsistencyChecker::new(sinfo, codec, store);
        let report = checker.check_object(&oid).unwrap();
        assert!(!report.consistent());
        assert!(!report.parity_match);
        assert_eq!(report.mismatched_shards, vec![2]);
    }

    #[test]
    fn test_corrupt_data_detected() {
        let (sinfo, codec, store) = setup(2, 1);
        let oid = ObjectId::new("bad-data");
        let data: Vec<u8> = (0..2 * CHUNK).map(|i| (i % 229) as u8).collect();
        store_object(&sinfo, &codec, &store, &oid, &data);

        // Corrupt a data shard; the regenerated parity no longer matches
        // the stored parity.
        let mut writes = ExtentMap::new();
        writes.insert(0, BufferList::from(vec![0xAAu8; 16]));
        store.write(&oid, ShardId(0), &writes, CHUNK).unwrap();

        let checker = ConsistencyChecker::new(sinfo, codec, store);
        let report = checker.check_object(&oid).unwrap();
        assert!(!report.parity_match);
    }

    #[test]
    fn test_hash_record_verified() {
        let (sinfo, codec, store) = setup(2, 1);
        let oid = ObjectId::new("hashed");
        let data: Vec<u8> = (0..2 * CHUNK).map(|i| (i % 227) as u8).collect();
        store_object(&sinfo, &codec, &store, &oid, &data);

        // Build the matching hash record over one full stripe.
        let mut hinfo = HashInfo::new(3);
        let mut chunks = Vec::new();
        for shard in [ShardId(0), ShardId(1), ShardId(2)] {
            let read = store
                .read(&oid, shard, &ExtentSet::from_range(0, CHUNK))
                .unwrap();
            chunks.push(read.get_buffer(0, CHUNK).unwrap().to_bytes());
        }
        hinfo.append(0, &chunks);
        store
            .set_attr(&oid, ShardId(0), HINFO_KEY, Some(hinfo.encode()))
            .unwrap();

        let checker = ConsistencyChecker::new(sinfo.clone(), codec.clone(), store.clone());
        let report = checker.check_object(&oid).unwrap();
        assert_eq!(report.hash_match, Some(true));

        // A tampered record is flagged.
        let mut bad = HashInfo::new(3);
        bad.append(0, &vec![Bytes::from(vec![1u8; CHUNK as usize]); 3]);
        store
            .set_attr(&oid, ShardId(0), HINFO_KEY, Some(bad.encode()))
            .unwrap();
        let report = checker.check_object(&oid).unwrap();
        assert_eq!(report.hash_match, Some(false));
        assert!(!report.consistent());
    }

    #[test]
    fn test_empty_object() {
        let (sinfo, codec, store) = setup(2, 1);
        let checker = ConsistencyChecker::new(sinfo, codec, store);
        let report = checker.check_object(&ObjectId::new("missing")).unwrap();
        assert!(report.consistent());
    }
}
