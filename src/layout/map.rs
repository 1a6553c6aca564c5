//! Per-Shard Extent Map
//!
//! [`ShardExtentMap`] carries partial per-shard buffers through the read
//! and write pipelines. It projects to and from rados-object (RO) byte
//! coordinates, slices on stripe rows for the codec, generates parity and
//! reconstructs erased shards.
//!
//! The cached `ro_start..ro_end` range covers every data-shard extent;
//! `start_offset..end_offset` covers every shard extent in shard-offset
//! space. `u64::MAX` is the invalid sentinel for all four.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::ErasureCodec;
use crate::error::{Error, Result};
use crate::extent::{BufferList, ExtentMap, ExtentSet};
use crate::hash_info::HashInfo;
use crate::layout::ShardExtentSet;
use crate::shard::{ShardId, ShardMap, ShardSet};
use crate::stripe::{StripeInfo, PAGE_SIZE};

/// Sentinel for "no offset cached".
pub const INVALID_OFFSET: u64 = u64::MAX;

/// One stripe-row slice: every participating shard's contiguous fragment
/// for `[offset, offset + length)` in shard-offset space. The granularity
/// at which the codec is invoked.
#[derive(Debug, Clone)]
pub struct ShardSlice {
    pub offset: u64,
    pub length: u64,
    pub shards: ShardMap<Bytes>,
}

/// Mapping from shard id to buffered extents, tied to a stripe geometry.
#[derive(Clone)]
pub struct ShardExtentMap {
    sinfo: Arc<StripeInfo>,
    maps: ShardMap<ExtentMap>,
    ro_start: u64,
    ro_end: u64,
    start_offset: u64,
    end_offset: u64,
}

impl ShardExtentMap {
    pub fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            sinfo,
            maps: ShardMap::new(),
            ro_start: INVALID_OFFSET,
            ro_end: INVALID_OFFSET,
            start_offset: INVALID_OFFSET,
            end_offset: INVALID_OFFSET,
        }
    }

    /// Build from per-shard maps; empty shard entries are discarded.
    pub fn from_maps(sinfo: Arc<StripeInfo>, mut maps: ShardMap<ExtentMap>) -> Self {
        maps.retain(|_, emap| !emap.is_empty());
        let mut out = Self::new(sinfo);
        out.maps = maps;
        out.compute_ro_range();
        out
    }

    pub fn stripe_info(&self) -> &Arc<StripeInfo> {
        &self.sinfo
    }

    pub fn is_empty(&self) -> bool {
        self.ro_end == INVALID_OFFSET
    }

    pub fn ro_start(&self) -> u64 {
        self.ro_start
    }

    pub fn ro_end(&self) -> u64 {
        self.ro_end
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn contains_shard(&self, shard: ShardId) -> bool {
        self.maps.contains(shard)
    }

    pub fn shards(&self) -> ShardSet {
        self.maps.keys()
    }

    pub fn get_extent_map(&self, shard: ShardId) -> Option<&ExtentMap> {
        self.maps.get(shard)
    }

    pub fn get_extent_set(&self, shard: ShardId) -> Option<ExtentSet> {
        self.maps.get(shard).map(|emap| emap.get_interval_set())
    }

    pub fn get_shard_extent_set(&self) -> ShardExtentSet {
        let mut out = ShardExtentSet::new();
        for (shard, emap) in self.maps.iter() {
            out.insert_extent_set(shard, &emap.get_interval_set());
        }
        out
    }

    pub fn get_extent_superset(&self) -> ExtentSet {
        let mut superset = ExtentSet::new();
        for (_, emap) in self.maps.iter() {
            superset.union_with(&emap.get_interval_set());
        }
        superset
    }

    /// True if every extent of `set` is buffered.
    pub fn contains_set(&self, set: &ShardExtentSet) -> bool {
        set.iter().all(|(shard, eset)| {
            self.maps
                .get(shard)
                .map(|emap| emap.contains_set(eset))
                .unwrap_or(false)
        })
    }

    /// Sum of buffered bytes across all shards.
    pub fn size(&self) -> u64 {
        self.maps.iter().map(|(_, emap)| emap.size()).sum()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.compute_ro_range();
    }

    // =========================================================================
    // RO range bookkeeping
    // =========================================================================

    /// RO offset of a byte at `shard_offset` within raw shard `raw_shard`.
    fn calc_ro_offset(&self, raw_shard: usize, shard_offset: u64) -> u64 {
        let chunk = self.sinfo.chunk_size();
        let stripes = shard_offset / chunk;
        stripes * self.sinfo.stripe_width() + raw_shard as u64 * chunk + shard_offset % chunk
    }

    fn calc_ro_end(&self, raw_shard: usize, shard_offset_end: u64) -> u64 {
        self.calc_ro_offset(raw_shard, shard_offset_end - 1) + 1
    }

    fn compute_ro_range(&mut self) {
        let mut start = INVALID_OFFSET;
        let mut end = 0;
        let mut o_start = INVALID_OFFSET;
        let mut o_end = 0;

        for (shard, emap) in self.maps.iter() {
            let raw_shard = self.sinfo.get_raw_shard(shard);
            let start_off = emap.start_off().unwrap();
            let end_off = emap.end_off().unwrap();
            o_start = o_start.min(start_off);
            o_end = o_end.max(end_off);

            if raw_shard < self.sinfo.k() {
                start = start.min(self.calc_ro_offset(raw_shard, start_off));
                end = end.max(self.calc_ro_end(raw_shard, end_off));
            }
        }
        if end != 0 {
            self.ro_start = start;
            self.ro_end = end;
            self.start_offset = o_start;
            self.end_offset = o_end;
        } else {
            self.ro_start = INVALID_OFFSET;
            self.ro_end = INVALID_OFFSET;
            self.start_offset = INVALID_OFFSET;
            self.end_offset = INVALID_OFFSET;
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Merge a buffer into one shard at a shard offset. Empty buffers are
    /// no-ops.
    pub fn insert_in_shard(&mut self, shard: ShardId, off: u64, buf: BufferList) {
        if buf.is_empty() {
            return;
        }
        self.maps.entry_or_default(shard).insert(off, buf);
        self.compute_ro_range();
    }

    /// Merge every buffer of `other` into `self` (later data wins).
    pub fn insert(&mut self, other: &ShardExtentMap) {
        for (shard, emap) in other.maps.iter() {
            self.maps.entry_or_default(shard).insert_map(emap);
        }
        self.compute_ro_range();
    }

    /// Split an RO-contiguous extent map stripe-by-stripe and scatter it
    /// into the data shards.
    pub fn insert_ro_extent_map(&mut self, host: &ExtentMap) {
        for (off, len, buf) in host.iter() {
            let sinfo = self.sinfo.clone();
            sinfo.ro_range_to_shard_extent_map(off, len, buf, self);
        }
    }

    /// Insert zero buffers covering an RO range.
    pub fn insert_ro_zero_buffer(&mut self, ro_offset: u64, ro_length: u64) {
        if ro_length == 0 {
            return;
        }
        let zeros = BufferList::zeros(ro_length.min(self.sinfo.chunk_size()));
        let sinfo = self.sinfo.clone();
        for (raw, off, len) in sinfo.ro_range_segments(ro_offset, ro_length) {
            self.maps
                .entry_or_default(sinfo.get_shard(raw))
                .insert(off, zeros.substr_of(0, len));
        }
        self.compute_ro_range();
    }

    /// Extend the map with implicit zeros to a new RO length. A no-op when
    /// the map already reaches `ro_offset`.
    pub fn append_zeros_to_ro_offset(&mut self, ro_offset: u64) {
        let ro_end = if self.ro_end == INVALID_OFFSET {
            0
        } else {
            self.ro_end
        };
        if ro_offset <= ro_end {
            return;
        }
        self.insert_ro_zero_buffer(ro_end, ro_offset - ro_end);
    }

    /// For every data-shard extent, create zero-filled placeholders in
    /// every parity shard covering the same shard-offset ranges.
    pub fn insert_parity_buffers(&mut self) {
        let mut superset = ExtentSet::new();
        for (shard, emap) in self.maps.iter() {
            if self.sinfo.is_data_shard(shard) {
                superset.union_with(&emap.get_interval_set());
            }
        }
        if superset.is_empty() {
            return;
        }
        let parity: Vec<ShardId> = self.sinfo.parity_shards().collect();
        for shard in parity {
            let mut missing = superset.clone();
            if let Some(emap) = self.maps.get(shard) {
                missing.subtract(&emap.get_interval_set());
            }
            for (off, len) in missing.iter().collect::<Vec<_>>() {
                self.maps
                    .entry_or_default(shard)
                    .insert(off, BufferList::zeros(len));
            }
        }
        self.compute_ro_range();
    }

    // =========================================================================
    // Erasure
    // =========================================================================

    pub fn erase_shard(&mut self, shard: ShardId) {
        self.maps.remove(shard);
        self.compute_ro_range();
    }

    /// Remove `[off, off + len)` (shard offsets) from every shard.
    pub fn erase_stripe(&mut self, off: u64, len: u64) {
        self.maps.retain(|_, emap| {
            emap.erase(off, len);
            !emap.is_empty()
        });
        self.compute_ro_range();
    }

    /// Drop everything at RO offsets at or beyond `ro_offset`. Parity
    /// shards are trimmed from the start of the boundary stripe, since the
    /// boundary stripe's parity has to be regenerated anyway.
    pub fn erase_after_ro_offset(&mut self, ro_offset: u64) {
        let sinfo = self.sinfo.clone();
        self.maps.retain(|shard, emap| {
            let raw = sinfo.get_raw_shard(shard);
            let threshold = if raw < sinfo.k() {
                sinfo.ro_offset_to_shard_offset(ro_offset, raw)
            } else {
                sinfo.ro_offset_to_prev_chunk_offset(ro_offset)
            };
            if let Some(end) = emap.end_off() {
                if end > threshold {
                    emap.erase(threshold, end - threshold);
                }
            }
            !emap.is_empty()
        });
        self.compute_ro_range();
    }

    // =========================================================================
    // Intersection / slicing
    // =========================================================================

    /// New map whose data-shard ranges intersect the RO window; parity
    /// shards are intersected at the window's chunk-aligned stripe bounds.
    pub fn intersect_ro_range(&self, ro_offset: u64, ro_length: u64) -> ShardExtentMap {
        let mut out = ShardMap::new();
        for (shard, emap) in self.maps.iter() {
            let raw = self.sinfo.get_raw_shard(shard);
            let (start, end) = if raw < self.sinfo.k() {
                (
                    self.sinfo.ro_offset_to_shard_offset(ro_offset, raw),
                    self.sinfo
                        .ro_offset_to_shard_offset(ro_offset + ro_length, raw),
                )
            } else {
                (
                    self.sinfo.ro_offset_to_prev_chunk_offset(ro_offset),
                    self.sinfo.ro_offset_to_next_chunk_offset(ro_offset + ro_length),
                )
            };
            if end > start {
                let cut = emap.intersect(start, end - start);
                if !cut.is_empty() {
                    out.insert(shard, cut);
                }
            }
        }
        ShardExtentMap::from_maps(self.sinfo.clone(), out)
    }

    /// New map restricted to the given per-shard extent set.
    pub fn intersect(&self, other: &ShardExtentSet) -> ShardExtentMap {
        let mut out = ShardMap::new();
        for (shard, emap) in self.maps.iter() {
            let Some(eset) = other.get(shard) else {
                continue;
            };
            let mut cut = ExtentMap::new();
            for (off, len) in eset.iter() {
                cut.insert_map(&emap.intersect(off, len));
            }
            if !cut.is_empty() {
                out.insert(shard, cut);
            }
        }
        ShardExtentMap::from_maps(self.sinfo.clone(), out)
    }

    /// Per-shard flattened buffers for `[off, off + len)` in shard-offset
    /// space. Shards with no bytes in the window are omitted.
    pub fn slice(&self, off: u64, len: u64) -> ShardMap<BufferList> {
        let mut out = ShardMap::new();
        for (shard, emap) in self.maps.iter() {
            let cut = emap.intersect(off, len);
            if cut.is_empty() {
                continue;
            }
            let mut bl = BufferList::new();
            for (_, _, buf) in cut.iter() {
                bl.claim_append(buf.clone());
            }
            out.insert(shard, bl);
        }
        out
    }

    /// New map restricted to `[off, off + len)` in shard-offset space.
    pub fn slice_map(&self, off: u64, len: u64) -> ShardExtentMap {
        let mut out = ShardMap::new();
        for (shard, emap) in self.maps.iter() {
            let cut = emap.intersect(off, len);
            if !cut.is_empty() {
                out.insert(shard, cut);
            }
        }
        ShardExtentMap::from_maps(self.sinfo.clone(), out)
    }

    // =========================================================================
    // Buffer extraction
    // =========================================================================

    /// Buffer for a single shard range. Fails with [`Error::Gap`] on a
    /// hole.
    pub fn get_buffer(&self, shard: ShardId, off: u64, len: u64) -> Result<BufferList> {
        match self.maps.get(shard) {
            Some(emap) => emap.get_buffer(off, len),
            None => Err(Error::Gap {
                offset: off,
                length: len,
            }),
        }
    }

    /// Reassemble a contiguous RO buffer from the data shards. Fails with
    /// [`Error::Gap`] if the range is not fully covered.
    pub fn get_ro_buffer(&self, ro_offset: u64, ro_length: u64) -> Result<BufferList> {
        let mut out = BufferList::new();
        for (raw, off, len) in self.sinfo.ro_range_segments(ro_offset, ro_length) {
            out.claim_append(self.get_buffer(self.sinfo.get_shard(raw), off, len)?);
        }
        Ok(out)
    }

    /// The whole map as one contiguous RO buffer, assuming full coverage
    /// of `ro_start..ro_end`.
    pub fn get_full_ro_buffer(&self) -> Result<BufferList> {
        if self.is_empty() {
            return Ok(BufferList::new());
        }
        self.get_ro_buffer(self.ro_start, self.ro_end - self.ro_start)
    }

    // =========================================================================
    // Padding
    // =========================================================================

    /// Insert zeros into `shard` wherever `[off, off + len)` is not yet
    /// buffered.
    pub fn zero_pad(&mut self, shard: ShardId, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut missing = ExtentSet::from_range(off, len);
        if let Some(emap) = self.maps.get(shard) {
            missing.subtract(&emap.get_interval_set());
        }
        for (moff, mlen) in missing.iter().collect::<Vec<_>>() {
            self.maps
                .entry_or_default(shard)
                .insert(moff, BufferList::zeros(mlen));
        }
        self.compute_ro_range();
    }

    /// Grow every extent of every shard outward to page bounds with zeros
    /// and rebuild each run contiguous, so codec slices see page-aligned
    /// contiguous memory.
    pub fn pad_and_rebuild_to_page_align(&mut self) {
        let shards: Vec<ShardId> = self.maps.keys().iter().collect();
        for shard in shards {
            let eset = self.get_extent_set(shard).unwrap();
            for (off, len) in eset.iter().collect::<Vec<_>>() {
                let (poff, plen) = self.sinfo.offset_len_to_page_bounds(off, len);
                self.zero_pad(shard, poff, plen);
            }
            if let Some(emap) = self.maps.get_mut(shard) {
                emap.rebuild_buffers();
            }
        }
        self.compute_ro_range();
    }

    // =========================================================================
    // Slice iteration
    // =========================================================================

    /// Stripe-row slices in ascending shard-offset order. A new slice
    /// starts at every extent or fragment boundary of any shard, so each
    /// participating shard contributes one contiguous fragment per slice.
    /// Advances across shard-level gaps.
    pub fn slices(&self) -> Vec<ShardSlice> {
        let mut bounds: Vec<u64> = Vec::new();
        for (_, emap) in self.maps.iter() {
            for (off, len, buf) in emap.iter() {
                bounds.push(off);
                let mut at = off;
                for frag in buf.fragments() {
                    at += frag.len() as u64;
                    bounds.push(at);
                }
                debug_assert_eq!(at, off + len);
            }
        }
        bounds.sort_unstable();
        bounds.dedup();

        let mut out = Vec::new();
        for window in bounds.windows(2) {
            let (start, end) = (window[0], window[1]);
            let mut shards = ShardMap::new();
            for (shard, emap) in self.maps.iter() {
                if !emap.get_interval_set().contains(start, end - start) {
                    continue;
                }
                let buf = emap.get_buffer(start, end - start).unwrap();
                shards.insert(shard, buf.to_bytes());
            }
            if !shards.is_empty() {
                out.push(ShardSlice {
                    offset: start,
                    length: end - start,
                    shards,
                });
            }
        }
        out
    }

    // =========================================================================
    // Encode / decode
    // =========================================================================

    /// Generate parity for every buffered stripe row.
    ///
    /// Parity placeholders are created if absent. Data shards missing from
    /// a row contribute zeros, which is how the short tail of the last
    /// partial stripe is handled. Every encoded slice must be page-aligned
    /// ([`Error::BadAlignment`] otherwise).
    ///
    /// When `hinfo` is supplied and carries hashes, rows appended at or
    /// beyond the previously hashed size are folded into the per-shard
    /// hash chains; `before_ro_size` is the object's RO size before this
    /// write.
    pub fn encode(
        &mut self,
        codec: &dyn ErasureCodec,
        mut hinfo: Option<&mut HashInfo>,
        before_ro_size: u64,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let has_parity = self
            .sinfo
            .parity_shards()
            .any(|shard| self.maps.contains(shard));
        if !has_parity {
            self.insert_parity_buffers();
        }

        let k = self.sinfo.k();
        let m = self.sinfo.m();
        let hashed_to = hinfo
            .as_ref()
            .filter(|h| h.has_chunk_hash())
            .map(|h| h.total_chunk_size());

        let mut inserts: Vec<(ShardId, u64, Bytes)> = Vec::new();
        let mut appends: Vec<(u64, Vec<Bytes>)> = Vec::new();

        for slice in self.slices() {
            let parity_present: Vec<ShardId> = self
                .sinfo
                .parity_shards()
                .filter(|shard| slice.shards.contains(*shard))
                .collect();
            if parity_present.is_empty() {
                continue;
            }
            if slice.offset % PAGE_SIZE != 0 || slice.length % PAGE_SIZE != 0 {
                return Err(Error::BadAlignment {
                    offset: slice.offset,
                    length: slice.length,
                });
            }

            let data: Vec<Bytes> = (0..k)
                .map(|raw| {
                    slice
                        .shards
                        .get(self.sinfo.get_shard(raw))
                        .cloned()
                        .unwrap_or_else(|| Bytes::from(vec![0u8; slice.length as usize]))
                })
                .collect();
            let mut parity: Vec<BytesMut> = (0..m)
                .map(|_| BytesMut::zeroed(slice.length as usize))
                .collect();
            codec.encode_chunks(&data, &mut parity)?;

            let parity: Vec<Bytes> = parity.into_iter().map(BytesMut::freeze).collect();
            for (raw_coding, buf) in parity.iter().enumerate() {
                let shard = self.sinfo.get_shard(k + raw_coding);
                if parity_present.contains(&shard) {
                    inserts.push((shard, slice.offset, buf.clone()));
                }
            }

            if let Some(hashed_to) = hashed_to {
                if slice.offset >= hashed_to {
                    let mut chunks = data;
                    chunks.extend(parity);
                    appends.push((slice.offset, chunks));
                }
            }
        }

        for (shard, off, buf) in inserts {
            self.maps
                .entry_or_default(shard)
                .insert(off, BufferList::from(buf));
        }
        self.compute_ro_range();

        if let Some(hinfo) = hinfo.as_mut() {
            for (offset, chunks) in appends {
                hinfo.append(offset, &chunks);
            }
        }
        trace!(
            ro_start = self.ro_start,
            ro_end = self.ro_end,
            before_ro_size,
            "encoded parity"
        );
        Ok(())
    }

    /// Reconstruct the wanted extents that are not already buffered, using
    /// the codec and whatever shards are present. Fails with
    /// [`Error::InsufficientShards`] when a wanted row has fewer than `k`
    /// present chunks.
    pub fn decode(&mut self, codec: &dyn ErasureCodec, want: &ShardExtentSet) -> Result<()> {
        let mut missing = want.clone();
        for (shard, emap) in self.maps.iter() {
            if missing.contains(shard) {
                let covered = emap.get_interval_set();
                let mut cut = ShardExtentSet::new();
                cut.insert_extent_set(shard, &covered);
                missing.subtract(&cut);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let have = self.maps.keys();
        // Validates recoverability; the per-row gather below reads from
        // every present shard.
        codec.minimum_to_decode(&missing.keys(), &have)?;

        let k = self.sinfo.k();
        let total = self.sinfo.k_plus_m();

        // Decode over elementary intervals: every missing extent either
        // fully covers such an interval or misses it entirely, so rows
        // missing on different shards never force one gather to span
        // both.
        let mut cuts: Vec<u64> = Vec::new();
        for (_, eset) in missing.iter() {
            for (off, len) in eset.iter() {
                cuts.push(off);
                cuts.push(off + len);
            }
        }
        cuts.sort_unstable();
        cuts.dedup();

        let mut inserts: Vec<(ShardId, u64, Bytes)> = Vec::new();
        for window in cuts.windows(2) {
            let (off, end) = (window[0], window[1]);
            let len = end - off;
            let want_raws: ShardSet = (0..total)
                .filter(|&raw| {
                    let shard = self.sinfo.get_shard(raw);
                    missing
                        .get(shard)
                        .map(|eset| eset.contains(off, len))
                        .unwrap_or(false)
                })
                .map(ShardId::from)
                .collect();
            if want_raws.is_empty() {
                continue;
            }

            let mut chunks: Vec<Option<Bytes>> = (0..total)
                .map(|raw| {
                    let shard = self.sinfo.get_shard(raw);
                    self.maps
                        .get(shard)
                        .and_then(|emap| emap.get_buffer(off, len).ok())
                        .map(|buf| buf.to_bytes())
                })
                .collect();
            let available = chunks.iter().filter(|c| c.is_some()).count();
            if available < k {
                return Err(Error::InsufficientShards {
                    available,
                    required: k,
                });
            }
            codec.decode_chunks(&want_raws, &mut chunks)?;

            for raw in want_raws.iter() {
                let shard = self.sinfo.get_shard(raw.index());
                let decoded = chunks[raw.index()]
                    .as_ref()
                    .ok_or_else(|| Error::DecodeFailure(format!("chunk {raw} not produced")))?;
                inserts.push((shard, off, decoded.clone()));
            }
        }

        for (shard, off, buf) in inserts {
            self.maps
                .entry_or_default(shard)
                .insert(off, BufferList::from(buf));
        }
        self.compute_ro_range();
        Ok(())
    }

    // =========================================================================
    // Comparison helpers
    // =========================================================================

    /// Byte-wise comparison against another map over this map's extents.
    pub fn buffers_equal(&self, other: &ShardExtentMap) -> bool {
        for (shard, emap) in self.maps.iter() {
            for (off, len, buf) in emap.iter() {
                match other.get_buffer(shard, off, len) {
                    Ok(theirs) => {
                        if !buf.contents_equal(&theirs) {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
        }
        true
    }
}

impl PartialEq for ShardExtentMap {
    fn eq(&self, other: &Self) -> bool {
        self.ro_start == other.ro_start
            && self.ro_end == other.ro_end
            && self.maps == other.maps
    }
}

impl Eq for ShardExtentMap {}

impl fmt::Debug for ShardExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardExtentMap(ro=[{},{}) ", self.ro_start, self.ro_end)?;
        f.debug_map()
            .entries(self.maps.iter().map(|(s, m)| (s, m.get_interval_set())))
            .finish()?;
        write!(f, ")")
    }
}

// =============================================================================
// Tests
// =============================================================================
