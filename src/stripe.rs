//! Stripe Geometry
//!
//! [`StripeInfo`] is the immutable description of how a rados-object (RO)
//! byte range maps onto `k` data shards and `m` parity shards: chunk and
//! stripe sizes, the chunk-mapping permutation, and the codec feature
//! flags. Everything here is pure computation; no I/O.
//!
//! Coordinates: "RO" offsets address the user-visible object before
//! striping. "Shard" offsets address bytes within one shard. A "raw" shard
//! is the codec's ordering before the chunk-mapping permutation.

use crate::codec::{ErasureCodec, PluginFlags};
use crate::error::{Error, Result};
use crate::extent::{BufferList, ExtentSet};
use crate::layout::{ShardExtentMap, ShardExtentSet};
use crate::shard::{ShardId, ShardSet};

/// Codec granularity requirement; encode/decode inputs are padded to this.
pub const PAGE_SIZE: u64 = 4096;

/// Round `val` up to the next page boundary.
pub fn align_page_next(val: u64) -> u64 {
    (val + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `val` down to the previous page boundary.
pub fn align_page_prev(val: u64) -> u64 {
    val & !(PAGE_SIZE - 1)
}

/// Immutable stripe geometry for one placement group.
#[derive(Debug, Clone)]
pub struct StripeInfo {
    stripe_width: u64,
    chunk_size: u64,
    k: usize,
    m: usize,
    flags: PluginFlags,
    ec_overwrites: bool,
    /// raw shard index -> shard id
    chunk_mapping: Vec<ShardId>,
    /// shard id index -> raw shard index
    chunk_mapping_reverse: Vec<usize>,
    /// Shards that do not require metadata updates.
    nonprimary: ShardSet,
}

impl StripeInfo {
    /// Geometry with an identity mapping and every optimization enabled.
    /// This is the constructor the test harnesses use.
    pub fn new(k: usize, m: usize, stripe_width: u64) -> Result<Self> {
        Self::with_mapping(k, m, stripe_width, Vec::new())
    }

    /// Geometry with an explicit chunk-mapping permutation. A mapping
    /// shorter than `k + m` is completed with identity entries.
    pub fn with_mapping(
        k: usize,
        m: usize,
        stripe_width: u64,
        mapping: Vec<ShardId>,
    ) -> Result<Self> {
        Self::build(k, m, stripe_width, mapping, PluginFlags::ALL, true)
    }

    /// Geometry taken from a codec instance.
    pub fn from_codec(codec: &dyn ErasureCodec, stripe_width: u64) -> Result<Self> {
        Self::build(
            codec.data_chunk_count(),
            codec.chunk_count() - codec.data_chunk_count(),
            stripe_width,
            codec.chunk_mapping().to_vec(),
            codec.supported_optimizations(),
            true,
        )
    }

    fn build(
        k: usize,
        m: usize,
        stripe_width: u64,
        mapping: Vec<ShardId>,
        flags: PluginFlags,
        ec_overwrites: bool,
    ) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidGeometry("k must be non-zero".into()));
        }
        if stripe_width == 0 || stripe_width % k as u64 != 0 {
            return Err(Error::InvalidGeometry(format!(
                "stripe width {stripe_width} is not a positive multiple of k={k}"
            )));
        }
        let chunk_mapping = Self::complete_chunk_mapping(mapping, k + m)?;
        let chunk_mapping_reverse = Self::reverse_chunk_mapping(&chunk_mapping)?;
        Ok(Self {
            stripe_width,
            chunk_size: stripe_width / k as u64,
            k,
            m,
            flags,
            ec_overwrites,
            chunk_mapping,
            chunk_mapping_reverse,
            nonprimary: ShardSet::new(),
        })
    }

    /// Builder: mark shards that take no metadata updates.
    pub fn with_nonprimary(mut self, nonprimary: ShardSet) -> Self {
        self.nonprimary = nonprimary;
        self
    }

    /// Builder: set whether the pool allows EC overwrites.
    pub fn with_ec_overwrites(mut self, enabled: bool) -> Self {
        self.ec_overwrites = enabled;
        self
    }

    fn complete_chunk_mapping(mapping: Vec<ShardId>, n: usize) -> Result<Vec<ShardId>> {
        if mapping.len() > n {
            return Err(Error::InvalidGeometry(format!(
                "chunk mapping has {} entries for {n} shards",
                mapping.len()
            )));
        }
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(mapping.get(i).copied().unwrap_or_else(|| ShardId::from(i)));
        }
        Ok(out)
    }

    fn reverse_chunk_mapping(mapping: &[ShardId]) -> Result<Vec<usize>> {
        let n = mapping.len();
        let mut reverse = vec![usize::MAX; n];
        for (raw, shard) in mapping.iter().enumerate() {
            let idx = shard.index();
            if idx >= n || reverse[idx] != usize::MAX {
                return Err(Error::InvalidGeometry(format!(
                    "chunk mapping is not a permutation of 0..{n}"
                )));
            }
            reverse[idx] = raw;
        }
        Ok(reverse)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn k_plus_m(&self) -> usize {
        self.k + self.m
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn stripe_width(&self) -> u64 {
        self.stripe_width
    }

    pub fn chunk_mapping(&self) -> &[ShardId] {
        &self.chunk_mapping
    }

    /// Shard id holding the given raw (codec-order) shard.
    pub fn get_shard(&self, raw_shard: usize) -> ShardId {
        self.chunk_mapping[raw_shard]
    }

    /// Raw (codec-order) index of the given shard id.
    pub fn get_raw_shard(&self, shard: ShardId) -> usize {
        self.chunk_mapping_reverse[shard.index()]
    }

    pub fn is_data_shard(&self, shard: ShardId) -> bool {
        self.get_raw_shard(shard) < self.k
    }

    pub fn is_parity_shard(&self, shard: ShardId) -> bool {
        !self.is_data_shard(shard)
    }

    pub fn data_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.chunk_mapping[..self.k].iter().copied()
    }

    pub fn parity_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.chunk_mapping[self.k..].iter().copied()
    }

    pub fn all_shards(&self) -> ShardSet {
        self.chunk_mapping.iter().copied().collect()
    }

    /// True if `shard` does not require metadata updates.
    pub fn is_nonprimary_shard(&self, shard: ShardId) -> bool {
        self.nonprimary.contains(shard)
    }

    pub fn supports_partial_reads(&self) -> bool {
        self.flags.contains(PluginFlags::PARTIAL_READ)
    }

    pub fn supports_partial_writes(&self) -> bool {
        self.flags.contains(PluginFlags::PARTIAL_WRITE)
    }

    pub fn supports_ec_overwrites(&self) -> bool {
        self.ec_overwrites
    }

    pub fn require_hinfo(&self) -> bool {
        !self.supports_ec_overwrites()
    }

    // =========================================================================
    // Coordinate arithmetic
    // =========================================================================

    pub fn ro_offset_is_stripe_aligned(&self, ro_offset: u64) -> bool {
        ro_offset % self.stripe_width == 0
    }

    pub fn ro_offset_to_prev_stripe_offset(&self, ro_offset: u64) -> u64 {
        ro_offset - ro_offset % self.stripe_width
    }

    pub fn ro_offset_to_next_stripe_offset(&self, ro_offset: u64) -> u64 {
        ro_offset.div_ceil(self.stripe_width) * self.stripe_width
    }

    /// Shard offset of the stripe containing `ro_offset` (rounds down).
    pub fn ro_offset_to_prev_chunk_offset(&self, ro_offset: u64) -> u64 {
        (ro_offset / self.stripe_width) * self.chunk_size
    }

    /// Shard offset of the stripe after `ro_offset` (rounds up).
    pub fn ro_offset_to_next_chunk_offset(&self, ro_offset: u64) -> u64 {
        ro_offset.div_ceil(self.stripe_width) * self.chunk_size
    }

    /// Stripe-aligned RO offset to the matching shard offset.
    pub fn aligned_ro_offset_to_chunk_offset(&self, ro_offset: u64) -> u64 {
        assert!(self.ro_offset_is_stripe_aligned(ro_offset));
        (ro_offset / self.stripe_width) * self.chunk_size
    }

    /// Chunk-aligned shard offset back to the RO offset of its stripe.
    pub fn aligned_chunk_offset_to_ro_offset(&self, chunk_offset: u64) -> u64 {
        assert!(chunk_offset % self.chunk_size == 0);
        (chunk_offset / self.chunk_size) * self.stripe_width
    }

    /// RO length rounded up to whole stripes, expressed per shard.
    pub fn chunk_aligned_ro_length_to_shard_length(&self, len: u64) -> u64 {
        len.div_ceil(self.stripe_width) * self.chunk_size
    }

    /// Inflate an RO range to stripe bounds.
    pub fn offset_len_to_stripe_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = self.ro_offset_to_prev_stripe_offset(off);
        let end = self.ro_offset_to_next_stripe_offset(off + len);
        (start, end - start)
    }

    /// Inflate a shard range to chunk bounds.
    pub fn offset_len_to_chunk_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = off - off % self.chunk_size;
        let end = (off + len).div_ceil(self.chunk_size) * self.chunk_size;
        (start, end - start)
    }

    /// Inflate a range to page bounds.
    pub fn offset_len_to_page_bounds(&self, off: u64, len: u64) -> (u64, u64) {
        let start = align_page_prev(off);
        let end = align_page_next(off + len);
        (start, end - start)
    }

    /// Offset within a raw data shard for an RO offset. For raw shards
    /// before the one holding `ro_offset` the result is one past their
    /// contribution to the stripe; for later raw shards it is the start of
    /// their chunk.
    pub fn ro_offset_to_shard_offset(&self, ro_offset: u64, raw_shard: usize) -> u64 {
        let full_stripes = (ro_offset / self.stripe_width) * self.chunk_size;
        let offset_shard = ((ro_offset / self.chunk_size) % self.k as u64) as usize;
        if raw_shard == offset_shard {
            full_stripes + ro_offset % self.chunk_size
        } else if raw_shard < offset_shard {
            full_stripes + self.chunk_size
        } else {
            full_stripes
        }
    }

    /// On-disk length of `shard` for an object of RO size `size`. Parity
    /// shards share shard-0's size.
    pub fn object_size_to_shard_size(&self, size: u64, shard: ShardId) -> u64 {
        let mut remainder = size % self.stripe_width;
        let mut shard_size = (size - remainder) / self.k as u64;
        let mut raw_shard = self.get_raw_shard(shard);
        if raw_shard >= self.k {
            // coding parity shards have same size as data shard 0
            raw_shard = 0;
        }
        if remainder > raw_shard as u64 * self.chunk_size {
            remainder -= raw_shard as u64 * self.chunk_size;
            shard_size += remainder.min(self.chunk_size);
        }
        shard_size
    }

    // =========================================================================
    // RO range decomposition
    // =========================================================================

    /// Walk `[ro_offset, ro_offset + ro_len)` chunk segment by chunk
    /// segment, emitting `(raw_shard, shard_offset, segment_len)`.
    fn ro_range_to_shards(
        &self,
        ro_offset: u64,
        ro_len: u64,
        mut emit: impl FnMut(usize, u64, u64),
    ) {
        let end = ro_offset + ro_len;
        let mut pos = ro_offset;
        while pos < end {
            let chunk_end = (pos / self.chunk_size + 1) * self.chunk_size;
            let seg_len = chunk_end.min(end) - pos;
            let raw_shard = ((pos / self.chunk_size) % self.k as u64) as usize;
            let shard_offset = (pos / self.stripe_width) * self.chunk_size + pos % self.chunk_size;
            emit(raw_shard, shard_offset, seg_len);
            pos += seg_len;
        }
    }

    /// Chunk-segment decomposition of an RO range as
    /// `(raw_shard, shard_offset, len)` tuples in RO order.
    pub(crate) fn ro_range_segments(&self, ro_offset: u64, ro_len: u64) -> Vec<(usize, u64, u64)> {
        let mut out = Vec::new();
        self.ro_range_to_shards(ro_offset, ro_len, |raw, off, len| out.push((raw, off, len)));
        out
    }

    /// Minimal per-data-shard cover of an RO byte range. Never emits
    /// parity shards.
    pub fn ro_range_to_shard_extent_set(&self, ro_offset: u64, ro_len: u64) -> ShardExtentSet {
        let mut out = ShardExtentSet::new();
        self.ro_range_to_shards(ro_offset, ro_len, |raw, off, len| {
            out.insert(self.get_shard(raw), off, len);
        });
        out
    }

    /// As [`Self::ro_range_to_shard_extent_set`], plus every parity shard
    /// covering the union of the data-shard extents, so parity is rebuilt
    /// for exactly the touched stripe bytes.
    pub fn ro_range_to_shard_extent_set_with_parity(
        &self,
        ro_offset: u64,
        ro_len: u64,
    ) -> ShardExtentSet {
        let mut out = ShardExtentSet::new();
        let mut superset = ExtentSet::new();
        self.ro_range_to_shards(ro_offset, ro_len, |raw, off, len| {
            out.insert(self.get_shard(raw), off, len);
            superset.insert(off, len);
        });
        if !superset.is_empty() {
            for shard in self.parity_shards() {
                out.insert_extent_set(shard, &superset);
            }
        }
        out
    }

    /// Split `buf` along chunk boundaries and scatter the slices into the
    /// correct data shards.
    pub fn ro_range_to_shard_extent_map(
        &self,
        ro_offset: u64,
        ro_len: u64,
        buf: &BufferList,
        out: &mut ShardExtentMap,
    ) {
        assert_eq!(buf.len(), ro_len);
        self.ro_range_to_shards(ro_offset, ro_len, |raw, off, len| {
            let buf_off = {
                // Distance travelled so far through the RO range.
                let stripes_done = off / self.chunk_size * self.stripe_width;
                let ro_pos = stripes_done + raw as u64 * self.chunk_size + off % self.chunk_size;
                ro_pos - ro_offset
            };
            out.insert_in_shard(self.get_shard(raw), off, buf.substr_of(buf_off, len));
        });
    }

    // =========================================================================
    // Size masks
    // =========================================================================

    /// Per-shard byte ranges backed by existing data for an object of RO
    /// size `size`, page-aligned. Includes parity shards.
    pub fn ro_size_to_read_mask(&self, size: u64) -> ShardExtentSet {
        let mut out = ShardExtentSet::new();
        for shard in self.chunk_mapping.iter().copied() {
            let shard_size = align_page_next(self.object_size_to_shard_size(size, shard));
            out.insert(shard, 0, shard_size);
        }
        out
    }

    /// Per-shard byte ranges that are implicit-zero padding for an object
    /// of RO size `size`: the tail between a shard's own (page-aligned)
    /// size and the largest data shard's.
    pub fn ro_size_to_zero_mask(&self, size: u64) -> ShardExtentSet {
        let mut out = ShardExtentSet::new();
        let widest = align_page_next(self.object_size_to_shard_size(size, self.get_shard(0)));
        for shard in self.chunk_mapping.iter().copied() {
            let shard_size = align_page_next(self.object_size_to_shard_size(size, shard));
            if shard_size < widest {
                out.insert(shard, shard_size, widest - shard_size);
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const CHUNK: u64 = 4096;

    fn sinfo(k: usize, m: usize) -> StripeInfo {
        StripeInfo::new(k, m, CHUNK * k as u64).unwrap()
    }

    #[test]
    fn test_invalid_geometry() {
        assert_matches!(
            StripeInfo::new(0, 2, 16384),
            Err(Error::InvalidGeometry(_))
        );
        assert_matches!(
            StripeInfo::new(4, 2, 16385),
            Err(Error::InvalidGeometry(_))
        );
        assert_matches!(StripeInfo::new(4, 2, 0), Err(Error::InvalidGeometry(_)));
        // Duplicate entry: not a permutation.
        assert_matches!(
            StripeInfo::with_mapping(2, 1, 8192, vec![ShardId(0), ShardId(0)]),
            Err(Error::InvalidGeometry(_))
        );
    }

    #[test]
    fn test_chunk_mapping() {
        let k = 4;
        let m = 2;
        let forward: Vec<ShardId> = (0..k + m).map(|i| ShardId(i as u8)).collect();
        let reverse: Vec<ShardId> = (0..k + m).rev().map(|i| ShardId(i as u8)).collect();

        let forward_sinfo1 = StripeInfo::new(k, m, CHUNK * k as u64).unwrap();
        let forward_sinfo2 =
            StripeInfo::with_mapping(k, m, CHUNK * k as u64, forward.clone()).unwrap();
        let reverse_sinfo =
            StripeInfo::with_mapping(k, m, CHUNK * k as u64, reverse.clone()).unwrap();

        assert_eq!(forward, forward_sinfo1.chunk_mapping());
        assert_eq!(forward, forward_sinfo2.chunk_mapping());
        assert_eq!(reverse, reverse_sinfo.chunk_mapping());

        for i in 0..k + m {
            let shard = ShardId(i as u8);
            assert_eq!(shard, forward_sinfo1.get_shard(i));
            assert_eq!(i, forward_sinfo1.get_raw_shard(shard));
            assert_eq!(shard, forward_sinfo2.get_shard(i));
            assert_eq!(i, forward_sinfo2.get_raw_shard(shard));
            assert_eq!(shard, reverse_sinfo.get_shard(k + m - i - 1));
            assert_eq!(k + m - i - 1, reverse_sinfo.get_raw_shard(shard));
        }

        assert_eq!(k, forward_sinfo1.k());
        assert_eq!(m, forward_sinfo1.m());
        assert_eq!(k + m, forward_sinfo1.k_plus_m());
    }

    #[test]
    fn test_short_mapping_completed_with_identity() {
        let si = StripeInfo::with_mapping(2, 1, 8192, vec![ShardId(1), ShardId(0)]).unwrap();
        assert_eq!(si.get_shard(2), ShardId(2));
        assert_eq!(si.get_raw_shard(ShardId(1)), 0);
    }

    #[test]
    fn test_object_size_to_shard_size() {
        let si = sinfo(4, 2);
        assert_eq!(0x14000, si.object_size_to_shard_size(0x4D000, ShardId(0)));
        assert_eq!(0x13000, si.object_size_to_shard_size(0x4D000, ShardId(1)));
        assert_eq!(0x13000, si.object_size_to_shard_size(0x4D000, ShardId(2)));
        assert_eq!(0x13000, si.object_size_to_shard_size(0x4D000, ShardId(3)));
        assert_eq!(0x14000, si.object_size_to_shard_size(0x4D000, ShardId(4)));
        assert_eq!(0x14000, si.object_size_to_shard_size(0x4D000, ShardId(5)));
    }

    #[test]
    fn test_stripe_and_chunk_bounds() {
        let si = sinfo(4, 2);
        let sw = si.stripe_width();
        assert_eq!(si.offset_len_to_stripe_bounds(5, 10), (0, sw));
        assert_eq!(si.offset_len_to_stripe_bounds(sw - 1, 2), (0, 2 * sw));
        assert_eq!(si.offset_len_to_stripe_bounds(sw, sw), (sw, sw));

        assert_eq!(si.offset_len_to_chunk_bounds(5, 10), (0, CHUNK));
        assert_eq!(
            si.offset_len_to_chunk_bounds(CHUNK - 1, 2),
            (0, 2 * CHUNK)
        );

        assert!(si.ro_offset_is_stripe_aligned(0));
        assert!(si.ro_offset_is_stripe_aligned(sw));
        assert!(!si.ro_offset_is_stripe_aligned(sw + 1));
    }

    #[test]
    fn test_ro_offset_to_shard_offset() {
        let si = sinfo(2, 1);
        // RO offset in the middle of stripe 1, chunk for raw shard 1.
        let ro = si.stripe_width() + CHUNK + 10;
        assert_eq!(si.ro_offset_to_shard_offset(ro, 1), CHUNK + 10);
        assert_eq!(si.ro_offset_to_shard_offset(ro, 0), 2 * CHUNK);

        // RO offset inside raw shard 0's chunk.
        let ro = si.stripe_width() + 10;
        assert_eq!(si.ro_offset_to_shard_offset(ro, 0), CHUNK + 10);
        assert_eq!(si.ro_offset_to_shard_offset(ro, 1), CHUNK);
    }

    #[test]
    fn test_ro_range_to_shard_extent_set() {
        let si = sinfo(4, 2);

        // Strangely aligned range entirely within shard 0.
        let ses = si.ro_range_to_shard_extent_set(5, 1024);
        assert_eq!(ses.shard_count(), 1);
        assert_eq!(
            ses.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(5, 1024)]
        );

        // Overlap two chunks.
        let ses = si.ro_range_to_shard_extent_set(2 * CHUNK - 512, 1024);
        assert_eq!(
            ses.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(CHUNK - 512, 512)]
        );
        assert_eq!(
            ses.get(ShardId(2)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 512)]
        );

        // Overlap two stripes.
        let ses = si.ro_range_to_shard_extent_set(4 * CHUNK - 512, 1024);
        assert_eq!(
            ses.get(ShardId(3)).unwrap().iter().collect::<Vec<_>>(),
            vec![(CHUNK - 512, 512)]
        );
        assert_eq!(
            ses.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(CHUNK, 512)]
        );

        // Full stripe covers every data shard, no parity.
        let ses = si.ro_range_to_shard_extent_set(2 * 4 * CHUNK, 4 * CHUNK);
        assert_eq!(ses.shard_count(), 4);
        for raw in 0..4 {
            assert_eq!(
                ses.get(si.get_shard(raw)).unwrap().iter().collect::<Vec<_>>(),
                vec![(2 * CHUNK, CHUNK)]
            );
        }

        // Two half stripes at a strange alignment: stripes 8 and 9,
        // starting two chunks and five bytes in.
        let ses = si.ro_range_to_shard_extent_set(4 * CHUNK * 8 + 2 * CHUNK + 5, 4 * CHUNK);
        assert_eq!(
            ses.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(9 * CHUNK, CHUNK)]
        );
        assert_eq!(
            ses.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(9 * CHUNK, CHUNK)]
        );
        assert_eq!(
            ses.get(ShardId(2)).unwrap().iter().collect::<Vec<_>>(),
            vec![(8 * CHUNK + 5, CHUNK)]
        );
        assert_eq!(
            ses.get(ShardId(3)).unwrap().iter().collect::<Vec<_>>(),
            vec![(8 * CHUNK, CHUNK)]
        );
    }

    #[test]
    fn test_ro_range_round_trip_partition() {
        // The per-shard decomposition partitions the RO range: mapping the
        // shard extents back to RO offsets recovers exactly the input.
        let si = sinfo(3, 2);
        for (ro_off, ro_len) in [
            (0u64, 1u64),
            (5, 1024),
            (CHUNK - 1, 2),
            (0, 3 * CHUNK),
            (CHUNK, 6 * CHUNK),
            (2 * CHUNK + 17, 9 * CHUNK + 100),
        ] {
            let ses = si.ro_range_to_shard_extent_set(ro_off, ro_len);
            let mut covered = ExtentSet::new();
            let mut total = 0;
            for (shard, eset) in ses.iter() {
                let raw = si.get_raw_shard(shard);
                for (off, len) in eset.iter() {
                    total += len;
                    // Map each shard byte run back to RO space chunk by
                    // chunk.
                    let mut pos = off;
                    let end = off + len;
                    while pos < end {
                        let chunk_end = (pos / CHUNK + 1) * CHUNK;
                        let seg = chunk_end.min(end) - pos;
                        let ro = (pos / CHUNK) * si.stripe_width()
                            + raw as u64 * CHUNK
                            + pos % CHUNK;
                        covered.insert(ro, seg);
                        pos += seg;
                    }
                }
            }
            assert_eq!(total, ro_len);
            assert_eq!(covered.iter().collect::<Vec<_>>(), vec![(ro_off, ro_len)]);
        }
    }

    #[test]
    fn test_with_parity_covers_touched_stripes() {
        let si = sinfo(2, 2);
        let ses = si.ro_range_to_shard_extent_set_with_parity(CHUNK, 2 * CHUNK);
        // Data: raw shard 1 of stripe 0, raw shard 0 of stripe 1.
        assert_eq!(
            ses.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, CHUNK)]
        );
        assert_eq!(
            ses.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(CHUNK, CHUNK)]
        );
        // Parity: union of the data extents on both parity shards.
        for parity in [ShardId(2), ShardId(3)] {
            assert_eq!(
                ses.get(parity).unwrap().iter().collect::<Vec<_>>(),
                vec![(0, 2 * CHUNK)]
            );
        }
    }

    #[test]
    fn test_read_and_zero_masks() {
        // k=2, chunk 32768, m=1.
        let si = StripeInfo::new(2, 1, 16 * 4096).unwrap();

        for size in [1u64, 4096] {
            let read = si.ro_size_to_read_mask(size);
            let zero = si.ro_size_to_zero_mask(size);
            assert_eq!(
                read.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
                vec![(0, 4096)]
            );
            assert!(read.get(ShardId(1)).is_none());
            assert_eq!(
                read.get(ShardId(2)).unwrap().iter().collect::<Vec<_>>(),
                vec![(0, 4096)]
            );
            assert_eq!(
                zero.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
                vec![(0, 4096)]
            );
            assert!(zero.get(ShardId(0)).is_none());
            assert!(zero.get(ShardId(2)).is_none());
        }

        let read = si.ro_size_to_read_mask(4097);
        let zero = si.ro_size_to_zero_mask(4097);
        assert_eq!(
            read.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 8192)]
        );
        assert_eq!(
            zero.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 8192)]
        );

        let read = si.ro_size_to_read_mask(8 * 4096 + 1);
        let zero = si.ro_size_to_zero_mask(8 * 4096 + 1);
        assert_eq!(
            read.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 8 * 4096)]
        );
        assert_eq!(
            read.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 4096)]
        );
        assert_eq!(
            zero.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(4096, 7 * 4096)]
        );
        assert_eq!(
            read.get(ShardId(2)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 8 * 4096)]
        );

        let read = si.ro_size_to_read_mask(16 * 4096 + 1);
        let zero = si.ro_size_to_zero_mask(16 * 4096 + 1);
        assert_eq!(
            read.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 9 * 4096)]
        );
        assert_eq!(
            read.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 8 * 4096)]
        );
        assert_eq!(
            zero.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(8 * 4096, 4096)]
        );
    }

    #[test]
    fn test_page_alignment_helpers() {
        assert_eq!(align_page_next(0), 0);
        assert_eq!(align_page_next(1), 4096);
        assert_eq!(align_page_next(4096), 4096);
        assert_eq!(align_page_next(4097), 8192);
        assert_eq!(align_page_prev(4097), 4096);
        assert_eq!(align_page_prev(4095), 0);
    }
}
