//! Erasure Codec Capability
//!
//! The codec itself is an external collaborator: the core only consumes the
//! [`ErasureCodec`] trait. Implementations do pure compute over raw-ordered
//! chunk buffers; the chunk-mapping permutation between raw order and shard
//! ids is applied by the callers ([`crate::layout::ShardExtentMap`]).
//!
//! A [`CodecProfile`] (string key/value map) selects and parameterizes the
//! implementation; [`codec_from_profile`] is the sole runtime-dispatch
//! point, invoked once at placement-group init.

pub mod reed_solomon;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::shard::{ShardId, ShardMap, ShardSet};

pub use reed_solomon::ReedSolomonCodec;

// =============================================================================
// Plugin flags
// =============================================================================

/// Optimization capabilities advertised by a codec implementation.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginFlags(u64);

impl PluginFlags {
    pub const NONE: PluginFlags = PluginFlags(0);
    /// Codec can serve sub-stripe reads without the full stripe.
    pub const PARTIAL_READ: PluginFlags = PluginFlags(1 << 0);
    /// Codec can apply parity deltas for sub-stripe overwrites.
    pub const PARTIAL_WRITE: PluginFlags = PluginFlags(1 << 1);
    /// All-zero input chunks produce all-zero parity chunks.
    pub const ZERO_INPUT_ZERO_OUTPUT: PluginFlags = PluginFlags(1 << 2);
    pub const ALL: PluginFlags = PluginFlags(u64::MAX);

    pub fn contains(self, other: PluginFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PluginFlags {
    type Output = PluginFlags;

    fn bitor(self, rhs: PluginFlags) -> PluginFlags {
        PluginFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PluginFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginFlags({:#x})", self.0)
    }
}

/// Per-shard sub-chunk read list: `(index, count)` pairs.
pub type SubChunkList = Vec<(usize, usize)>;

// =============================================================================
// Codec trait
// =============================================================================

/// Capability interface over an erasure-code implementation.
///
/// `encode_chunks` and `decode_chunks` index chunks in *raw* order: data
/// chunks `0..k`, coding chunks `k..k+m`. `minimum_to_decode` operates on
/// shard ids, which only requires set arithmetic.
pub trait ErasureCodec: Send + Sync + std::fmt::Debug {
    /// Number of data chunks (`k`).
    fn data_chunk_count(&self) -> usize;

    /// Total number of chunks (`k + m`).
    fn chunk_count(&self) -> usize;

    fn sub_chunk_count(&self) -> usize {
        1
    }

    /// Raw-to-shard permutation; empty means identity.
    fn chunk_mapping(&self) -> &[ShardId];

    fn supported_optimizations(&self) -> PluginFlags;

    /// Compute the `m` parity chunks from the `k` data chunks. All buffers
    /// must share one length.
    fn encode_chunks(&self, data: &[Bytes], parity: &mut [BytesMut]) -> Result<()>;

    /// Reconstruct the missing (`None`) chunks in `chunks` (length `k + m`)
    /// from the present ones. Only raw chunks named in `want` are required
    /// to be filled on return.
    fn decode_chunks(&self, want: &ShardSet, chunks: &mut [Option<Bytes>]) -> Result<()>;

    /// Minimum set of shards needed to produce `want` from `have`, with
    /// the sub-chunks to read from each.
    fn minimum_to_decode(&self, want: &ShardSet, have: &ShardSet) -> Result<ShardMap<SubChunkList>> {
        let min_shards = if have.includes(want) {
            *want
        } else {
            let k = self.data_chunk_count();
            if have.len() < k {
                return Err(Error::InsufficientShards {
                    available: have.len(),
                    required: k,
                });
            }
            have.iter().take(k).collect()
        };
        let default_subchunks: SubChunkList = vec![(0, self.sub_chunk_count())];
        Ok(min_shards
            .iter()
            .map(|shard| (shard, default_subchunks.clone()))
            .collect())
    }
}

// =============================================================================
// Codec profile
// =============================================================================

const DEFAULT_RULE_ROOT: &str = "default";
const DEFAULT_RULE_FAILURE_DOMAIN: &str = "host";

/// Key/value codec configuration, as stored with the pool.
///
/// Recognized keys: `plugin`, `k`, `m`, `mapping` (a string of `D`/`C`
/// characters placing data and coding chunks), `crush-root`,
/// `crush-failure-domain`, `crush-device-class`,
/// `crush-osds-per-failure-domain`, `crush-num-failure-domains`. Unknown
/// keys are retained for plugin-specific use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecProfile {
    entries: BTreeMap<String, String>,
}

impl CodecProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidProfile(format!("{key}={raw} is not an integer"))),
        }
    }

    /// Parse one profile line of `key=value` pairs separated by commas.
    pub fn parse(input: &str) -> Result<Self> {
        let mut profile = Self::new();
        for part in input.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::InvalidProfile(format!("expected key=value, got {part:?}"))
            })?;
            profile = profile.set(key.trim(), value.trim());
        }
        Ok(profile)
    }

    pub fn plugin(&self) -> &str {
        self.get_or("plugin", "reed_solomon")
    }

    /// `k`, bounds-checked: at least 2.
    pub fn k(&self) -> Result<usize> {
        let k = self.get_usize("k")?.unwrap_or(2);
        if k < 2 {
            return Err(Error::InvalidProfile(format!("k={k} must be >= 2")));
        }
        Ok(k)
    }

    /// `m`, bounds-checked: at least 1.
    pub fn m(&self) -> Result<usize> {
        let m = self.get_usize("m")?.unwrap_or(1);
        if m < 1 {
            return Err(Error::InvalidProfile(format!("m={m} must be >= 1")));
        }
        Ok(m)
    }

    pub fn crush_root(&self) -> &str {
        self.get_or("crush-root", DEFAULT_RULE_ROOT)
    }

    pub fn crush_failure_domain(&self) -> &str {
        self.get_or("crush-failure-domain", DEFAULT_RULE_FAILURE_DOMAIN)
    }

    pub fn crush_device_class(&self) -> &str {
        self.get_or("crush-device-class", "")
    }

    pub fn crush_osds_per_failure_domain(&self) -> Result<usize> {
        Ok(self.get_usize("crush-osds-per-failure-domain")?.unwrap_or(0))
    }

    pub fn crush_num_failure_domains(&self) -> Result<usize> {
        Ok(self.get_usize("crush-num-failure-domains")?.unwrap_or(0))
    }

    /// Chunk mapping from the `mapping` string: the i-th data chunk lands
    /// at the position of the i-th `D`, the j-th coding chunk at the
    /// position of the j-th `C`.
    pub fn chunk_mapping(&self, k: usize, m: usize) -> Result<Vec<ShardId>> {
        let Some(mapping) = self.get("mapping") else {
            return Ok(Vec::new());
        };
        if mapping.len() != k + m {
            return Err(Error::InvalidProfile(format!(
                "mapping {mapping:?} has {} positions for k+m={}",
                mapping.len(),
                k + m
            )));
        }
        let mut data_positions = Vec::new();
        let mut coding_positions = Vec::new();
        for (pos, c) in mapping.chars().enumerate() {
            match c {
                'D' => data_positions.push(ShardId::from(pos)),
                'C' => coding_positions.push(ShardId::from(pos)),
                other => {
                    return Err(Error::InvalidProfile(format!(
                        "mapping contains {other:?}; only D and C are allowed"
                    )))
                }
            }
        }
        if data_positions.len() != k || coding_positions.len() != m {
            return Err(Error::InvalidProfile(format!(
                "mapping {mapping:?} has {} data and {} coding positions, expected {k}+{m}",
                data_positions.len(),
                coding_positions.len()
            )));
        }
        data_positions.extend(coding_positions);
        Ok(data_positions)
    }
}

/// Instantiate the codec selected by a profile.
///
/// The only runtime-dispatch point for codec polymorphism; call it once at
/// placement-group init and hold the `Arc`.
pub fn codec_from_profile(profile: &CodecProfile) -> Result<Arc<dyn ErasureCodec>> {
    let k = profile.k()?;
    let m = profile.m()?;
    let mapping = profile.chunk_mapping(k, m)?;
    match profile.plugin() {
        "reed_solomon" => Ok(Arc::new(ReedSolomonCodec::new(k, m, mapping)?)),
        other => Err(Error::InvalidProfile(format!("unknown plugin {other:?}"))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_plugin_flags() {
        let flags = PluginFlags::PARTIAL_READ | PluginFlags::ZERO_INPUT_ZERO_OUTPUT;
        assert!(flags.contains(PluginFlags::PARTIAL_READ));
        assert!(!flags.contains(PluginFlags::PARTIAL_WRITE));
        assert!(PluginFlags::ALL.contains(flags));
        assert!(flags.contains(PluginFlags::NONE));
    }

    #[test]
    fn test_profile_parse() {
        let profile = CodecProfile::parse("plugin=reed_solomon,k=4,m=2,crush-root=ssd").unwrap();
        assert_eq!(profile.plugin(), "reed_solomon");
        assert_eq!(profile.k().unwrap(), 4);
        assert_eq!(profile.m().unwrap(), 2);
        assert_eq!(profile.crush_root(), "ssd");
        assert_eq!(profile.crush_failure_domain(), "host");

        assert_matches!(CodecProfile::parse("k"), Err(Error::InvalidProfile(_)));
        assert_matches!(
            CodecProfile::parse("k=two"),
            Ok(p) if p.k().is_err()
        );
    }

    #[test]
    fn test_profile_bounds() {
        let profile = CodecProfile::new().set("k", "1");
        assert_matches!(profile.k(), Err(Error::InvalidProfile(_)));
        let profile = CodecProfile::new().set("m", "0");
        assert_matches!(profile.m(), Err(Error::InvalidProfile(_)));
    }

    #[test]
    fn test_mapping_string() {
        let profile = CodecProfile::new().set("mapping", "DCD");
        let mapping = profile.chunk_mapping(2, 1).unwrap();
        assert_eq!(mapping, vec![ShardId(0), ShardId(2), ShardId(1)]);

        let profile = CodecProfile::new().set("mapping", "DDC");
        let mapping = profile.chunk_mapping(2, 1).unwrap();
        assert_eq!(mapping, vec![ShardId(0), ShardId(1), ShardId(2)]);

        let profile = CodecProfile::new().set("mapping", "DXC");
        assert_matches!(profile.chunk_mapping(2, 1), Err(Error::InvalidProfile(_)));

        let profile = CodecProfile::new().set("mapping", "DDDC");
        assert_matches!(profile.chunk_mapping(2, 1), Err(Error::InvalidProfile(_)));
    }

    #[test]
    fn test_factory() {
        let profile = CodecProfile::parse("plugin=reed_solomon,k=2,m=1").unwrap();
        let codec = codec_from_profile(&profile).unwrap();
        assert_eq!(codec.data_chunk_count(), 2);
        assert_eq!(codec.chunk_count(), 3);

        let profile = CodecProfile::parse("plugin=clay,k=2,m=1").unwrap();
        assert_matches!(codec_from_profile(&profile), Err(Error::InvalidProfile(_)));
    }

    #[test]
    fn test_minimum_to_decode_default() {
        let codec = ReedSolomonCodec::new(2, 1, Vec::new()).unwrap();
        let want: ShardSet = [ShardId(0), ShardId(1)].into_iter().collect();

        // Everything wanted is available: read exactly that.
        let have = ShardSet::first_n(3);
        let need = codec.minimum_to_decode(&want, &have).unwrap();
        assert_eq!(need.keys(), want);
        assert_eq!(need.get(ShardId(0)).unwrap(), &vec![(0, 1)]);

        // Shard 0 missing: first k available shards are chosen.
        let mut have = ShardSet::first_n(3);
        have.remove(ShardId(0));
        let need = codec.minimum_to_decode(&want, &have).unwrap();
        let chosen: Vec<u8> = need.keys().iter().map(|s| s.0).collect();
        assert_eq!(chosen, vec![1, 2]);

        // Too few shards.
        let mut have = ShardSet::new();
        have.insert(ShardId(1));
        assert_matches!(
            codec.minimum_to_decode(&want, &have),
            Err(Error::InsufficientShards {
                available: 1,
                required: 2
            })
        );
    }
}
