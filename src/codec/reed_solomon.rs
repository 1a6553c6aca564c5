//! Reed-Solomon Codec
//!
//! Default [`ErasureCodec`] implementation over GF(2^8) Reed-Solomon from
//! the `reed-solomon-erasure` crate. Linear, so all-zero data yields
//! all-zero parity, and any `k` of the `k + m` chunks reconstruct the rest.

use bytes::{Bytes, BytesMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use crate::codec::{ErasureCodec, PluginFlags};
use crate::error::{Error, Result};
use crate::shard::{ShardId, ShardSet};

/// Reed-Solomon erasure codec for `k` data and `m` coding chunks.
#[derive(Debug)]
pub struct ReedSolomonCodec {
    rs: ReedSolomon,
    k: usize,
    m: usize,
    chunk_mapping: Vec<ShardId>,
}

impl ReedSolomonCodec {
    /// Create a codec instance. `mapping` may be empty for the identity
    /// placement.
    pub fn new(k: usize, m: usize, mapping: Vec<ShardId>) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidProfile("k must be greater than 0".into()));
        }
        if m == 0 {
            return Err(Error::InvalidProfile("m must be greater than 0".into()));
        }
        let rs = ReedSolomon::new(k, m).map_err(|e| {
            Error::InvalidProfile(format!("failed to create Reed-Solomon codec: {e}"))
        })?;
        Ok(Self {
            rs,
            k,
            m,
            chunk_mapping: mapping,
        })
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn data_chunk_count(&self) -> usize {
        self.k
    }

    fn chunk_count(&self) -> usize {
        self.k + self.m
    }

    fn chunk_mapping(&self) -> &[ShardId] {
        &self.chunk_mapping
    }

    fn supported_optimizations(&self) -> PluginFlags {
        PluginFlags::PARTIAL_READ | PluginFlags::ZERO_INPUT_ZERO_OUTPUT
    }

    fn encode_chunks(&self, data: &[Bytes], parity: &mut [BytesMut]) -> Result<()> {
        if data.len() != self.k || parity.len() != self.m {
            return Err(Error::Internal(format!(
                "encode_chunks called with {} data and {} parity chunks for a {}+{} codec",
                data.len(),
                parity.len(),
                self.k,
                self.m
            )));
        }
        self.rs
            .encode_sep(data, parity)
            .map_err(|e| Error::DecodeFailure(format!("Reed-Solomon encoding failed: {e}")))?;
        Ok(())
    }

    fn decode_chunks(&self, want: &ShardSet, chunks: &mut [Option<Bytes>]) -> Result<()> {
        if chunks.len() != self.chunk_count() {
            return Err(Error::Internal(format!(
                "decode_chunks called with {} chunks for a {}+{} codec",
                chunks.len(),
                self.k,
                self.m
            )));
        }
        let available = chunks.iter().filter(|c| c.is_some()).count();
        if available < self.k {
            return Err(Error::InsufficientShards {
                available,
                required: self.k,
            });
        }

        let mut scratch: Vec<Option<Vec<u8>>> = chunks
            .iter()
            .map(|c| c.as_ref().map(|b| b.to_vec()))
            .collect();
        self.rs
            .reconstruct(&mut scratch)
            .map_err(|e| Error::DecodeFailure(format!("Reed-Solomon reconstruction failed: {e}")))?;

        let mut filled = 0;
        for (raw, (slot, recovered)) in chunks.iter_mut().zip(scratch).enumerate() {
            if slot.is_none() {
                let recovered = recovered.ok_or_else(|| {
                    Error::DecodeFailure(format!("chunk {raw} not recovered"))
                })?;
                *slot = Some(Bytes::from(recovered));
                filled += 1;
            }
        }
        debug_assert!(want
            .iter()
            .all(|shard| shard.index() >= chunks.len() || chunks[shard.index()].is_some()));
        debug!(filled, available, "reconstructed missing chunks");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
