//! Read-Modify-Write Pipeline
//!
//! Orchestrates client writes: plans the reads a partial-stripe write
//! needs, drives the [`ExtentCache`], regenerates parity over the touched
//! stripe rows, builds one transaction per participating shard, dispatches
//! them locally or to peers, and completes once every shard has committed.
//!
//! When the pool cannot do EC overwrites, writes are appends and the
//! per-shard hash chains ride along: the updated hash record is written as
//! an attribute with every shard transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::cache::{BackendRead, CacheReadyCallback, ExtentCache, OpRef as CacheOpRef};
use crate::codec::ErasureCodec;
use crate::error::{Error, Result};
use crate::extent::{ExtentMap, ExtentSet};
use crate::hash_info::{HashInfoRegistry, HINFO_KEY};
use crate::layout::{ShardExtentMap, ShardExtentSet};
use crate::messenger::{Messenger, SubOpMessage, SubOpWrite, SubOpWriteReply, Tid};
use crate::read::{ReadPipeline, ReadRequest, ShardMembership};
use crate::shard::ShardId;
use crate::store::ShardStore;
use crate::stripe::{StripeInfo, PAGE_SIZE};
use crate::ObjectId;

/// Per-object part of a write plan.
#[derive(Debug, Clone)]
pub struct ObjectPlan {
    pub oid: ObjectId,
    /// Reads needed before parity can be regenerated; `None` when the
    /// write needs nothing.
    pub to_read: Option<ShardExtentSet>,
    /// Everything the op will write, parity included, page aligned.
    pub will_write: ShardExtentSet,
    pub orig_size: u64,
    pub projected_size: u64,
    pub invalidates_cache: bool,
}

/// A client write decomposed into per-object sub-plans.
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    pub plans: Vec<ObjectPlan>,
}

/// Build the plan for one RO write range.
///
/// The write set is the per-shard decomposition of the range plus parity
/// over the touched rows, inflated to page bounds. The read set is
/// whatever of those rows existing data can supply and the write itself
/// does not: the page remainders of partially written chunks and the
/// other data shards' row bytes. Rows fully covered by the write read
/// nothing.
pub fn plan_write(
    sinfo: &StripeInfo,
    oid: &ObjectId,
    ro_offset: u64,
    ro_len: u64,
    orig_size: u64,
) -> ObjectPlan {
    let projected_size = orig_size.max(ro_offset + ro_len);
    let write_set = sinfo.ro_range_to_shard_extent_set(ro_offset, ro_len);
    let mut will_write = sinfo.ro_range_to_shard_extent_set_with_parity(ro_offset, ro_len);
    will_write.align(PAGE_SIZE);

    // The stripe rows being re-encoded: the (aligned) parity extents.
    let rows = match sinfo.parity_shards().next() {
        Some(parity) => will_write
            .get(parity)
            .cloned()
            .unwrap_or_default(),
        None => will_write.get_extent_superset(),
    };

    let read_mask = sinfo.ro_size_to_read_mask(orig_size);
    let mut to_read = ShardExtentSet::new();
    for shard in sinfo.data_shards() {
        let mut candidate = rows.clone();
        if let Some(written) = write_set.get(shard) {
            candidate.subtract(written);
        }
        if let Some(readable) = read_mask.get(shard) {
            candidate = candidate.intersection(readable);
        } else {
            candidate = ExtentSet::new();
        }
        if !candidate.is_empty() {
            to_read.insert_extent_set(shard, &candidate);
        }
    }

    ObjectPlan {
        oid: oid.clone(),
        to_read: (!to_read.is_empty()).then_some(to_read),
        will_write,
        orig_size,
        projected_size,
        invalidates_cache: false,
    }
}

// =============================================================================
// Op
// =============================================================================

pub type OnCommitFn = Box<dyn FnOnce() + Send>;
pub type RmwOpRef = Arc<Mutex<RmwOp>>;

/// One in-flight write operation.
pub struct RmwOp {
    pub oid: ObjectId,
    pub version: u64,
    pub plan: WritePlan,
    /// RO-space payload per object.
    pub write_data: HashMap<ObjectId, ExtentMap>,
    tid: Tid,
    dummy: bool,
    pending_cache_ops: usize,
    pending_commits: usize,
    finished: bool,
    cache_ops: Vec<CacheOpRef>,
    remote_shard_extent_map: HashMap<ObjectId, ShardExtentMap>,
    on_all_commits: Option<OnCommitFn>,
}

impl RmwOp {
    pub fn new(
        oid: ObjectId,
        version: u64,
        plan: WritePlan,
        write_data: HashMap<ObjectId, ExtentMap>,
        on_all_commits: OnCommitFn,
    ) -> Self {
        Self {
            oid,
            version,
            plan,
            write_data,
            tid: 0,
            dummy: false,
            pending_cache_ops: 0,
            pending_commits: 0,
            finished: false,
            cache_ops: Vec::new(),
            remote_shard_extent_map: HashMap::new(),
            on_all_commits: Some(on_all_commits),
        }
    }

    /// A transaction-empty op that only rolls versions forward. Walks the
    /// same path as a real op but never touches the codec.
    fn new_dummy(oid: ObjectId, version: u64) -> Self {
        Self {
            dummy: true,
            on_all_commits: None,
            ..Self::new(
                oid,
                version,
                WritePlan::default(),
                HashMap::new(),
                Box::new(|| {}),
            )
        }
    }
}

#[derive(Default)]
struct RmwState {
    next_tid: Tid,
    tid_to_op_map: HashMap<Tid, RmwOpRef>,
    oid_to_version: HashMap<ObjectId, u64>,
    completed_to: u64,
    committed_to: u64,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Per-placement-group write coordinator.
pub struct RmwPipeline {
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    membership: Arc<dyn ShardMembership>,
    messenger: Arc<dyn Messenger>,
    whoami: ShardId,
    local_store: Arc<dyn ShardStore>,
    extent_cache: ExtentCache,
    hash_registry: Arc<HashInfoRegistry>,
    state: Mutex<RmwState>,
}

impl RmwPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sinfo: Arc<StripeInfo>,
        codec: Arc<dyn ErasureCodec>,
        membership: Arc<dyn ShardMembership>,
        messenger: Arc<dyn Messenger>,
        whoami: ShardId,
        local_store: Arc<dyn ShardStore>,
        extent_cache: ExtentCache,
        hash_registry: Arc<HashInfoRegistry>,
    ) -> Self {
        Self {
            sinfo,
            codec,
            membership,
            messenger,
            whoami,
            local_store,
            extent_cache,
            hash_registry,
            state: Mutex::new(RmwState::default()),
        }
    }

    pub fn extent_cache(&self) -> &ExtentCache {
        &self.extent_cache
    }

    pub fn completed_to(&self) -> u64 {
        self.state.lock().completed_to
    }

    pub fn committed_to(&self) -> u64 {
        self.state.lock().committed_to
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().tid_to_op_map.len()
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Admit a write op: prepare one cache op per sub-plan and queue them.
    /// The op proceeds to [`Self::cache_ready`] once every sub-plan's
    /// reads are cached.
    #[instrument(skip_all, fields(oid = %op.oid, version = op.version))]
    pub fn start_rmw(self: &Arc<Self>, mut op: RmwOp) -> RmwOpRef {
        let tid = {
            let mut state = self.state.lock();
            state.next_tid += 1;
            state.next_tid
        };
        op.tid = tid;
        op.pending_cache_ops = op.plan.plans.len();
        let plans = op.plan.plans.clone();
        let opref = Arc::new(Mutex::new(op));
        self.state
            .lock()
            .tid_to_op_map
            .insert(tid, opref.clone());

        if plans.is_empty() {
            self.cache_ready(&opref);
            return opref;
        }

        let mut cache_ops = Vec::with_capacity(plans.len());
        for plan in plans {
            let pipeline: Weak<RmwPipeline> = Arc::downgrade(self);
            let opref_cb = opref.clone();
            let oid = plan.oid.clone();
            let cb: CacheReadyCallback = Box::new(move |snapshot: ShardExtentMap| {
                let ready = {
                    let mut op = opref_cb.lock();
                    op.remote_shard_extent_map.insert(oid.clone(), snapshot);
                    op.pending_cache_ops -= 1;
                    op.pending_cache_ops == 0
                };
                if ready {
                    if let Some(pipeline) = pipeline.upgrade() {
                        pipeline.cache_ready(&opref_cb);
                    }
                }
            });
            cache_ops.push(self.extent_cache.prepare(
                plan.oid.clone(),
                plan.to_read.clone(),
                plan.will_write.clone(),
                plan.orig_size,
                plan.projected_size,
                plan.invalidates_cache,
                cb,
            ));
        }
        opref.lock().cache_ops = cache_ops.clone();
        self.extent_cache.execute(&cache_ops);
        opref
    }

    // =========================================================================
    // Cache ready: encode and dispatch
    // =========================================================================

    /// Every sub-plan's reads are cached: regenerate parity, build the
    /// per-shard transactions and dispatch them.
    fn cache_ready(self: &Arc<Self>, opref: &RmwOpRef) {
        let (tid, version, plans, cache_ops) = {
            let op = opref.lock();
            (
                op.tid,
                op.version,
                op.plan.plans.clone(),
                op.cache_ops.clone(),
            )
        };
        debug!(tid, version, plans = plans.len(), "cache ready");

        let mut remote_writes: Vec<(ShardId, SubOpWrite)> = Vec::new();
        let mut written_maps = Vec::with_capacity(plans.len());
        for plan in &plans {
            let written =
                match self.generate_transactions(opref, plan, tid, version, &mut remote_writes) {
                    Ok(written) => written,
                    Err(err) => {
                        // A local failure here means the op cannot
                        // proceed; surface through the completion with
                        // the write dropped. The caller unwinds with
                        // on_change.
                        warn!(tid, %err, "transaction generation failed");
                        ShardExtentMap::new(self.sinfo.clone())
                    }
                };
            written_maps.push(written);
        }

        {
            let mut state = self.state.lock();
            let mut op = opref.lock();
            if op.version != 0 {
                if let Some(previous) = state.oid_to_version.get(&op.oid) {
                    assert!(*previous <= op.version, "version moved backwards");
                }
                state.oid_to_version.insert(op.oid.clone(), op.version);
            }
            op.pending_commits = remote_writes.len();
        }

        // Peer dispatch happens before the cache learns of the writes:
        // completing the cache op can synchronously release the next
        // queued op, and its sub-writes must trail ours on every peer
        // pair.
        for (shard, write) in remote_writes {
            self.messenger.send(shard, SubOpMessage::Write(write));
        }
        for (index, written) in written_maps.into_iter().enumerate() {
            self.extent_cache.write_done(&cache_ops[index], written);
        }

        self.maybe_finish(opref);
    }

    /// Finish exactly once, when the last commit is in.
    fn maybe_finish(self: &Arc<Self>, opref: &RmwOpRef) {
        let finish = {
            let mut op = opref.lock();
            if op.pending_commits == 0 && !op.finished {
                op.finished = true;
                true
            } else {
                false
            }
        };
        if finish {
            self.finish_rmw(opref);
        }
    }

    /// Encode one sub-plan and produce its per-shard writes: the local
    /// shard applies immediately, remote shards get sub-op messages.
    /// Returns the written map for the cache.
    fn generate_transactions(
        self: &Arc<Self>,
        opref: &RmwOpRef,
        plan: &ObjectPlan,
        tid: Tid,
        version: u64,
        remote_writes: &mut Vec<(ShardId, SubOpWrite)>,
    ) -> Result<ShardExtentMap> {
        let mut semap = {
            let mut op = opref.lock();
            op.remote_shard_extent_map
                .remove(&plan.oid)
                .unwrap_or_else(|| ShardExtentMap::new(self.sinfo.clone()))
        };

        // Merge the client payload over the cached data.
        {
            let op = opref.lock();
            if let Some(data) = op.write_data.get(&plan.oid) {
                semap.insert_ro_extent_map(data);
            }
        }

        // Zero-fill the re-encoded rows on every data shard; bytes still
        // missing there are beyond the old object size and implicitly
        // zero. The padding never leaves the encode input.
        let rows = match self.sinfo.parity_shards().next() {
            Some(parity) => plan.will_write.get(parity).cloned().unwrap_or_default(),
            None => plan.will_write.get_extent_superset(),
        };
        for shard in self.sinfo.data_shards().collect::<Vec<_>>() {
            for (off, len) in rows.iter().collect::<Vec<_>>() {
                semap.zero_pad(shard, off, len);
            }
        }

        // Encode inputs must be contiguous page-aligned runs; client
        // payloads and cached reads meet at sub-page fragment boundaries.
        semap.pad_and_rebuild_to_page_align();

        // Regenerate parity; fold the hash chains when overwrites are
        // disabled.
        let hinfo_blob = if self.sinfo.require_hinfo() {
            let attr = self
                .local_store
                .get_attr(&plan.oid, self.whoami, HINFO_KEY)?;
            let shard_size = self.local_store.shard_size(&plan.oid, self.whoami)?;
            let hinfo = self
                .hash_registry
                .get_hash_info(&plan.oid, attr.as_deref(), shard_size, true)
                .ok_or_else(|| {
                    Error::Internal(format!("unusable hash info attribute on {}", plan.oid))
                })?;
            let mut hinfo = hinfo.lock();
            semap.encode(&*self.codec, Some(&mut *hinfo), plan.orig_size)?;
            Some(hinfo.encode())
        } else {
            semap.encode(&*self.codec, None, plan.orig_size)?;
            None
        };

        let written = semap.intersect(&plan.will_write);

        // One transaction per shard that carries bytes (or an attribute
        // refresh), spanning acting and backfill shards.
        let mut targets = self.membership.acting_shards();
        targets.union_with(&self.membership.backfill_shards());
        for shard in targets.iter() {
            let Some(shard_map) = written.get_extent_map(shard) else {
                continue;
            };
            let mut writes = ExtentMap::new();
            for (off, _, buf) in shard_map.iter() {
                writes.insert(off, buf.clone());
            }
            let new_size = self
                .sinfo
                .object_size_to_shard_size(plan.projected_size, shard);
            let mut attr_updates = BTreeMap::new();
            if let Some(blob) = &hinfo_blob {
                attr_updates.insert(HINFO_KEY.to_string(), Some(blob.clone()));
            }

            if shard == self.whoami {
                self.local_store
                    .write(&plan.oid, shard, &writes, new_size)?;
                for (name, value) in attr_updates {
                    self.local_store.set_attr(&plan.oid, shard, &name, value)?;
                }
            } else {
                remote_writes.push((
                    shard,
                    SubOpWrite {
                        tid,
                        from: self.whoami,
                        oid: plan.oid.clone(),
                        version,
                        writes,
                        new_size,
                        attr_updates,
                    },
                ));
            }
        }
        trace!(oid = %plan.oid, shards = written.shards().len(), "generated transactions");
        Ok(written)
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// A peer committed its sub-write.
    pub fn handle_sub_write_reply(self: &Arc<Self>, reply: SubOpWriteReply) {
        let opref = {
            let state = self.state.lock();
            state.tid_to_op_map.get(&reply.tid).cloned()
        };
        let Some(opref) = opref else {
            warn!(tid = reply.tid, "commit for unknown write op");
            return;
        };
        {
            let mut op = opref.lock();
            assert!(op.pending_commits > 0, "commit counted twice");
            op.pending_commits -= 1;
        }
        self.maybe_finish(&opref);
    }

    /// All shards committed: advance versions, release the cache pins and
    /// drive a roll-forward dummy when the cache has gone idle.
    fn finish_rmw(self: &Arc<Self>, opref: &RmwOpRef) {
        let (tid, version, dummy, oid, on_all_commits) = {
            let mut op = opref.lock();
            op.cache_ops.clear();
            (
                op.tid,
                op.version,
                op.dummy,
                op.oid.clone(),
                op.on_all_commits.take(),
            )
        };
        debug!(tid, version, dummy, "write op finished");

        let submit_dummy = {
            let mut state = self.state.lock();
            state.tid_to_op_map.remove(&tid);
            state.committed_to = state.committed_to.max(version);
            if self.extent_cache.idle() {
                state.completed_to = state.committed_to;
                !dummy && self.extent_cache.get_and_reset_counter() > 0
            } else {
                false
            }
        };

        if submit_dummy {
            // The cache is idle but ops ran since it last was: one empty
            // op rolls the versions forward for everyone who saw them.
            trace!(version, "submitting roll-forward dummy op");
            self.start_rmw(RmwOp::new_dummy(oid, version));
        }

        if let Some(cb) = on_all_commits {
            cb();
        }
    }

    /// Run `cb` after every write currently in the cache queue has
    /// completed.
    pub fn call_write_ordered(&self, cb: OnCommitFn) {
        self.extent_cache.add_on_write(cb);
    }

    /// Interval change: cancel in-flight ops without firing their
    /// completions, drop version tracking, and reset the cache.
    pub fn on_change(&self) {
        let cancelled: Vec<RmwOpRef> = {
            let mut state = self.state.lock();
            state.oid_to_version.clear();
            state.completed_to = 0;
            state.committed_to = 0;
            state.tid_to_op_map.drain().map(|(_, op)| op).collect()
        };
        for opref in &cancelled {
            let mut op = opref.lock();
            op.on_all_commits = None;
            op.cache_ops.clear();
        }
        drop(cancelled);
        self.extent_cache.on_change();
        debug!("write pipeline reset");
    }
}

// =============================================================================
// Cache backend wiring
// =============================================================================

/// Adapts the read pipeline into the cache's [`BackendRead`] port.
/// Completed reads (with missing shards reconstructed) flow back into the
/// cache; a read that fails permanently is logged and left for the
/// interval-change unwind.
pub struct CacheBackendReader {
    pipeline: Arc<ReadPipeline>,
    cache: Mutex<Option<ExtentCache>>,
}

impl CacheBackendReader {
    pub fn new(pipeline: Arc<ReadPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            cache: Mutex::new(None),
        })
    }

    /// Wire the cache in after construction (the cache needs the backend
    /// first).
    pub fn attach_cache(&self, cache: &ExtentCache) {
        *self.cache.lock() = Some(cache.clone());
    }
}

impl BackendRead for CacheBackendReader {
    fn backend_read(&self, oid: ObjectId, request: ShardExtentSet, object_size: u64) {
        let cache = self
            .cache
            .lock()
            .clone()
            .expect("cache not attached to backend reader");
        let read_request = ReadRequest::for_rmw(request.clone(), object_size);
        let result = self.pipeline.objects_read_and_reconstruct_for_rmw(
            vec![(oid.clone(), read_request)],
            Box::new(move |results| {
                for extent in results {
                    if let Some(err) = extent.err {
                        warn!(oid = %extent.oid, %err, "backend read failed");
                        continue;
                    }
                    // The pipeline reads page-aligned supersets; hand the
                    // cache exactly what it asked for so a wider read can
                    // never clobber bytes a preceding queued write already
                    // put in the cache.
                    let exact = extent.shard_extent_map.intersect(&request);
                    cache.read_done(&extent.oid, exact);
                }
            }),
        );
        if let Err(err) = result {
            warn!(%oid, %err, "backend read could not be planned");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardId;

    const CHUNK: u64 = 4096;

    fn sinfo(k: usize, m: usize) -> StripeInfo {
        StripeInfo::new(k, m, CHUNK * k as u64).unwrap()
    }

    #[test]
    fn test_plan_sub_page_write_reads_remainders() {
        let si = sinfo(2, 1);
        let oid = ObjectId::new("a");

        // Ten bytes into an 8K object: the write page's remainder and the
        // peer data shard's row must be read.
        let plan = plan_write(&si, &oid, 0, 10, 2 * CHUNK);
        assert_eq!(plan.projected_size, 2 * CHUNK);

        let will = &plan.will_write;
        assert_eq!(
            will.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 4096)]
        );
        assert!(will.get(ShardId(1)).is_none());
        assert_eq!(
            will.get(ShardId(2)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 4096)]
        );

        let reads = plan.to_read.unwrap();
        assert_eq!(
            reads.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(10, 4086)]
        );
        assert_eq!(
            reads.get(ShardId(1)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 4096)]
        );
    }

    #[test]
    fn test_plan_full_stripe_write_reads_nothing() {
        let si = sinfo(2, 1);
        let oid = ObjectId::new("a");

        let plan = plan_write(&si, &oid, 0, 2 * CHUNK, 2 * CHUNK);
        assert!(plan.to_read.is_none());
        for shard in [ShardId(0), ShardId(1), ShardId(2)] {
            assert_eq!(
                plan.will_write
                    .get(shard)
                    .unwrap()
                    .iter()
                    .collect::<Vec<_>>(),
                vec![(0, CHUNK)]
            );
        }
    }

    #[test]
    fn test_plan_append_reads_nothing() {
        let si = sinfo(2, 1);
        let oid = ObjectId::new("a");

        // Appending page-aligned data to an empty object: nothing exists
        // to read.
        let plan = plan_write(&si, &oid, 0, 4096, 0);
        assert!(plan.to_read.is_none());
        assert_eq!(plan.orig_size, 0);
        assert_eq!(plan.projected_size, 4096);
    }

    #[test]
    fn test_plan_append_growing_object() {
        let si = sinfo(2, 1);
        let oid = ObjectId::new("a");

        // Appending ten bytes after an existing 10-byte object: the write
        // page overlaps the existing bytes, which must be read back. The
        // page tail past the old size is covered too; the store serves it
        // short and the read pipeline zero-fills it.
        let plan = plan_write(&si, &oid, 10, 10, 10);
        assert_eq!(plan.projected_size, 20);
        let reads = plan.to_read.unwrap();
        assert_eq!(
            reads.get(ShardId(0)).unwrap().iter().collect::<Vec<_>>(),
            vec![(0, 10), (20, 4076)]
        );
        assert!(reads.get(ShardId(1)).is_none());
    }
}
