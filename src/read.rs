//! Read Pipeline
//!
//! Plans the minimum set of per-shard reads needed to satisfy client (or
//! read-modify-write) reads, dispatches them through the [`Messenger`],
//! retries around failed shards, and on completion reconstructs any
//! missing shards with the codec before handing results back.
//!
//! Completion is modeled as a small sum type ([`ReadCompletion`]) matched
//! at dispatch; client deliveries are strictly FIFO per submission order
//! even when later read ops finish first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::codec::ErasureCodec;
use crate::error::{Error, Result};
use crate::extent::{BufferList, ExtentMap, ExtentSet};
use crate::layout::{ShardExtentMap, ShardExtentSet};
use crate::messenger::{Messenger, ObjectRead, SubOpMessage, SubOpRead, SubOpReadReply, Tid};
use crate::shard::{ShardId, ShardMap, ShardSet};
use crate::stripe::{StripeInfo, PAGE_SIZE};
use crate::ObjectId;

/// Default dispatch priority for client reads.
pub const PRIORITY_DEFAULT: u8 = 127;

/// Shard membership of the placement group, as provided by peering.
pub trait ShardMembership: Send + Sync {
    fn acting_shards(&self) -> ShardSet;
    fn backfill_shards(&self) -> ShardSet;
    fn is_missing(&self, oid: &ObjectId, shard: ShardId) -> bool;
}

/// Static membership: every shard of the geometry is acting and complete.
pub struct FullMembership {
    shards: ShardSet,
}

impl FullMembership {
    pub fn new(sinfo: &StripeInfo) -> Self {
        Self {
            shards: sinfo.all_shards(),
        }
    }
}

impl ShardMembership for FullMembership {
    fn acting_shards(&self) -> ShardSet {
        self.shards
    }

    fn backfill_shards(&self) -> ShardSet {
        ShardSet::new()
    }

    fn is_missing(&self, _oid: &ObjectId, _shard: ShardId) -> bool {
        false
    }
}

// =============================================================================
// Request / result types
// =============================================================================

/// One client read range in RO coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcAlign {
    pub offset: u64,
    pub size: u64,
}

impl EcAlign {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

/// The actual read planned for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardRead {
    pub subchunks: crate::codec::SubChunkList,
    pub extents: ExtentSet,
    /// Ranges satisfied by implicit zeros, never sent to the backend.
    pub zero_pad: ExtentSet,
}

/// Read plan for one object.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub to_read: Vec<EcAlign>,
    pub shard_want_to_read: ShardExtentSet,
    pub want_attrs: bool,
    pub object_size: u64,
    pub shard_reads: ShardMap<ShardRead>,
}

impl ReadRequest {
    pub fn new(
        to_read: Vec<EcAlign>,
        shard_want_to_read: ShardExtentSet,
        want_attrs: bool,
        object_size: u64,
    ) -> Self {
        Self {
            to_read,
            shard_want_to_read,
            want_attrs,
            object_size,
            shard_reads: ShardMap::new(),
        }
    }

    /// Request shape used by the write path: the wanted shard extents come
    /// straight from the extent cache, with no RO ranges to extract.
    pub fn for_rmw(shard_want_to_read: ShardExtentSet, object_size: u64) -> Self {
        Self::new(Vec::new(), shard_want_to_read, false, object_size)
    }
}

/// Accumulated read state for one object.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub err: Option<Error>,
    pub errors: Vec<(ShardId, String)>,
    pub attrs: Option<BTreeMap<String, Bytes>>,
    /// Everything already read or zero-padded, so retries only fetch the
    /// delta.
    pub processed_read_requests: ShardExtentSet,
    pub buffers_read: Option<ShardExtentMap>,
}

/// One delivered object read.
pub struct EcExtent {
    pub oid: ObjectId,
    pub err: Option<Error>,
    /// Extracted client ranges, in RO coordinates.
    pub emap: ExtentMap,
    /// The decoded per-shard buffers, for callers that feed a cache.
    pub shard_extent_map: ShardExtentMap,
    pub attrs: Option<BTreeMap<String, Bytes>>,
}

pub type ReadDeliverFn = Box<dyn FnOnce(Vec<EcExtent>) + Send>;

/// What to do when a read op completes.
enum ReadCompletion {
    /// Decode missing shards, extract the RO ranges and deliver to the
    /// client status queue.
    DecodeAndDeliver { status: u64 },
    /// Nothing: the op was only driven for its side effects (tests).
    #[allow(dead_code)]
    Dummy,
}

struct ReadOp {
    tid: Tid,
    priority: u8,
    do_redundant_reads: bool,
    for_recovery: bool,
    to_read: BTreeMap<ObjectId, ReadRequest>,
    complete: BTreeMap<ObjectId, ReadResult>,
    obj_to_source: HashMap<ObjectId, ShardSet>,
    source_to_obj: HashMap<ShardId, Vec<ObjectId>>,
    in_progress: ShardSet,
    on_complete: ReadCompletion,
}

struct ClientReadStatus {
    id: u64,
    expected: usize,
    results: Vec<EcExtent>,
    deliver: Option<ReadDeliverFn>,
}

impl ClientReadStatus {
    fn is_complete(&self) -> bool {
        self.results.len() == self.expected
    }
}

enum Action {
    Send(ShardId, SubOpMessage),
    Deliver(ReadDeliverFn, Vec<EcExtent>),
}

#[derive(Default)]
struct ReadState {
    next_tid: Tid,
    next_status: u64,
    tid_to_read_map: HashMap<Tid, ReadOp>,
    shard_to_read_map: HashMap<ShardId, Vec<Tid>>,
    in_progress_client_reads: VecDeque<ClientReadStatus>,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Per-placement-group read coordinator.
pub struct ReadPipeline {
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    membership: Arc<dyn ShardMembership>,
    messenger: Arc<dyn Messenger>,
    whoami: ShardId,
    state: Mutex<ReadState>,
}

impl ReadPipeline {
    pub fn new(
        sinfo: Arc<StripeInfo>,
        codec: Arc<dyn ErasureCodec>,
        membership: Arc<dyn ShardMembership>,
        messenger: Arc<dyn Messenger>,
        whoami: ShardId,
    ) -> Self {
        Self {
            sinfo,
            codec,
            membership,
            messenger,
            whoami,
            state: Mutex::new(ReadState::default()),
        }
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Shards the PG can currently read from.
    fn get_all_avail_shards(
        &self,
        oid: &ObjectId,
        for_recovery: bool,
        error_shards: Option<&ShardSet>,
    ) -> ShardSet {
        let mut have = ShardSet::new();
        let mut candidates = self.membership.acting_shards();
        if for_recovery {
            candidates.union_with(&self.membership.backfill_shards());
        }
        for shard in candidates.iter() {
            if let Some(errors) = error_shards {
                if errors.contains(shard) {
                    continue;
                }
            }
            if !self.membership.is_missing(oid, shard) {
                have.insert(shard);
            }
        }
        have
    }

    /// Choose the minimum shard reads able to produce
    /// `read_request.shard_want_to_read`, recording the plan in
    /// `read_request.shard_reads`.
    #[instrument(skip_all, fields(%oid, for_recovery, do_redundant_reads))]
    pub fn get_min_avail_to_read_shards(
        &self,
        oid: &ObjectId,
        for_recovery: bool,
        do_redundant_reads: bool,
        read_request: &mut ReadRequest,
        error_shards: Option<&ShardSet>,
    ) -> Result<()> {
        // Redundant reads are for client latency; recovery must not widen
        // its own read set.
        assert!(!for_recovery || !do_redundant_reads);

        if read_request.object_size == 0 {
            debug!("empty object, nothing to read");
            return Ok(());
        }

        let have = self.get_all_avail_shards(oid, for_recovery, error_shards);
        let want = read_request.shard_want_to_read.keys();

        let mut need = self.codec.minimum_to_decode(&want, &have)?;
        if do_redundant_reads {
            let full: crate::codec::SubChunkList = vec![(0, self.codec.sub_chunk_count())];
            for shard in have.iter() {
                need.insert(shard, full.clone());
            }
        }

        // Extents that must be fetched from surviving shards to rebuild
        // wanted data on missing ones.
        let mut extra_extents = ExtentSet::new();
        for (shard, eset) in read_request.shard_want_to_read.iter() {
            if !have.contains(shard) || do_redundant_reads {
                extra_extents.union_with(eset);
            }
        }

        let read_mask = self.sinfo.ro_size_to_read_mask(read_request.object_size);
        let zero_mask = self.sinfo.ro_size_to_zero_mask(read_request.object_size);

        for (shard, subchunks) in need.iter() {
            if !have.contains(shard) {
                continue;
            }
            let mut extents = extra_extents.clone();
            if let Some(wanted) = read_request.shard_want_to_read.get(shard) {
                extents.union_with(wanted);
            }
            extents.align(PAGE_SIZE);

            let mut shard_read = ShardRead {
                subchunks: subchunks.clone(),
                ..ShardRead::default()
            };
            if let Some(zeroes) = zero_mask.get(shard) {
                shard_read.zero_pad = extents.intersection(zeroes);
            }
            if let Some(readable) = read_mask.get(shard) {
                shard_read.extents = extents.intersection(readable);
            }
            assert!(
                !shard_read.zero_pad.is_empty() || !shard_read.extents.is_empty(),
                "planned a shard read with nothing to produce"
            );
            read_request.shard_reads.insert(shard, shard_read);
        }
        trace!(?read_request, "planned shard reads");
        Ok(())
    }

    /// Replan around failed shards, keeping only the delta that has not
    /// already been read.
    fn get_remaining_shards(
        &self,
        oid: &ObjectId,
        read_result: &ReadResult,
        read_request: &mut ReadRequest,
        for_recovery: bool,
        do_redundant_reads: bool,
    ) -> Result<()> {
        let error_shards: ShardSet = read_result.errors.iter().map(|(shard, _)| *shard).collect();

        read_request.shard_reads = ShardMap::new();
        self.get_min_avail_to_read_shards(
            oid,
            for_recovery,
            do_redundant_reads,
            read_request,
            Some(&error_shards),
        )?;

        // Rather than repeating the whole read, remove everything already
        // obtained.
        read_request.shard_reads.retain(|shard, shard_read| {
            if let Some(processed) = read_result.processed_read_requests.get(shard) {
                shard_read.extents.subtract(processed);
                shard_read.zero_pad.subtract(processed);
            }
            !shard_read.extents.is_empty() || !shard_read.zero_pad.is_empty()
        });
        Ok(())
    }

    // =========================================================================
    // Client entry points
    // =========================================================================

    /// Plan and dispatch client reads; `deliver` fires once with every
    /// object's result, in submission order relative to other client
    /// reads.
    pub fn objects_read_and_reconstruct(
        &self,
        reads: Vec<(ObjectId, Vec<EcAlign>)>,
        fast_read: bool,
        object_size: u64,
        deliver: ReadDeliverFn,
    ) -> Result<()> {
        let mut requests = Vec::new();
        for (oid, aligns) in reads {
            // Clip to the object; a range fully beyond EOF reads nothing.
            let aligns: Vec<EcAlign> = aligns
                .into_iter()
                .filter_map(|a| {
                    let end = (a.offset + a.size).min(object_size);
                    (end > a.offset).then(|| EcAlign::new(a.offset, end - a.offset))
                })
                .collect();
            let mut want = ShardExtentSet::new();
            for align in &aligns {
                want.union_with(&self.sinfo.ro_range_to_shard_extent_set(align.offset, align.size));
            }
            let mut request = ReadRequest::new(aligns, want, false, object_size);
            self.get_min_avail_to_read_shards(&oid, false, fast_read, &mut request, None)?;
            requests.push((oid, request));
        }
        self.start_read_op(PRIORITY_DEFAULT, requests, fast_read, false, deliver);
        Ok(())
    }

    /// Dispatch pre-planned reads on behalf of the write path.
    pub fn objects_read_and_reconstruct_for_rmw(
        &self,
        to_read: Vec<(ObjectId, ReadRequest)>,
        deliver: ReadDeliverFn,
    ) -> Result<()> {
        let mut requests = Vec::new();
        for (oid, mut request) in to_read {
            self.get_min_avail_to_read_shards(&oid, false, false, &mut request, None)?;
            requests.push((oid, request));
        }
        self.start_read_op(PRIORITY_DEFAULT, requests, false, false, deliver);
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn start_read_op(
        &self,
        priority: u8,
        requests: Vec<(ObjectId, ReadRequest)>,
        do_redundant_reads: bool,
        for_recovery: bool,
        deliver: ReadDeliverFn,
    ) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            let status_id = state.next_status;
            state.next_status += 1;
            state.in_progress_client_reads.push_back(ClientReadStatus {
                id: status_id,
                expected: requests.len(),
                results: Vec::new(),
                deliver: Some(deliver),
            });

            if requests.is_empty() {
                Self::kick_reads(&mut state, &mut actions);
            } else {
                let tid = state.next_tid;
                state.next_tid += 1;

                let mut op = ReadOp {
                    tid,
                    priority,
                    do_redundant_reads,
                    for_recovery,
                    to_read: requests.into_iter().collect(),
                    complete: BTreeMap::new(),
                    obj_to_source: HashMap::new(),
                    source_to_obj: HashMap::new(),
                    in_progress: ShardSet::new(),
                    on_complete: ReadCompletion::DecodeAndDeliver { status: status_id },
                };
                for (oid, request) in &op.to_read {
                    op.complete
                        .insert(oid.clone(), Self::fresh_result(&self.sinfo, request));
                }
                self.dispatch_shard_reads(&mut state, &mut op, None, &mut actions);
                debug!(tid, objects = op.to_read.len(), "started read op");

                if op.in_progress.is_empty() {
                    self.finish_read_op(&mut state, op, &mut actions);
                } else {
                    state.tid_to_read_map.insert(tid, op);
                }
            }
        }
        self.perform(actions);
    }

    fn fresh_result(sinfo: &Arc<StripeInfo>, _request: &ReadRequest) -> ReadResult {
        ReadResult {
            buffers_read: Some(ShardExtentMap::new(sinfo.clone())),
            ..ReadResult::default()
        }
    }

    /// Send sub-reads for every planned shard read not yet marked
    /// processed. `only_oid` restricts dispatch to one object (the retry
    /// path).
    fn dispatch_shard_reads(
        &self,
        state: &mut ReadState,
        op: &mut ReadOp,
        only_oid: Option<&ObjectId>,
        actions: &mut Vec<Action>,
    ) {
        let mut messages: BTreeMap<ShardId, Vec<ObjectRead>> = BTreeMap::new();
        for (oid, request) in &op.to_read {
            if let Some(only) = only_oid {
                if oid != only {
                    continue;
                }
            }
            let result = op.complete.get_mut(oid).unwrap();
            let mut need_attrs = request.want_attrs && result.attrs.is_none();

            for (shard, shard_read) in request.shard_reads.iter() {
                let mut outstanding = shard_read.extents.clone();
                let mut zero_pad = shard_read.zero_pad.clone();
                if let Some(processed) = result.processed_read_requests.get(shard) {
                    outstanding.subtract(processed);
                    zero_pad.subtract(processed);
                }
                for (off, len) in zero_pad.iter() {
                    result
                        .buffers_read
                        .as_mut()
                        .unwrap()
                        .insert_in_shard(shard, off, BufferList::zeros(len));
                }
                result
                    .processed_read_requests
                    .insert_extent_set(shard, &zero_pad);
                if outstanding.is_empty() {
                    continue;
                }
                result
                    .processed_read_requests
                    .insert_extent_set(shard, &outstanding);

                messages.entry(shard).or_default().push(ObjectRead {
                    oid: oid.clone(),
                    extents: outstanding,
                    subchunks: shard_read.subchunks.clone(),
                    want_attrs: std::mem::take(&mut need_attrs),
                });
                op.obj_to_source.entry(oid.clone()).or_default().insert(shard);
                op.source_to_obj.entry(shard).or_default().push(oid.clone());
            }
        }

        for (shard, reads) in messages {
            op.in_progress.insert(shard);
            state.shard_to_read_map.entry(shard).or_default().push(op.tid);
            actions.push(Action::Send(
                shard,
                SubOpMessage::Read(SubOpRead {
                    tid: op.tid,
                    from: self.whoami,
                    priority: op.priority,
                    reads,
                }),
            ));
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Merge one peer's reply; completes the read op when the last shard
    /// reports in. Peer errors trigger a replan reading only the delta.
    pub fn handle_sub_read_reply(&self, reply: SubOpReadReply) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(mut op) = state.tid_to_read_map.remove(&reply.tid) else {
                warn!(tid = reply.tid, "reply for unknown read op");
                return;
            };
            let from = reply.from;

            for (oid, emap) in reply.buffers {
                let result = op.complete.get_mut(&oid).expect("reply for unknown object");
                for (off, _, buf) in emap.iter() {
                    result
                        .buffers_read
                        .as_mut()
                        .unwrap()
                        .insert_in_shard(from, off, buf.clone());
                }
            }
            for (oid, attrs) in reply.attrs {
                let result = op.complete.get_mut(&oid).expect("reply for unknown object");
                if result.attrs.is_none() {
                    result.attrs = Some(attrs);
                }
            }

            op.in_progress.remove(from);
            if let Some(tids) = state.shard_to_read_map.get_mut(&from) {
                tids.retain(|&tid| tid != reply.tid);
            }

            let mut failed_objects = Vec::new();
            for (oid, message) in reply.errors {
                warn!(%oid, %from, message, "peer read error");
                let result = op.complete.get_mut(&oid).expect("error for unknown object");
                result.errors.push((from, message));
                failed_objects.push(oid);
            }
            for oid in failed_objects {
                let request = op.to_read.get_mut(&oid).unwrap();
                let result = op.complete.get_mut(&oid).unwrap();
                match self.get_remaining_shards(
                    &oid,
                    result,
                    request,
                    op.for_recovery,
                    op.do_redundant_reads,
                ) {
                    Ok(()) => {}
                    Err(err) => {
                        debug!(%oid, %err, "no shards left to retry");
                        result.err = Some(err);
                        continue;
                    }
                }
                self.dispatch_shard_reads(&mut state, &mut op, Some(&oid), &mut actions);
            }

            if op.in_progress.is_empty() {
                self.finish_read_op(&mut state, op, &mut actions);
            } else {
                state.tid_to_read_map.insert(reply.tid, op);
            }
        }
        self.perform(actions);
    }

    fn finish_read_op(&self, state: &mut ReadState, mut op: ReadOp, actions: &mut Vec<Action>) {
        debug!(
            tid = op.tid,
            sources = ?op.obj_to_source,
            "completing read op"
        );
        // Retire whatever per-shard tid tracking the op still holds.
        for shard in op.source_to_obj.keys() {
            if let Some(tids) = state.shard_to_read_map.get_mut(shard) {
                tids.retain(|&tid| tid != op.tid);
            }
        }
        let ReadCompletion::DecodeAndDeliver { status } = op.on_complete else {
            return;
        };

        let mut delivered = Vec::new();
        for (oid, request) in std::mem::take(&mut op.to_read) {
            let mut result = op.complete.remove(&oid).expect("result for every object");
            let mut buffers = result.buffers_read.take().unwrap();
            let mut err = result.err.take();

            // A shard file shorter than its page-aligned read mask serves
            // the tail short; those bytes are implicit zeros. Shards that
            // reported errors are excluded, their data comes from decode.
            let error_shards: ShardSet =
                result.errors.iter().map(|(shard, _)| *shard).collect();
            for (shard, requested) in result.processed_read_requests.iter() {
                if error_shards.contains(shard) {
                    continue;
                }
                let mut shortfall = requested.clone();
                if let Some(covered) = buffers.get_extent_set(shard) {
                    shortfall.subtract(&covered);
                }
                for (off, len) in shortfall.iter().collect::<Vec<_>>() {
                    buffers.insert_in_shard(shard, off, BufferList::zeros(len));
                }
            }

            if err.is_none() {
                // Recover anything a failed or missing shard owed us.
                if let Err(decode_err) = buffers.decode(&*self.codec, &request.shard_want_to_read) {
                    err = Some(decode_err);
                }
            }

            let mut emap = ExtentMap::new();
            if err.is_none() {
                for align in &request.to_read {
                    match buffers.get_ro_buffer(align.offset, align.size) {
                        Ok(buf) => emap.insert(align.offset, buf),
                        Err(gap) => {
                            err = Some(gap);
                            break;
                        }
                    }
                }
            }

            delivered.push(EcExtent {
                oid,
                err,
                emap,
                shard_extent_map: buffers,
                attrs: result.attrs.take(),
            });
        }

        let status_entry = state
            .in_progress_client_reads
            .iter_mut()
            .find(|s| s.id == status)
            .expect("client read status must exist");
        status_entry.results.extend(delivered);
        Self::kick_reads(state, actions);
    }

    /// Deliver every leading completed client read, preserving submission
    /// order.
    fn kick_reads(state: &mut ReadState, actions: &mut Vec<Action>) {
        while let Some(front) = state.in_progress_client_reads.front_mut() {
            if !front.is_complete() {
                return;
            }
            let deliver = front.deliver.take().expect("status delivered twice");
            let results = std::mem::take(&mut front.results);
            state.in_progress_client_reads.pop_front();
            actions.push(Action::Deliver(deliver, results));
        }
    }

    /// Interval change: drop every in-flight read without delivering.
    pub fn on_change(&self) {
        let mut state = self.state.lock();
        let dropped = state.tid_to_read_map.len();
        state.tid_to_read_map.clear();
        state.shard_to_read_map.clear();
        state.in_progress_client_reads.clear();
        debug!(dropped, "read pipeline reset");
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().tid_to_read_map.len()
    }

    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(shard, msg) => self.messenger.send(shard, msg),
                Action::Deliver(deliver, results) => deliver(results),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
