//! Per-Object Extent Cache
//!
//! Coordinates concurrent read-modify-write operations on the objects of
//! one placement group. The cache pins the data an op needs, coalesces
//! overlapping backend read demand across queued ops, refuses to read
//! bytes an earlier queued write will supply, and executes ops strictly in
//! submission order.
//!
//! An object's RO address space is split into fixed-size lines (at least
//! [`MIN_LINE_SIZE`], at least one chunk). Lines are created on first
//! touch, pinned while any op references them, and freed on last unpin
//! (or parked in the [`Lru`] when eviction is enabled).
//!
//! Op lifecycle: prepared -> queued -> reads requested -> read done ->
//! cache ready (callback fires with the cached snapshot) -> written ->
//! released. All state lives behind one mutex; completion callbacks and
//! backend read submissions are always invoked with that mutex released,
//! so a callback may re-enter the cache (the write path does).
//!
//! Invariant breaches (out-of-order write completion, completing a
//! snapshot that does not match the request, unpinning a dead line) are
//! fatal assertions.

pub mod lru;

pub use lru::{LineKey, Lru};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::extent::ExtentSet;
use crate::layout::{ShardExtentMap, ShardExtentSet};
use crate::stripe::StripeInfo;
use crate::ObjectId;

/// Smallest cache-line size; lines are `max(MIN_LINE_SIZE, chunk_size)`.
pub const MIN_LINE_SIZE: u64 = 32 * 1024;

/// Fired once with the cached snapshot of the op's read set.
pub type CacheReadyCallback = Box<dyn FnOnce(ShardExtentMap) + Send>;

/// Backend read interface consumed by the cache.
///
/// The backend must eventually call [`ExtentCache::read_done`] with data
/// covering the whole request (or a superset). Invoked with the cache
/// mutex released.
pub trait BackendRead: Send + Sync {
    fn backend_read(&self, oid: ObjectId, request: ShardExtentSet, object_size: u64);
}

pub type OpRef = Arc<Op>;

/// One prepared cache operation.
pub struct Op {
    cache: Weak<Mutex<CacheState>>,
    oid: ObjectId,
    reads: Option<ShardExtentSet>,
    writes: ShardExtentSet,
    projected_size: u64,
    invalidates_cache: bool,
    state: Mutex<OpState>,
}

#[derive(Default)]
struct OpState {
    read_done: bool,
    complete: bool,
    retired: bool,
    lines: Vec<u64>,
    cb: Option<CacheReadyCallback>,
}

impl Op {
    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    pub fn writes(&self) -> &ShardExtentSet {
        &self.writes
    }

    pub fn reads(&self) -> Option<&ShardExtentSet> {
        self.reads.as_ref()
    }

    pub fn projected_size(&self) -> u64 {
        self.projected_size
    }

    /// Extents to pin: everything the op reads or writes, inflated to
    /// line alignment.
    fn pin_eset(&self, alignment: u64) -> ExtentSet {
        let mut eset = self.writes.get_extent_superset();
        if let Some(reads) = &self.reads {
            eset.union_with(&reads.get_extent_superset());
        }
        eset.align(alignment);
        eset
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            let mut state = cache.lock();
            state.release(self);
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct Line {
    ref_count: usize,
    in_lru: bool,
    cache: ShardExtentMap,
}

struct Object {
    oid: ObjectId,
    requesting: ShardExtentSet,
    reading: ShardExtentSet,
    writing: ShardExtentSet,
    reading_ops: Vec<OpRef>,
    requesting_ops: Vec<OpRef>,
    lines: BTreeMap<u64, Line>,
    active_ios: usize,
    current_size: u64,
    projected_size: u64,
}

impl Object {
    fn new(oid: ObjectId) -> Self {
        Self {
            oid,
            requesting: ShardExtentSet::new(),
            reading: ShardExtentSet::new(),
            writing: ShardExtentSet::new(),
            reading_ops: Vec::new(),
            requesting_ops: Vec::new(),
            lines: BTreeMap::new(),
            active_ios: 0,
            current_size: 0,
            projected_size: 0,
        }
    }
}

/// A deferred side effect, fired with the state mutex released.
enum Action {
    BackendRead(ObjectId, ShardExtentSet, u64),
    Complete(CacheReadyCallback, ShardExtentMap),
    Run(Box<dyn FnOnce() + Send>),
}

pub(crate) struct CacheState {
    sinfo: Arc<StripeInfo>,
    lru: Arc<Lru>,
    line_size: u64,
    objects: HashMap<ObjectId, Object>,
    waiting_ops: VecDeque<OpRef>,
    on_write_cbs: Vec<Box<dyn FnOnce() + Send>>,
    active_ios: usize,
    counter: u64,
}

impl CacheState {
    fn line_align(&self, offset: u64) -> u64 {
        offset - offset % self.line_size
    }

    // -------------------------------------------------------------------------
    // Pinning
    // -------------------------------------------------------------------------

    fn pin(&mut self, op: &OpRef) {
        let eset = op.pin_eset(self.line_size);
        let line_size = self.line_size;
        let object = self
            .objects
            .get_mut(&op.oid)
            .expect("object created at prepare");
        let mut op_state = op.state.lock();
        for (start, len) in eset.iter() {
            let mut to_pin = start;
            while to_pin < start + len {
                let line = object.lines.entry(to_pin).or_insert_with(|| Line {
                    ref_count: 0,
                    in_lru: false,
                    cache: ShardExtentMap::new(self.sinfo.clone()),
                });
                if line.in_lru {
                    self.lru.remove(&(object.oid.clone(), to_pin));
                    line.in_lru = false;
                }
                line.ref_count += 1;
                op_state.lines.push(to_pin);
                to_pin += line_size;
            }
        }
    }

    /// Unpin and account an op that is going away. Idempotent per op via
    /// the drained `lines` list.
    fn release(&mut self, op: &Op) {
        let mut op_state = op.state.lock();
        let lines = std::mem::take(&mut op_state.lines);
        let retired = op_state.retired;
        op_state.retired = true;
        drop(op_state);

        if !retired {
            assert!(self.active_ios > 0, "op released with no active io");
            self.active_ios -= 1;
        }

        let Some(object) = self.objects.get_mut(&op.oid) else {
            assert!(lines.is_empty(), "pinned lines outlived their object");
            return;
        };
        if !retired {
            assert!(object.active_ios > 0);
            object.active_ios -= 1;
        }

        let mut freed = Vec::new();
        for offset in lines {
            let line = object
                .lines
                .get_mut(&offset)
                .expect("pinned line must exist");
            assert!(line.ref_count > 0, "unpin of a dead line");
            line.ref_count -= 1;
            if line.ref_count == 0 {
                if self.lru.enabled() {
                    line.in_lru = true;
                    self.lru
                        .touch((object.oid.clone(), offset), line.cache.size());
                } else {
                    freed.push(offset);
                }
            }
        }
        let line_size = self.line_size;
        for offset in freed {
            Self::erase_line(object, offset, line_size);
        }
        self.delete_maybe(&op.oid);

        if self.lru.enabled() {
            for (oid, offset) in self.lru.free_maybe() {
                self.evict_line(&oid, offset);
            }
        }
    }

    fn erase_line(object: &mut Object, offset: u64, line_size: u64) {
        for set in [&object.writing, &object.reading, &object.requesting] {
            for (_, eset) in set.iter() {
                assert!(
                    !eset.intersects(offset, line_size),
                    "erasing a line with i/o outstanding"
                );
            }
        }
        object.lines.remove(&offset);
    }

    fn evict_line(&mut self, oid: &ObjectId, offset: u64) {
        if let Some(object) = self.objects.get_mut(oid) {
            if let Some(line) = object.lines.get(&offset) {
                assert!(line.ref_count == 0, "evicting a pinned line");
                let line_size = self.line_size;
                Self::erase_line(object, offset, line_size);
            }
        }
        self.delete_maybe(oid);
    }

    fn delete_maybe(&mut self, oid: &ObjectId) {
        if let Some(object) = self.objects.get(oid) {
            if object.lines.is_empty() && object.active_ios == 0 {
                self.objects.remove(oid);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Request / read flow
    // -------------------------------------------------------------------------

    fn request(&mut self, op: &OpRef, actions: &mut Vec<Action>) {
        self.pin(op);
        let object = self.objects.get_mut(&op.oid).unwrap();

        let mut read_required = false;
        if let Some(reads) = &op.reads {
            for (shard, eset) in reads.iter() {
                let mut request = eset.clone();
                for line in object.lines.values() {
                    if let Some(cached) = line.cache.get_extent_set(shard) {
                        request.subtract(&cached);
                    }
                }
                if let Some(reading) = object.reading.get(shard) {
                    request.subtract(reading);
                }
                if let Some(writing) = object.writing.get(shard) {
                    request.subtract(writing);
                }
                if !request.is_empty() {
                    object.requesting.insert_extent_set(shard, &request);
                    read_required = true;
                }
            }
            if read_required {
                object.requesting_ops.push(op.clone());
            }
        }

        // Overlapping queued reads and writes must come from the cache or
        // from a preceding op's write, never from the backend.
        object.writing.union_with(&op.writes);

        if read_required {
            Self::send_reads(object, actions);
        } else {
            op.state.lock().read_done = true;
        }
    }

    fn send_reads(object: &mut Object, actions: &mut Vec<Action>) {
        if !object.reading.is_empty() || object.requesting.is_empty() {
            return; // Read busy.
        }
        object.reading = std::mem::take(&mut object.requesting);
        object.reading_ops = std::mem::take(&mut object.requesting_ops);
        actions.push(Action::BackendRead(
            object.oid.clone(),
            object.reading.clone(),
            object.current_size,
        ));
    }

    fn insert(&mut self, oid: &ObjectId, buffers: &ShardExtentMap) {
        if buffers.is_empty() {
            return;
        }
        let line_size = self.line_size;
        let object = self.objects.get_mut(oid).unwrap();
        let mut slice_start = buffers.start_offset() - buffers.start_offset() % line_size;
        while slice_start < buffers.end_offset() {
            let slice = buffers.slice_map(slice_start, line_size);
            if !slice.is_empty() {
                // The line was created when the owning op was pinned.
                object
                    .lines
                    .get_mut(&slice_start)
                    .expect("insert into an unpinned line")
                    .cache
                    .insert(&slice);
            }
            slice_start += line_size;
        }
    }

    fn object_read_done(
        &mut self,
        oid: &ObjectId,
        buffers: ShardExtentMap,
        actions: &mut Vec<Action>,
    ) {
        {
            let object = self.objects.get_mut(oid).unwrap();
            object.reading.clear();
            for op in std::mem::take(&mut object.reading_ops) {
                op.state.lock().read_done = true;
            }
        }
        self.insert(oid, &buffers);
        let object = self.objects.get_mut(oid).unwrap();
        Self::send_reads(object, actions);
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Snapshot the cached bytes covering `set` from an object's lines.
    fn get_cache(&self, oid: &ObjectId, set: Option<&ShardExtentSet>) -> ShardExtentMap {
        let mut result = ShardExtentMap::new(self.sinfo.clone());
        let Some(set) = set else {
            return result;
        };
        let object = self.objects.get(oid).expect("object must exist");
        for (shard, eset) in set.iter() {
            for (off, len) in eset.iter() {
                let mut slice_start = self.line_align(off);
                while slice_start < off + len {
                    let offset = slice_start.max(off);
                    let length = (slice_start + self.line_size).min(off + len) - offset;
                    // The line must exist, it was pinned when the op was
                    // queued.
                    let line = object.lines.get(&slice_start).expect("line must exist");
                    if line.cache.contains_shard(shard) {
                        let cut = line
                            .cache
                            .get_extent_map(shard)
                            .unwrap()
                            .intersect(offset, length);
                        for (coff, _, buf) in cut.iter() {
                            result.insert_in_shard(shard, coff, buf.clone());
                        }
                    }
                    slice_start += self.line_size;
                }
            }
        }
        result
    }

    /// Complete the front op if its reads are fully cached. Later ops can
    /// only become ready once the front's write lands, so at most one op
    /// completes per sweep.
    fn cache_maybe_ready(&mut self, actions: &mut Vec<Action>) {
        let Some(front) = self.waiting_ops.front().cloned() else {
            return;
        };
        {
            let state = front.state.lock();
            if state.complete || !state.read_done {
                return;
            }
        }
        let result = self.get_cache(&front.oid, front.reads.as_ref());
        // Snapshot/request mismatch means the planner and the cache
        // disagree about what was read: a logic bug, not recoverable.
        match &front.reads {
            Some(reads) => assert!(
                *reads == result.get_shard_extent_set(),
                "cache snapshot does not match requested reads"
            ),
            None => assert!(result.is_empty(), "unexpected cache content for readless op"),
        }
        let mut state = front.state.lock();
        state.complete = true;
        let cb = state.cb.take().expect("op completed twice");
        actions.push(Action::Complete(cb, result));
    }

    fn object_write_done(
        &mut self,
        op: &OpRef,
        buffers: ShardExtentMap,
        actions: &mut Vec<Action>,
    ) {
        if op.invalidates_cache {
            let object = self.objects.get_mut(&op.oid).unwrap();
            for line in object.lines.values_mut() {
                line.cache.clear();
            }
        }
        self.insert(&op.oid, &buffers);
        let object = self.objects.get_mut(&op.oid).unwrap();
        // The op's whole reservation retires with it, even if the written
        // map came back short (a failed transaction writes nothing but
        // must still release its claim).
        object.writing.subtract(&buffers.get_shard_extent_set());
        object.writing.subtract(&op.writes);
        object.current_size = op.projected_size;

        // Retire the op: it no longer counts as active i/o, though its
        // pins survive until the last reference drops.
        {
            let mut state = op.state.lock();
            assert!(!state.retired, "write completed twice");
            state.retired = true;
        }
        assert!(object.active_ios > 0);
        object.active_ios -= 1;
        assert!(self.active_ios > 0);
        self.active_ios -= 1;

        self.cache_maybe_ready(actions);
    }
}

// =============================================================================
// Public cache
// =============================================================================

/// The per-placement-group extent cache. Clones share state.
pub struct ExtentCache {
    state: Arc<Mutex<CacheState>>,
    backend: Arc<dyn BackendRead>,
}

impl Clone for ExtentCache {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl ExtentCache {
    pub fn new(backend: Arc<dyn BackendRead>, lru: Arc<Lru>, sinfo: Arc<StripeInfo>) -> Self {
        let line_size = MIN_LINE_SIZE.max(sinfo.chunk_size());
        Self::with_line_size(backend, lru, sinfo, line_size)
    }

    /// Cache with an explicit line size (must be at least one chunk).
    pub fn with_line_size(
        backend: Arc<dyn BackendRead>,
        lru: Arc<Lru>,
        sinfo: Arc<StripeInfo>,
        line_size: u64,
    ) -> Self {
        assert!(line_size >= sinfo.chunk_size());
        Self {
            state: Arc::new(Mutex::new(CacheState {
                sinfo,
                lru,
                line_size,
                objects: HashMap::new(),
                waiting_ops: VecDeque::new(),
                on_write_cbs: Vec::new(),
                active_ios: 0,
                counter: 0,
            })),
            backend,
        }
    }

    /// Construct an op: allocate the object if absent, record sizes. The
    /// op does nothing until [`Self::execute`].
    pub fn prepare(
        &self,
        oid: ObjectId,
        to_read: Option<ShardExtentSet>,
        writes: ShardExtentSet,
        orig_size: u64,
        projected_size: u64,
        invalidates_cache: bool,
        cb: CacheReadyCallback,
    ) -> OpRef {
        let mut state = self.state.lock();
        let object = state
            .objects
            .entry(oid.clone())
            .or_insert_with(|| Object::new(oid.clone()));
        object.active_ios += 1;
        object.projected_size = projected_size;
        if object.active_ios == 1 {
            object.current_size = orig_size;
        }
        state.active_ios += 1;

        Arc::new(Op {
            cache: Arc::downgrade(&self.state),
            oid,
            reads: to_read,
            writes,
            projected_size,
            invalidates_cache,
            state: Mutex::new(OpState {
                cb: Some(cb),
                ..OpState::default()
            }),
        })
    }

    /// Queue prepared ops: pin their lines, work out what must be read
    /// from the backend, and complete whatever is already ready.
    pub fn execute(&self, ops: &[OpRef]) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            for op in ops {
                state.request(op, &mut actions);
                state.waiting_ops.push_back(op.clone());
                state.counter += 1;
                trace!(oid = %op.oid, "queued cache op");
            }
            state.cache_maybe_ready(&mut actions);
        }
        self.perform(actions);
    }

    /// Deliver backend read data. Must cover the outstanding read request
    /// for `oid`; reads for objects the cache no longer tracks (interval
    /// change raced with a backend reply) are dropped.
    pub fn read_done(&self, oid: &ObjectId, buffers: ShardExtentMap) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.objects.contains_key(oid) {
                warn!(%oid, "dropping read result for an untracked object");
                return;
            }
            state.object_read_done(oid, buffers, &mut actions);
            state.cache_maybe_ready(&mut actions);
        }
        self.perform(actions);
    }

    /// Record the completed write for the front op: merge its data into
    /// the cache, expose it to later ops and drive the next completion.
    /// Calling this for any op but the front is fatal.
    pub fn write_done(&self, op: &OpRef, buffers: ShardExtentMap) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            let front = state
                .waiting_ops
                .pop_front()
                .expect("write_done with no queued op");
            assert!(Arc::ptr_eq(&front, op), "write_done out of order");
            state.object_write_done(op, buffers, &mut actions);
            if state.waiting_ops.is_empty() {
                for cb in state.on_write_cbs.drain(..) {
                    actions.push(Action::Run(cb));
                }
            }
        }
        self.perform(actions);
    }

    /// Run `cb` once every op queued so far has completed its write; runs
    /// immediately when nothing is queued. Dropped without firing on
    /// [`Self::on_change`].
    pub fn add_on_write(&self, cb: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut state = self.state.lock();
            if state.waiting_ops.is_empty() {
                true
            } else {
                state.on_write_cbs.push(cb);
                return;
            }
        };
        if run_now {
            cb();
        }
    }

    /// Interval change: drop every queued op without firing its callback,
    /// discard reads and requests, and drain to the initial empty state.
    /// The caller must have dropped its own op references first; surviving
    /// pins here are a leak and fatal.
    pub fn on_change(&self) {
        let cancelled: Vec<OpRef> = {
            let mut state = self.state.lock();
            for object in state.objects.values_mut() {
                object.reading_ops.clear();
                object.requesting_ops.clear();
                object.reading.clear();
                object.writing.clear();
                object.requesting.clear();
            }
            state.on_write_cbs.clear();
            let cancelled: Vec<OpRef> = state.waiting_ops.drain(..).collect();
            for op in &cancelled {
                // Cancel: the callback is released without firing.
                op.state.lock().cb = None;
            }
            cancelled
        };
        let count = cancelled.len();
        drop(cancelled);

        let state = self.state.lock();
        assert!(
            state.objects.is_empty(),
            "objects survived on_change; leaked op reference?"
        );
        assert!(state.active_ios == 0, "active io survived on_change");
        debug!(cancelled = count, "extent cache reset");
    }

    pub fn contains_object(&self, oid: &ObjectId) -> bool {
        self.state.lock().objects.contains_key(oid)
    }

    pub fn projected_size(&self, oid: &ObjectId) -> Option<u64> {
        self.state.lock().objects.get(oid).map(|o| o.projected_size)
    }

    /// True when no op is between prepare and write completion.
    pub fn idle(&self) -> bool {
        self.state.lock().active_ios == 0
    }

    /// Ops queued since the last reset; reset on read. The write pipeline
    /// samples this when the cache goes idle to decide whether a
    /// roll-forward is worth driving.
    pub fn get_and_reset_counter(&self) -> u64 {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.counter, 0)
    }

    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BackendRead(oid, request, size) => {
                    self.backend.backend_read(oid, request, size);
                }
                Action::Complete(cb, result) => cb(result),
                Action::Run(cb) => cb(),
            }
        }
    }
}
