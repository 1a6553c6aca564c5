//! Extent Cache Scenarios
//!
//! End-to-end cache behavior driven through a test client that stands in
//! for the read pipeline: backend reads are recorded and completed by
//! hand, write data is injected with regenerated parity placeholders, and
//! every assertion is about what the cache requested, coalesced, elided or
//! completed.

use std::sync::{Arc, Mutex};

use ecshard::cache::{BackendRead, ExtentCache, Lru, OpRef};
use ecshard::extent::BufferList;
use ecshard::layout::{ShardExtentMap, ShardExtentSet};
use ecshard::shard::ShardId;
use ecshard::stripe::StripeInfo;
use ecshard::ObjectId;

// =============================================================================
// Harness
// =============================================================================

#[derive(Default)]
struct ClientState {
    active_reads: Option<ShardExtentSet>,
    result: Option<ShardExtentMap>,
}

struct Recorder {
    oid: ObjectId,
    state: Arc<Mutex<ClientState>>,
}

impl BackendRead for Recorder {
    fn backend_read(&self, oid: ObjectId, request: ShardExtentSet, _object_size: u64) {
        assert_eq!(oid, self.oid);
        let mut state = self.state.lock().unwrap();
        assert!(
            state.active_reads.is_none(),
            "two backend reads in flight at once"
        );
        state.active_reads = Some(request);
    }
}

struct Client {
    oid: ObjectId,
    sinfo: Arc<StripeInfo>,
    cache: ExtentCache,
    state: Arc<Mutex<ClientState>>,
}

impl Client {
    fn new(chunk_size: u64, k: usize, m: usize, cache_size: u64) -> Self {
        let oid = ObjectId::new("test-object");
        let sinfo = Arc::new(StripeInfo::new(k, m, chunk_size * k as u64).unwrap());
        let state = Arc::new(Mutex::new(ClientState::default()));
        let backend = Arc::new(Recorder {
            oid: oid.clone(),
            state: state.clone(),
        });
        let cache = ExtentCache::new(backend, Arc::new(Lru::new(cache_size)), sinfo.clone());
        Self {
            oid,
            sinfo,
            cache,
            state,
        }
    }

    fn prepare(
        &self,
        to_read: Option<ShardExtentSet>,
        writes: ShardExtentSet,
        orig_size: u64,
        projected_size: u64,
    ) -> OpRef {
        let state = self.state.clone();
        self.cache.prepare(
            self.oid.clone(),
            to_read,
            writes,
            orig_size,
            projected_size,
            false,
            Box::new(move |snapshot| {
                state.lock().unwrap().result = Some(snapshot);
            }),
        )
    }

    fn active_reads(&self) -> Option<ShardExtentSet> {
        self.state.lock().unwrap().active_reads.clone()
    }

    fn result_set(&self) -> Option<ShardExtentSet> {
        self.state
            .lock()
            .unwrap()
            .result
            .as_ref()
            .map(|map| map.get_shard_extent_set())
    }

    fn has_result(&self) -> bool {
        self.state.lock().unwrap().result.is_some()
    }

    /// Complete the outstanding backend read with zero-filled buffers.
    fn complete_read(&self) {
        let request = {
            let mut state = self.state.lock().unwrap();
            state.active_reads.take().expect("no backend read to serve")
        };
        let buffers = imap_from_iset(&request, &self.sinfo);
        self.cache.read_done(&self.oid, buffers);
    }

    /// Complete the front op's write: its write set, parity placeholders
    /// included. Parity correctness does not matter to the cache.
    fn complete_write(&self, op: &OpRef) {
        let mut buffers = imap_from_iset(op.writes(), &self.sinfo);
        buffers.insert_parity_buffers();
        self.state.lock().unwrap().result = None;
        self.cache.write_done(op, buffers);
    }
}

fn iset(shards: &[&[(u64, u64)]]) -> ShardExtentSet {
    let mut out = ShardExtentSet::new();
    for (shard, ranges) in shards.iter().enumerate() {
        for &(off, len) in ranges.iter() {
            out.insert(ShardId(shard as u8), off, len);
        }
    }
    out
}

fn imap_from_iset(set: &ShardExtentSet, sinfo: &Arc<StripeInfo>) -> ShardExtentMap {
    let mut out = ShardExtentMap::new(sinfo.clone());
    for (shard, eset) in set.iter() {
        for (off, len) in eset.iter() {
            out.insert_in_shard(shard, off, BufferList::zeros(len));
        }
    }
    out
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn simple_write() {
    let cl = Client::new(32, 2, 1, 64);
    {
        let to_read = iset(&[&[(0, 2)], &[(0, 2)]]);
        let to_write = iset(&[&[(0, 10)], &[(0, 10)]]);

        let op = cl.prepare(Some(to_read.clone()), to_write, 10, 10);
        cl.cache.execute(&[op.clone()]);

        // Exactly the requested bytes hit the backend, and nothing
        // completes until they return.
        assert_eq!(cl.active_reads(), Some(to_read.clone()));
        assert!(!cl.has_result());
        cl.complete_read();

        assert!(cl.active_reads().is_none());
        assert_eq!(cl.result_set(), Some(to_read));
        cl.complete_write(&op);

        assert!(cl.active_reads().is_none());
        assert!(!cl.has_result());
        assert!(cl.cache.idle());
        drop(op);
    }

    // Repeating the same read hits the backend again: eviction is
    // disabled, so the lines were freed when the op released them.
    {
        let to_read = iset(&[&[(0, 2)], &[(0, 2)]]);
        let to_write = iset(&[&[(0, 10)], &[(0, 10)]]);
        let op = cl.prepare(Some(to_read.clone()), to_write, 10, 10);
        cl.cache.execute(&[op.clone()]);
        assert!(cl.active_reads().is_some());
        cl.complete_read();

        assert_eq!(cl.result_set(), Some(to_read));
        cl.complete_write(&op);
        drop(op);
    }

    // A read overlapping the previous write but not the previous read
    // behaves the same way for the same reason.
    {
        let to_read = iset(&[&[(2, 2)], &[(2, 2)]]);
        let to_write = iset(&[&[(0, 10)], &[(0, 10)]]);
        let op = cl.prepare(Some(to_read.clone()), to_write, 10, 10);
        cl.cache.execute(&[op.clone()]);
        assert!(cl.active_reads().is_some());
        cl.complete_read();

        assert_eq!(cl.result_set(), Some(to_read));
        cl.complete_write(&op);
        drop(op);
    }

    assert!(!cl.cache.contains_object(&cl.oid));
}

#[test]
fn sequential_appends() {
    let cl = Client::new(32, 2, 1, 32);

    // Appends have no read set and complete synchronously with an empty
    // snapshot; no backend read is ever issued.
    let to_write1 = iset(&[&[(0, 10)]]);
    let op1 = cl.prepare(None, to_write1, 0, 10);
    cl.cache.execute(&[op1.clone()]);

    assert!(cl.active_reads().is_none());
    assert!(cl.has_result());
    assert_eq!(cl.result_set(), Some(ShardExtentSet::new()));
    cl.complete_write(&op1);
    assert!(!cl.has_result());

    let to_write2 = iset(&[&[(10, 10)]]);
    let op2 = cl.prepare(None, to_write2, 10, 20);
    cl.cache.execute(&[op2.clone()]);

    assert!(cl.active_reads().is_none());
    assert!(cl.has_result());
    cl.complete_write(&op2);

    assert!(cl.cache.idle());
}

#[test]
fn multiple_writes_coalesce_and_elide() {
    let cl = Client::new(32, 2, 1, 32);

    let to_read1 = iset(&[&[(0, 2)]]);
    let to_write1 = iset(&[&[(0, 10)]]);
    let op1 = cl.prepare(Some(to_read1.clone()), to_write1, 10, 10);
    cl.cache.execute(&[op1.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read1.clone()));
    assert!(!cl.has_result());

    // A second op: its read queues behind the in-flight one.
    let to_read2 = iset(&[&[(8, 4)]]);
    let to_write2 = iset(&[&[(10, 10)]]);
    let op2 = cl.prepare(Some(to_read2.clone()), to_write2, 10, 10);
    cl.cache.execute(&[op2.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read1.clone()));
    assert!(!cl.has_result());

    // A third op coalesces into the same pending batch.
    let to_read3 = iset(&[&[(32, 6)]]);
    let to_write3 = iset(&[&[], &[(40, 0)]]);
    let op3 = cl.prepare(Some(to_read3.clone()), to_write3, 10, 10);
    cl.cache.execute(&[op3.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read1.clone()));
    assert!(!cl.has_result());

    // A fourth op with no reads at all.
    let to_write4 = iset(&[&[(20, 10)]]);
    let op4 = cl.prepare(None, to_write4, 10, 10);
    cl.cache.execute(&[op4.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read1));
    assert!(!cl.has_result());

    // Completing the first read releases op1 and starts the batched
    // read. [8, 10) is elided: op1 wrote it, so the cache must not fetch
    // it from the backend.
    cl.complete_read();
    let expected_batch = iset(&[&[(10, 2), (32, 6)]]);
    assert_eq!(cl.active_reads(), Some(expected_batch));
    assert_eq!(cl.result_set(), Some(iset(&[&[(0, 2)]])));
    cl.complete_write(&op1);

    // op2 still waits on the batched read.
    assert!(!cl.has_result());

    // The batch completes: op2 becomes ready; its write unblocks op3 and
    // then op4 with no further backend reads.
    cl.complete_read();
    assert!(cl.active_reads().is_none());
    assert_eq!(cl.result_set(), Some(to_read2));
    cl.complete_write(&op2);

    assert!(cl.has_result());
    assert_eq!(cl.result_set(), Some(to_read3));
    cl.complete_write(&op3);

    // No read data for op4.
    assert_eq!(cl.result_set(), Some(ShardExtentSet::new()));
    cl.complete_write(&op4);

    drop(op1);
    drop(op2);
    drop(op3);
    drop(op4);
    assert!(cl.cache.idle());
    assert!(!cl.cache.contains_object(&cl.oid));
}

#[test]
fn on_change_cancels_without_firing() {
    let cl = Client::new(32, 2, 1, 64);
    let to_read = iset(&[&[(0, 2)]]);
    let to_write = iset(&[&[(0, 10)]]);

    // The sentinel's only other reference lives inside the callback; if
    // the callback is dropped without firing, the count falls back to
    // one.
    let sentinel = Arc::new(());
    let captured = sentinel.clone();
    let op = cl.cache.prepare(
        cl.oid.clone(),
        Some(to_read),
        to_write,
        10,
        10,
        false,
        Box::new(move |_| {
            let _keep = &captured;
            panic!("cancelled op completed");
        }),
    );
    cl.cache.execute(&[op.clone()]);
    assert_eq!(Arc::strong_count(&sentinel), 2);

    drop(op);
    assert_eq!(Arc::strong_count(&sentinel), 2);

    cl.cache.on_change();
    assert_eq!(Arc::strong_count(&sentinel), 1);
    assert!(!cl.cache.contains_object(&cl.oid));
    assert!(cl.cache.idle());

    // The cache accepts new ops afterwards.
    let op = cl.prepare(None, iset(&[&[(0, 10)]]), 0, 10);
    cl.cache.execute(&[op.clone()]);
    assert!(cl.has_result());
    cl.complete_write(&op);
}

#[test]
fn multiple_misaligned_writes() {
    let kb = 1024u64;
    let cl = Client::new(256 * kb, 2, 1, 1024 * kb);

    // IO 1 is a 6k write inflated to 8k; the second 4k page is partial,
    // so it is read for the merge.
    let to_read1 = iset(&[&[(4 * kb, 4 * kb)]]);
    let to_write1 = iset(&[&[(0, 8 * kb)]]);

    // IO 2 writes the next 8k starting at 6k: a 12k aligned write whose
    // first page is already cached by IO 1's read and write.
    let to_read2 = iset(&[&[(4 * kb, 4 * kb), (12 * kb, 4 * kb)]]);
    let to_read2_exec = iset(&[&[(12 * kb, 4 * kb)]]);
    let to_write2 = iset(&[&[(4 * kb, 12 * kb)]]);

    // IO 3 repeats the shape one page later.
    let to_read3 = iset(&[&[(12 * kb, 4 * kb), (20 * kb, 4 * kb)]]);
    let to_read3_exec = iset(&[&[(20 * kb, 4 * kb)]]);
    let to_write3 = iset(&[&[(12 * kb, 12 * kb)]]);

    let op1 = cl.prepare(Some(to_read1.clone()), to_write1, 22 * kb, 22 * kb);
    cl.cache.execute(&[op1.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read1.clone()));
    assert!(!cl.has_result());

    let op2 = cl.prepare(Some(to_read2.clone()), to_write2, 22 * kb, 22 * kb);
    cl.cache.execute(&[op2.clone()]);
    // Still executing read 1.
    assert_eq!(cl.active_reads(), Some(to_read1));
    assert!(!cl.has_result());

    // Read 1 completes: op1 is ready and only the uncached page of read
    // 2 goes to the backend.
    cl.complete_read();
    assert_eq!(cl.active_reads(), Some(to_read2_exec.clone()));
    assert!(cl.has_result());
    cl.complete_write(&op1);

    let op3 = cl.prepare(Some(to_read3.clone()), to_write3, 22 * kb, 22 * kb);
    cl.cache.execute(&[op3.clone()]);
    assert_eq!(cl.active_reads(), Some(to_read2_exec));
    assert!(!cl.has_result());

    cl.complete_read();
    assert_eq!(cl.active_reads(), Some(to_read3_exec.clone()));
    assert!(cl.has_result());
    assert_eq!(cl.result_set(), Some(to_read2));
    cl.complete_write(&op2);
    assert_eq!(cl.active_reads(), Some(to_read3_exec));
    assert!(!cl.has_result());

    cl.complete_read();
    assert!(cl.has_result());
    assert_eq!(cl.result_set(), Some(to_read3));
    cl.complete_write(&op3);
}

#[test]
fn write_ordered_callbacks() {
    let cl = Client::new(32, 2, 1, 64);

    // Nothing queued: runs immediately.
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    cl.cache
        .add_on_write(Box::new(move || sink.lock().unwrap().push("idle")));
    assert_eq!(*fired.lock().unwrap(), vec!["idle"]);

    // With an op queued, the callback waits for its write.
    let op = cl.prepare(None, iset(&[&[(0, 10)]]), 0, 10);
    cl.cache.execute(&[op.clone()]);
    let sink = fired.clone();
    cl.cache
        .add_on_write(Box::new(move || sink.lock().unwrap().push("after-write")));
    assert_eq!(fired.lock().unwrap().len(), 1);

    cl.complete_write(&op);
    assert_eq!(*fired.lock().unwrap(), vec!["idle", "after-write"]);
}
