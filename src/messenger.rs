//! Peer Messaging
//!
//! The pipelines talk to peer shards through the [`Messenger`] trait: a
//! typed, fire-and-forget channel with ordering guaranteed per peer pair.
//! The cluster transport itself is out of scope; [`LoopbackMessenger`]
//! provides the in-process implementation used by the tests and the local
//! tooling, and [`ShardServer`] is the peer-side loop that applies sub-op
//! messages against a [`ShardStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::SubChunkList;
use crate::extent::{ExtentMap, ExtentSet};
use crate::shard::ShardId;
use crate::store::ShardStore;
use crate::ObjectId;

/// Transaction id scoping one pipeline operation.
pub type Tid = u64;

// =============================================================================
// Messages
// =============================================================================

/// One object's read request within a sub-read.
#[derive(Debug, Clone)]
pub struct ObjectRead {
    pub oid: ObjectId,
    pub extents: ExtentSet,
    pub subchunks: SubChunkList,
    pub want_attrs: bool,
}

/// Read request for one peer shard.
#[derive(Debug, Clone)]
pub struct SubOpRead {
    pub tid: Tid,
    pub from: ShardId,
    pub priority: u8,
    pub reads: Vec<ObjectRead>,
}

/// Reply to a [`SubOpRead`].
#[derive(Debug, Clone, Default)]
pub struct SubOpReadReply {
    pub tid: Tid,
    pub from: ShardId,
    pub buffers: Vec<(ObjectId, ExtentMap)>,
    pub attrs: Vec<(ObjectId, BTreeMap<String, Bytes>)>,
    pub errors: Vec<(ObjectId, String)>,
}

/// Write transaction for one peer shard.
#[derive(Debug, Clone)]
pub struct SubOpWrite {
    pub tid: Tid,
    pub from: ShardId,
    pub oid: ObjectId,
    pub version: u64,
    pub writes: ExtentMap,
    pub new_size: u64,
    /// Attribute updates; `None` removes the attribute.
    pub attr_updates: BTreeMap<String, Option<Bytes>>,
}

/// Commit acknowledgement for a [`SubOpWrite`].
#[derive(Debug, Clone)]
pub struct SubOpWriteReply {
    pub tid: Tid,
    pub from: ShardId,
}

/// The sub-op message set exchanged between peer shards.
#[derive(Debug, Clone)]
pub enum SubOpMessage {
    Read(SubOpRead),
    ReadReply(SubOpReadReply),
    Write(SubOpWrite),
    WriteReply(SubOpWriteReply),
}

/// Typed channel to peer shards. Implementations must deliver messages to
/// any single peer in send order.
pub trait Messenger: Send + Sync {
    fn send(&self, to: ShardId, msg: SubOpMessage);
}

// =============================================================================
// Loopback implementation
// =============================================================================

/// In-process messenger: one unbounded FIFO queue per registered shard.
#[derive(Default)]
pub struct LoopbackMessenger {
    endpoints: Mutex<BTreeMap<ShardId, mpsc::UnboundedSender<SubOpMessage>>>,
}

impl LoopbackMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard endpoint, returning its receive queue.
    pub fn register(&self, shard: ShardId) -> mpsc::UnboundedReceiver<SubOpMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().insert(shard, tx);
        rx
    }
}

impl Messenger for LoopbackMessenger {
    fn send(&self, to: ShardId, msg: SubOpMessage) {
        let sender = self.endpoints.lock().get(&to).cloned();
        match sender {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!(%to, "peer shard endpoint closed, dropping message");
                }
            }
            None => warn!(%to, "no endpoint registered for peer shard"),
        }
    }
}

// =============================================================================
// Peer-side server
// =============================================================================

/// Peer-side handler: applies sub-op messages against one shard's store
/// and sends replies through the messenger.
pub struct ShardServer {
    shard: ShardId,
    store: Arc<dyn ShardStore>,
    messenger: Arc<dyn Messenger>,
}

impl ShardServer {
    pub fn new(shard: ShardId, store: Arc<dyn ShardStore>, messenger: Arc<dyn Messenger>) -> Self {
        Self {
            shard,
            store,
            messenger,
        }
    }

    /// Handle one inbound message. Requests produce a reply to the sender;
    /// replies are not expected here and are dropped.
    pub fn handle(&self, msg: SubOpMessage) {
        match msg {
            SubOpMessage::Read(read) => {
                let origin = read.from;
                let reply = self.serve_read(read);
                self.messenger.send(origin, SubOpMessage::ReadReply(reply));
            }
            SubOpMessage::Write(write) => {
                let origin = write.from;
                let reply = self.serve_write(write);
                self.messenger.send(origin, SubOpMessage::WriteReply(reply));
            }
            other => warn!(shard = %self.shard, ?other, "unexpected message at shard server"),
        }
    }

    /// Drain a loopback receive queue until it closes.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<SubOpMessage>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
        debug!(shard = %self.shard, "shard server stopped");
    }

    fn serve_read(&self, read: SubOpRead) -> SubOpReadReply {
        let mut reply = SubOpReadReply {
            tid: read.tid,
            from: self.shard,
            ..SubOpReadReply::default()
        };
        for object in read.reads {
            match self.store.read(&object.oid, self.shard, &object.extents) {
                Ok(data) => {
                    if object.want_attrs {
                        match self.store.get_attrs(&object.oid, self.shard) {
                            Ok(attrs) => reply.attrs.push((object.oid.clone(), attrs)),
                            Err(err) => {
                                reply.errors.push((object.oid.clone(), err.to_string()));
                                continue;
                            }
                        }
                    }
                    reply.buffers.push((object.oid, data));
                }
                Err(err) => reply.errors.push((object.oid, err.to_string())),
            }
        }
        reply
    }

    fn serve_write(&self, write: SubOpWrite) -> SubOpWriteReply {
        if let Err(err) = self
            .store
            .write(&write.oid, self.shard, &write.writes, write.new_size)
        {
            // A failed local apply is surfaced as a missing commit; the
            // primary treats the timeout as a peer error.
            warn!(shard = %self.shard, oid = %write.oid, %err, "sub-op write failed");
        }
        for (name, value) in write.attr_updates {
            if let Err(err) = self.store.set_attr(&write.oid, self.shard, &name, value) {
                warn!(shard = %self.shard, oid = %write.oid, %err, "attr update failed");
            }
        }
        SubOpWriteReply {
            tid: write.tid,
            from: self.shard,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
