//! Shard-Local Store
//!
//! The persistent object store is an external collaborator; the core only
//! consumes the [`ShardStore`] trait. [`MemStore`] backs the unit and
//! scenario tests, [`DirStore`] backs the offline consistency-check
//! tooling with one flat file per `(object, shard)` plus attribute
//! sidecars.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::extent::{BufferList, ExtentMap, ExtentSet};
use crate::shard::ShardId;
use crate::ObjectId;

/// Shard-local persistence consumed by the pipelines and peer servers.
///
/// Reads zero-fill any hole that falls inside the shard's current size;
/// ranges beyond the size simply come back absent.
pub trait ShardStore: Send + Sync {
    fn read(&self, oid: &ObjectId, shard: ShardId, extents: &ExtentSet) -> Result<ExtentMap>;

    /// Apply a write transaction: merge `writes` and set the shard's new
    /// size (which may truncate).
    fn write(&self, oid: &ObjectId, shard: ShardId, writes: &ExtentMap, new_size: u64)
        -> Result<()>;

    fn get_attr(&self, oid: &ObjectId, shard: ShardId, name: &str) -> Result<Option<Bytes>>;

    fn get_attrs(&self, oid: &ObjectId, shard: ShardId) -> Result<BTreeMap<String, Bytes>>;

    /// Set or remove (`None`) an attribute.
    fn set_attr(
        &self,
        oid: &ObjectId,
        shard: ShardId,
        name: &str,
        value: Option<Bytes>,
    ) -> Result<()>;

    fn shard_size(&self, oid: &ObjectId, shard: ShardId) -> Result<u64>;

    fn list_objects(&self) -> Result<Vec<ObjectId>>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct MemShardObject {
    data: ExtentMap,
    size: u64,
    attrs: BTreeMap<String, Bytes>,
}

/// HashMap-backed store for tests and scenarios.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<(ObjectId, ShardId), MemShardObject>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardStore for MemStore {
    fn read(&self, oid: &ObjectId, shard: ShardId, extents: &ExtentSet) -> Result<ExtentMap> {
        let objects = self.objects.lock();
        let mut out = ExtentMap::new();
        let Some(object) = objects.get(&(oid.clone(), shard)) else {
            return Ok(out);
        };
        for (off, len) in extents.iter() {
            // Clip to the shard size, then fill unwritten holes with
            // zeros.
            let end = (off + len).min(object.size);
            if end <= off {
                continue;
            }
            let mut wanted = ExtentSet::from_range(off, end - off);
            let present = object.data.intersect(off, end - off);
            wanted.subtract(&present.get_interval_set());
            out.insert_map(&present);
            for (zoff, zlen) in wanted.iter() {
                out.insert(zoff, BufferList::zeros(zlen));
            }
        }
        Ok(out)
    }

    fn write(
        &self,
        oid: &ObjectId,
        shard: ShardId,
        writes: &ExtentMap,
        new_size: u64,
    ) -> Result<()> {
        let mut objects = self.objects.lock();
        let object = objects.entry((oid.clone(), shard)).or_default();
        object.data.insert_map(writes);
        if new_size < object.size {
            object.data.erase(new_size, u64::MAX - new_size);
        }
        object.size = new_size;
        trace!(%oid, %shard, new_size, "mem store write");
        Ok(())
    }

    fn get_attr(&self, oid: &ObjectId, shard: ShardId, name: &str) -> Result<Option<Bytes>> {
        let objects = self.objects.lock();
        Ok(objects
            .get(&(oid.clone(), shard))
            .and_then(|o| o.attrs.get(name).cloned()))
    }

    fn get_attrs(&self, oid: &ObjectId, shard: ShardId) -> Result<BTreeMap<String, Bytes>> {
        let objects = self.objects.lock();
        Ok(objects
            .get(&(oid.clone(), shard))
            .map(|o| o.attrs.clone())
            .unwrap_or_default())
    }

    fn set_attr(
        &self,
        oid: &ObjectId,
        shard: ShardId,
        name: &str,
        value: Option<Bytes>,
    ) -> Result<()> {
        let mut objects = self.objects.lock();
        let object = objects.entry((oid.clone(), shard)).or_default();
        match value {
            Some(value) => {
                object.attrs.insert(name.to_string(), value);
            }
            None => {
                object.attrs.remove(name);
            }
        }
        Ok(())
    }

    fn shard_size(&self, oid: &ObjectId, shard: ShardId) -> Result<u64> {
        let objects = self.objects.lock();
        Ok(objects
            .get(&(oid.clone(), shard))
            .map(|o| o.size)
            .unwrap_or(0))
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let objects = self.objects.lock();
        let mut oids: Vec<ObjectId> = objects.keys().map(|(oid, _)| oid.clone()).collect();
        oids.sort();
        oids.dedup();
        Ok(oids)
    }
}

// =============================================================================
// Directory-backed store
// =============================================================================

/// One flat file per `(object, shard)`: `<name>.<shard>`, with attributes
/// in `<name>.<shard>.attr.<attr-name>` sidecars. Object names are used as
/// file names verbatim, so they must be plain path components.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn shard_path(&self, oid: &ObjectId, shard: ShardId) -> PathBuf {
        self.root.join(format!("{}.{}", oid.as_str(), shard.0))
    }

    fn attr_path(&self, oid: &ObjectId, shard: ShardId, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}.attr.{}", oid.as_str(), shard.0, name))
    }
}

impl ShardStore for DirStore {
    fn read(&self, oid: &ObjectId, shard: ShardId, extents: &ExtentSet) -> Result<ExtentMap> {
        let mut out = ExtentMap::new();
        let path = self.shard_path(oid, shard);
        let Ok(mut file) = fs::File::open(&path) else {
            return Ok(out);
        };
        let size = file.metadata()?.len();
        for (off, len) in extents.iter() {
            let end = (off + len).min(size);
            if end <= off {
                continue;
            }
            let mut buf = vec![0u8; (end - off) as usize];
            file.seek(SeekFrom::Start(off))?;
            file.read_exact(&mut buf)?;
            out.insert(off, BufferList::from(buf));
        }
        Ok(out)
    }

    fn write(
        &self,
        oid: &ObjectId,
        shard: ShardId,
        writes: &ExtentMap,
        new_size: u64,
    ) -> Result<()> {
        let path = self.shard_path(oid, shard);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        for (off, _, buf) in writes.iter() {
            file.seek(SeekFrom::Start(off))?;
            file.write_all(&buf.to_bytes())?;
        }
        file.set_len(new_size)?;
        Ok(())
    }

    fn get_attr(&self, oid: &ObjectId, shard: ShardId, name: &str) -> Result<Option<Bytes>> {
        match fs::read(self.attr_path(oid, shard, name)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn get_attrs(&self, oid: &ObjectId, shard: ShardId) -> Result<BTreeMap<String, Bytes>> {
        let prefix = format!("{}.{}.attr.", oid.as_str(), shard.0);
        let mut attrs = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(attr) = name.strip_prefix(&prefix) {
                attrs.insert(attr.to_string(), Bytes::from(fs::read(entry.path())?));
            }
        }
        Ok(attrs)
    }

    fn set_attr(
        &self,
        oid: &ObjectId,
        shard: ShardId,
        name: &str,
        value: Option<Bytes>,
    ) -> Result<()> {
        let path = self.attr_path(oid, shard, name);
        match value {
            Some(value) => fs::write(path, &value)?,
            None => match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
        Ok(())
    }

    fn shard_size(&self, oid: &ObjectId, shard: ShardId) -> Result<u64> {
        match fs::metadata(self.shard_path(oid, shard)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut oids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.contains(".attr.") {
                continue;
            }
            if let Some((object, shard)) = name.rsplit_once('.') {
                if shard.parse::<u8>().is_ok() {
                    oids.push(ObjectId::new(object));
                }
            }
        }
        oids.sort();
        oids.dedup();
        Ok(oids)
    }
}

// =============================================================================
// Tests
// =============================================================================
