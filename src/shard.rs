//! Shard Identifiers and Dense Shard Containers
//!
//! A placement group spreads each object over `k + m` shards. Shard ids are
//! small (`< 128` in any supported geometry), so the set and map containers
//! here are dense: the set is a 128-bit bitset and the map is a
//! fixed-capacity array indexed by shard id. Both iterate in ascending shard
//! order, matching the contract of a sorted map.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of shards supported by the dense containers.
pub const MAX_SHARDS: usize = 128;

const BITS_PER_WORD: usize = 64;
const WORDS: usize = MAX_SHARDS / BITS_PER_WORD;

// =============================================================================
// ShardId
// =============================================================================

/// Identifier of a single shard within a placement group (value object).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ShardId(pub u8);

impl ShardId {
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for ShardId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl From<usize> for ShardId {
    fn from(id: usize) -> Self {
        debug_assert!(id < MAX_SHARDS);
        Self(id as u8)
    }
}

// =============================================================================
// ShardSet
// =============================================================================

/// Dense, ordered set of shard ids.
///
/// Behaves like a `BTreeSet<ShardId>` restricted to ids below
/// [`MAX_SHARDS`]; storage is a fixed bitset so copies are trivial.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardSet {
    words: [u64; WORDS],
}

impl ShardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing `0..n`.
    pub fn first_n(n: usize) -> Self {
        let mut set = Self::new();
        for id in 0..n {
            set.insert(ShardId::from(id));
        }
        set
    }

    pub fn insert(&mut self, shard: ShardId) {
        let i = shard.index();
        assert!(i < MAX_SHARDS, "shard id {i} out of range");
        self.words[i / BITS_PER_WORD] |= 1u64 << (i % BITS_PER_WORD);
    }

    pub fn remove(&mut self, shard: ShardId) {
        let i = shard.index();
        if i < MAX_SHARDS {
            self.words[i / BITS_PER_WORD] &= !(1u64 << (i % BITS_PER_WORD));
        }
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        let i = shard.index();
        i < MAX_SHARDS && self.words[i / BITS_PER_WORD] & (1u64 << (i % BITS_PER_WORD)) != 0
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        self.words = [0; WORDS];
    }

    /// Smallest shard id in the set.
    pub fn first(&self) -> Option<ShardId> {
        self.iter().next()
    }

    pub fn union_with(&mut self, other: &ShardSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
    }

    pub fn intersect_with(&mut self, other: &ShardSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= o;
        }
    }

    pub fn subtract(&mut self, other: &ShardSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
    }

    /// True if every member of `other` is also in `self`.
    pub fn includes(&self, other: &ShardSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(w, o)| w & o == *o)
    }

    pub fn intersection(&self, other: &ShardSet) -> ShardSet {
        let mut out = *self;
        out.intersect_with(other);
        out
    }

    pub fn iter(&self) -> ShardSetIter<'_> {
        ShardSetIter { set: self, pos: 0 }
    }
}

pub struct ShardSetIter<'a> {
    set: &'a ShardSet,
    pos: usize,
}

impl Iterator for ShardSetIter<'_> {
    type Item = ShardId;

    fn next(&mut self) -> Option<ShardId> {
        while self.pos < MAX_SHARDS {
            let word = self.set.words[self.pos / BITS_PER_WORD] >> (self.pos % BITS_PER_WORD);
            if word == 0 {
                // Skip to the next word boundary.
                self.pos = (self.pos / BITS_PER_WORD + 1) * BITS_PER_WORD;
                continue;
            }
            self.pos += word.trailing_zeros() as usize;
            let found = ShardId::from(self.pos);
            self.pos += 1;
            return Some(found);
        }
        None
    }
}

impl<'a> IntoIterator for &'a ShardSet {
    type Item = ShardId;
    type IntoIter = ShardSetIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<ShardId> for ShardSet {
    fn from_iter<I: IntoIterator<Item = ShardId>>(iter: I) -> Self {
        let mut set = Self::new();
        for shard in iter {
            set.insert(shard);
        }
        set
    }
}

impl fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// ShardMap
// =============================================================================

/// Dense map from [`ShardId`] to `T`.
///
/// Backed by a slot array plus a presence bitset, so lookups are O(1) and
/// iteration is in ascending shard order. Intended for the `k + m` sized
/// maps that flow through the encode/decode paths.
#[derive(Clone, Default)]
pub struct ShardMap<T> {
    present: ShardSet,
    slots: Vec<Option<T>>,
}

// Hand-written so that trailing empty slots do not affect equality.
impl<T: PartialEq> PartialEq for ShardMap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.present == other.present
            && self
                .iter()
                .zip(other.iter())
                .all(|((_, a), (_, b))| a == b)
    }
}

impl<T: Eq> Eq for ShardMap<T> {}

impl<T> ShardMap<T> {
    pub fn new() -> Self {
        Self {
            present: ShardSet::new(),
            slots: Vec::new(),
        }
    }

    pub fn insert(&mut self, shard: ShardId, value: T) -> Option<T> {
        let i = shard.index();
        assert!(i < MAX_SHARDS, "shard id {i} out of range");
        if self.slots.len() <= i {
            self.slots.resize_with(i + 1, || None);
        }
        let prev = self.slots[i].replace(value);
        self.present.insert(shard);
        prev
    }

    pub fn remove(&mut self, shard: ShardId) -> Option<T> {
        let i = shard.index();
        if !self.present.contains(shard) {
            return None;
        }
        self.present.remove(shard);
        self.slots[i].take()
    }

    pub fn get(&self, shard: ShardId) -> Option<&T> {
        self.slots.get(shard.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, shard: ShardId) -> Option<&mut T> {
        self.slots.get_mut(shard.index()).and_then(|s| s.as_mut())
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.present.contains(shard)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn clear(&mut self) {
        self.present.clear();
        self.slots.clear();
    }

    /// Set of present keys.
    pub fn keys(&self) -> ShardSet {
        self.present
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardId, &T)> {
        self.present
            .iter()
            .map(move |shard| (shard, self.slots[shard.index()].as_ref().unwrap()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ShardId, &mut T)> {
        let present = self.present;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(i, slot)| {
                let shard = ShardId::from(i);
                if present.contains(shard) {
                    slot.as_mut().map(|v| (shard, v))
                } else {
                    None
                }
            })
    }

    /// Drop entries for which the predicate returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(ShardId, &mut T) -> bool) {
        for shard in self.present.iter().collect::<Vec<_>>() {
            let remove = {
                let value = self.slots[shard.index()].as_mut().unwrap();
                !keep(shard, value)
            };
            if remove {
                self.remove(shard);
            }
        }
    }
}

impl<T: Default> ShardMap<T> {
    /// Mutable access, inserting `T::default()` if absent.
    pub fn entry_or_default(&mut self, shard: ShardId) -> &mut T {
        if !self.contains(shard) {
            self.insert(shard, T::default());
        }
        self.get_mut(shard).unwrap()
    }
}

impl<T> FromIterator<(ShardId, T)> for ShardMap<T> {
    fn from_iter<I: IntoIterator<Item = (ShardId, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (shard, value) in iter {
            map.insert(shard, value);
        }
        map
    }
}

impl<T: fmt::Debug> fmt::Debug for ShardMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_set_insert_contains() {
        let mut set = ShardSet::new();
        assert!(set.is_empty());

        set.insert(ShardId(0));
        set.insert(ShardId(63));
        set.insert(ShardId(64));
        set.insert(ShardId(127));

        assert!(set.contains(ShardId(0)));
        assert!(set.contains(ShardId(63)));
        assert!(set.contains(ShardId(64)));
        assert!(set.contains(ShardId(127)));
        assert!(!set.contains(ShardId(1)));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_shard_set_ordered_iteration() {
        let mut set = ShardSet::new();
        for id in [5u8, 1, 127, 64, 63] {
            set.insert(ShardId(id));
        }
        let order: Vec<u8> = set.iter().map(|s| s.0).collect();
        assert_eq!(order, vec![1, 5, 63, 64, 127]);
        assert_eq!(set.first(), Some(ShardId(1)));
    }

    #[test]
    fn test_shard_set_algebra() {
        let a: ShardSet = [0u8, 1, 2, 3].into_iter().map(ShardId).collect();
        let b: ShardSet = [2u8, 3, 4].into_iter().map(ShardId).collect();

        let mut union = a;
        union.union_with(&b);
        assert_eq!(union.len(), 5);

        let inter = a.intersection(&b);
        let inter_ids: Vec<u8> = inter.iter().map(|s| s.0).collect();
        assert_eq!(inter_ids, vec![2, 3]);

        let mut diff = a;
        diff.subtract(&b);
        let diff_ids: Vec<u8> = diff.iter().map(|s| s.0).collect();
        assert_eq!(diff_ids, vec![0, 1]);

        assert!(union.includes(&a));
        assert!(union.includes(&b));
        assert!(!a.includes(&b));
    }

    #[test]
    fn test_shard_set_remove() {
        let mut set = ShardSet::first_n(4);
        set.remove(ShardId(2));
        assert_eq!(set.len(), 3);
        assert!(!set.contains(ShardId(2)));
    }

    #[test]
    fn test_shard_map_basic() {
        let mut map: ShardMap<String> = ShardMap::new();
        assert!(map.is_empty());

        map.insert(ShardId(3), "three".to_string());
        map.insert(ShardId(0), "zero".to_string());

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(ShardId(3)).unwrap(), "three");
        assert!(map.get(ShardId(1)).is_none());

        let keys: Vec<u8> = map.keys().iter().map(|s| s.0).collect();
        assert_eq!(keys, vec![0, 3]);
    }

    #[test]
    fn test_shard_map_ordered_iteration() {
        let mut map: ShardMap<u32> = ShardMap::new();
        map.insert(ShardId(9), 9);
        map.insert(ShardId(1), 1);
        map.insert(ShardId(4), 4);

        let entries: Vec<(u8, u32)> = map.iter().map(|(s, v)| (s.0, *v)).collect();
        assert_eq!(entries, vec![(1, 1), (4, 4), (9, 9)]);
    }

    #[test]
    fn test_shard_map_replace_and_remove() {
        let mut map: ShardMap<u32> = ShardMap::new();
        assert_eq!(map.insert(ShardId(2), 10), None);
        assert_eq!(map.insert(ShardId(2), 20), Some(10));
        assert_eq!(map.remove(ShardId(2)), Some(20));
        assert_eq!(map.remove(ShardId(2)), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_shard_map_entry_or_default() {
        let mut map: ShardMap<Vec<u32>> = ShardMap::new();
        map.entry_or_default(ShardId(1)).push(7);
        map.entry_or_default(ShardId(1)).push(8);
        assert_eq!(map.get(ShardId(1)).unwrap(), &vec![7, 8]);
    }

    #[test]
    fn test_shard_map_retain() {
        let mut map: ShardMap<u32> = (0..6u8).map(|i| (ShardId(i), i as u32)).collect();
        map.retain(|_, v| *v % 2 == 0);
        let keys: Vec<u8> = map.keys().iter().map(|s| s.0).collect();
        assert_eq!(keys, vec![0, 2, 4]);
    }
}
