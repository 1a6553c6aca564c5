//! Interval-to-Buffer Map
//!
//! Maps disjoint half-open byte intervals to [`BufferList`]s. A later
//! insert overwrites any overlapped bytes of an earlier one, and adjacent
//! entries are merged, so the map always holds the newest data for every
//! covered byte with the fewest possible entries.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::extent::{BufferList, ExtentSet};

/// Ordered map from byte intervals to buffers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExtentMap {
    // start offset -> buffer; entry length is the buffer length.
    // Entries never overlap and never touch (touching entries are merged).
    entries: BTreeMap<u64, BufferList>,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Total bytes covered.
    pub fn size(&self) -> u64 {
        self.entries.values().map(|b| b.len()).sum()
    }

    /// Smallest covered offset.
    pub fn start_off(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    /// One past the largest covered offset.
    pub fn end_off(&self) -> Option<u64> {
        self.entries
            .iter()
            .next_back()
            .map(|(off, buf)| off + buf.len())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Insert `buf` at `off`, overwriting any overlapped bytes and merging
    /// with adjacent entries.
    pub fn insert(&mut self, off: u64, buf: BufferList) {
        if buf.is_empty() {
            return;
        }
        let len = buf.len();
        let end = off + len;

        // Trim or split existing entries that overlap the new range.
        let scan_from = self
            .entries
            .range(..=off)
            .next_back()
            .map(|(&o, _)| o)
            .unwrap_or(0);
        let overlapping: Vec<u64> = self
            .entries
            .range(scan_from..end)
            .filter(|(&eoff, ebuf)| eoff + ebuf.len() > off)
            .map(|(&eoff, _)| eoff)
            .collect();
        for eoff in overlapping {
            let ebuf = self.entries.remove(&eoff).unwrap();
            let eend = eoff + ebuf.len();
            if eoff < off {
                self.entries.insert(eoff, ebuf.substr_of(0, off - eoff));
            }
            if eend > end {
                self.entries
                    .insert(end, ebuf.substr_of(end - eoff, eend - end));
            }
        }

        // Merge with a directly preceding neighbour.
        let mut new_off = off;
        let mut new_buf = buf;
        if let Some((&poff, pbuf)) = self.entries.range(..off).next_back() {
            if poff + pbuf.len() == off {
                let mut merged = self.entries.remove(&poff).unwrap();
                merged.claim_append(new_buf);
                new_off = poff;
                new_buf = merged;
            }
        }
        // Merge with a directly following neighbour.
        if let Some(nbuf) = self.entries.remove(&end) {
            new_buf.claim_append(nbuf);
        }
        self.entries.insert(new_off, new_buf);
    }

    /// Merge every entry of `other` into `self` (later data wins).
    pub fn insert_map(&mut self, other: &ExtentMap) {
        for (off, _, buf) in other.iter() {
            self.insert(off, buf.clone());
        }
    }

    /// Remove coverage of `[off, off + len)`, splitting entries as needed.
    pub fn erase(&mut self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = off + len;
        let scan_from = self
            .entries
            .range(..=off)
            .next_back()
            .map(|(&o, _)| o)
            .unwrap_or(0);
        let overlapping: Vec<u64> = self
            .entries
            .range(scan_from..end)
            .filter(|(&eoff, ebuf)| eoff + ebuf.len() > off)
            .map(|(&eoff, _)| eoff)
            .collect();
        for eoff in overlapping {
            let ebuf = self.entries.remove(&eoff).unwrap();
            let eend = eoff + ebuf.len();
            if eoff < off {
                self.entries.insert(eoff, ebuf.substr_of(0, off - eoff));
            }
            if eend > end {
                self.entries
                    .insert(end, ebuf.substr_of(end - eoff, eend - end));
            }
        }
    }

    /// New map restricted to `[off, off + len)`.
    pub fn intersect(&self, off: u64, len: u64) -> ExtentMap {
        let mut out = ExtentMap::new();
        if len == 0 {
            return out;
        }
        let end = off + len;
        let scan_from = self
            .entries
            .range(..=off)
            .next_back()
            .map(|(&o, _)| o)
            .unwrap_or(0);
        for (&eoff, ebuf) in self.entries.range(scan_from..end) {
            let eend = eoff + ebuf.len();
            if eend <= off {
                continue;
            }
            let s = eoff.max(off);
            let e = eend.min(end);
            out.insert(s, ebuf.substr_of(s - eoff, e - s));
        }
        out
    }

    /// The set of intervals this map covers.
    pub fn get_interval_set(&self) -> ExtentSet {
        self.entries
            .iter()
            .map(|(&off, buf)| (off, buf.len()))
            .collect()
    }

    /// True if every byte of the set is covered.
    pub fn contains_set(&self, set: &ExtentSet) -> bool {
        self.get_interval_set().contains_set(set)
    }

    /// Reassemble a contiguous buffer over `[off, off + len)`.
    ///
    /// Fails with [`Error::Gap`] if any byte of the range is not covered.
    pub fn get_buffer(&self, off: u64, len: u64) -> Result<BufferList> {
        let mut out = BufferList::new();
        if len == 0 {
            return Ok(out);
        }
        let end = off + len;
        let mut at = off;
        let scan_from = self
            .entries
            .range(..=off)
            .next_back()
            .map(|(&o, _)| o)
            .unwrap_or(0);
        for (&eoff, ebuf) in self.entries.range(scan_from..end) {
            let eend = eoff + ebuf.len();
            if eend <= at {
                continue;
            }
            if eoff > at {
                return Err(Error::Gap {
                    offset: at,
                    length: eoff - at,
                });
            }
            let take_end = eend.min(end);
            out.claim_append(ebuf.substr_of(at - eoff, take_end - at));
            at = take_end;
            if at == end {
                return Ok(out);
            }
        }
        Err(Error::Gap {
            offset: at,
            length: end - at,
        })
    }

    /// Collapse every entry's buffer into a single contiguous fragment.
    pub fn rebuild_buffers(&mut self) {
        for buf in self.entries.values_mut() {
            buf.rebuild_contiguous();
        }
    }

    /// Iterate `(offset, length, buffer)` in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &BufferList)> {
        self.entries
            .iter()
            .map(|(&off, buf)| (off, buf.len(), buf))
    }
}

impl fmt::Debug for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (off, len, _)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{off}~{len}")?;
        }
        write!(f, "}}")
    }
}

// =============================================================================
// Tests
// =============================================================================
