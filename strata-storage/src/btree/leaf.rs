use crate::block::BlockKind;
use crate::btree::key::BTreeKey;
use crate::btree::node::{write_header, read_count, NODE_HEADER_SIZE};
use crate::btree::value::{slice, BTreeValue};
use crate::clock::ReplTimestamp;
use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Size of one encoded leaf entry.
#[inline]
pub fn leaf_entry_size(key: &[u8], value: &BTreeValue) -> usize {
    1 + key.len() + 4 + value.encoded_len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: BTreeKey,
    pub value: BTreeValue,
    pub ts: ReplTimestamp,
}

impl LeafEntry {
    #[inline]
    pub fn encoded_len(&self) -> usize {
        leaf_entry_size(&self.key, &self.value)
    }
}

/// Decoded leaf node.
///
/// Entry layout:
///
/// ┌──────────────────────────────────────────────┐
/// │ key len(1) │ key │ timestamp(4) │ value      │
/// └──────────────────────────────────────────────┘
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    entries: Vec<LeafEntry>,
}

impl LeafNode {
    #[inline]
    pub fn new() -> Self {
        LeafNode::default()
    }

    pub fn decode(view: &[u8]) -> Result<Self> {
        if BlockKind::of(view) != Some(BlockKind::Leaf) {
            return Err(Error::InvalidFormat);
        }
        let count = read_count(view)?;
        let mut entries = Vec::with_capacity(count);
        let mut off = NODE_HEADER_SIZE;
        for _ in 0..count {
            let klen = *view.get(off).ok_or(Error::InvalidFormat)? as usize;
            let key = BTreeKey::new(slice(view, off + 1, klen)?)?;
            off += 1 + klen;
            let ts = u32::from_le_bytes(slice(view, off, 4)?.try_into()?);
            off += 4;
            let (value, n) = BTreeValue::decode(&view[off..])?;
            off += n;
            entries.push(LeafEntry {
                key,
                value,
                ts: ReplTimestamp(ts),
            });
        }
        Ok(LeafNode { entries })
    }

    /// Encode into block bytes. Bytes after the last entry are zeroed.
    pub fn encode(&self, view: &mut [u8]) {
        assert!(
            NODE_HEADER_SIZE + self.used() <= view.len(),
            "leaf overflow: used={}, block={}",
            self.used(),
            view.len()
        );
        view.fill(0);
        write_header(view, BlockKind::Leaf, self.entries.len());
        let mut off = NODE_HEADER_SIZE;
        for e in &self.entries {
            view[off] = e.key.len() as u8;
            view[off + 1..off + 1 + e.key.len()].copy_from_slice(&e.key);
            off += 1 + e.key.len();
            view[off..off + 4].copy_from_slice(&e.ts.0.to_le_bytes());
            off += 4;
            off += e.value.encode(&mut view[off..]);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[LeafEntry] {
        &self.entries
    }

    /// Bytes occupied by entries.
    #[inline]
    pub fn used(&self) -> usize {
        self.entries.iter().map(|e| e.encoded_len()).sum()
    }

    #[inline]
    pub fn max_key(&self) -> Option<&BTreeKey> {
        self.entries.last().map(|e| &e.key)
    }

    #[inline]
    fn search(&self, key: &BTreeKey) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    #[inline]
    pub fn lookup(&self, key: &BTreeKey) -> Option<&LeafEntry> {
        self.search(key).ok().map(|idx| &self.entries[idx])
    }

    /// Returns whether inserting given pair could overflow the node.
    /// An existing entry with the same key is not taken into account.
    #[inline]
    pub fn is_full(&self, key: &BTreeKey, value: &BTreeValue, capacity: usize) -> bool {
        self.used() + leaf_entry_size(key, value) > capacity
    }

    /// Insert or replace an entry, returns false if it does not fit.
    pub fn insert(&mut self, entry: LeafEntry, capacity: usize) -> bool {
        match self.search(&entry.key) {
            Ok(idx) => {
                let used = self.used() - self.entries[idx].encoded_len() + entry.encoded_len();
                if used > capacity {
                    return false;
                }
                self.entries[idx] = entry;
            }
            Err(idx) => {
                if self.used() + entry.encoded_len() > capacity {
                    return false;
                }
                self.entries.insert(idx, entry);
            }
        }
        true
    }

    #[inline]
    pub fn remove(&mut self, key: &BTreeKey) -> Option<LeafEntry> {
        self.search(key).ok().map(|idx| self.entries.remove(idx))
    }

    /// Move upper half of entries by size into a new node.
    /// Returns the new right node and the median key, which is the
    /// largest key remaining in this node.
    pub fn split(&mut self) -> (LeafNode, BTreeKey) {
        assert!(self.entries.len() >= 2, "split leaf with {} entries", self.len());
        let half = self.used() / 2;
        let mut acc = 0;
        let mut mid = self.entries.len() - 1;
        for (idx, e) in self.entries.iter().enumerate() {
            acc += e.encoded_len();
            if acc >= half {
                mid = idx + 1;
                break;
            }
        }
        let mid = mid.clamp(1, self.entries.len() - 1);
        let right = LeafNode {
            entries: self.entries.split_off(mid),
        };
        let median = self.entries[mid - 1].key;
        (right, median)
    }

    /// Fold all entries of the right node into this one.
    #[inline]
    pub fn merge(&mut self, right: LeafNode) {
        debug_assert!(match (self.max_key(), right.entries.first()) {
            (Some(l), Some(r)) => l < &r.key,
            _ => true,
        });
        self.entries.extend(right.entries);
    }
}

/// Move entries between two adjacent leaves so that the smaller one
/// ends up with at most half of their combined size.
/// Returns the new separator, or None if nothing moved.
pub fn level_leaves(left: &mut LeafNode, right: &mut LeafNode) -> Option<BTreeKey> {
    let target = (left.used() + right.used()) / 2;
    let mut moved = false;
    match left.used().cmp(&right.used()) {
        Ordering::Less => {
            let mut used = left.used();
            while right.entries.len() > 1 {
                let size = right.entries[0].encoded_len();
                if used + size > target {
                    break;
                }
                used += size;
                left.entries.push(right.entries.remove(0));
                moved = true;
            }
        }
        Ordering::Greater => {
            let mut used = right.used();
            while left.entries.len() > 1 {
                let size = left.entries[left.entries.len() - 1].encoded_len();
                if used + size > target {
                    break;
                }
                used += size;
                let e = left.entries.pop()?;
                right.entries.insert(0, e);
                moved = true;
            }
        }
        Ordering::Equal => (),
    }
    if moved {
        left.max_key().copied()
    } else {
        None
    }
}
