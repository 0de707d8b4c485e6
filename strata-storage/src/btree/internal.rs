use crate::block::{BlockID, BlockKind};
use crate::btree::key::BTreeKey;
use crate::btree::node::{read_count, write_header, NodeLimits, NODE_HEADER_SIZE};
use crate::btree::value::slice;
use crate::error::{Error, Result};
use std::cmp::Ordering;

const CHILD_SIZE: usize = 8;

/// Size of one encoded separator with its right child.
#[inline]
pub const fn internal_entry_size(key_len: usize) -> usize {
    1 + key_len + CHILD_SIZE
}

/// Decoded internal node.
///
/// Child `i` holds keys in `(keys[i-1], keys[i]]`, so a key equal to a
/// separator belongs to the left side.
///
/// Layout after header:
///
/// ┌───────────────┬──────────────────────────────┬─────┐
/// │ first child(8)│ key len(1) │ key │ child(8) │ ... │
/// └───────────────┴──────────────────────────────┴─────┘
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    keys: Vec<BTreeKey>,
    children: Vec<BlockID>,
}

impl InternalNode {
    /// Returns an empty node, which is only valid as a freshly
    /// allocated root before its first separator is inserted.
    #[inline]
    pub fn new() -> Self {
        InternalNode::default()
    }

    pub fn decode(view: &[u8]) -> Result<Self> {
        if BlockKind::of(view) != Some(BlockKind::Internal) {
            return Err(Error::InvalidFormat);
        }
        let count = read_count(view)?;
        if count == 0 {
            return Err(Error::InvalidFormat);
        }
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        let mut off = NODE_HEADER_SIZE;
        children.push(u64::from_le_bytes(slice(view, off, CHILD_SIZE)?.try_into()?));
        off += CHILD_SIZE;
        for _ in 0..count {
            let klen = *view.get(off).ok_or(Error::InvalidFormat)? as usize;
            keys.push(BTreeKey::new(slice(view, off + 1, klen)?)?);
            off += 1 + klen;
            children.push(u64::from_le_bytes(slice(view, off, CHILD_SIZE)?.try_into()?));
            off += CHILD_SIZE;
        }
        Ok(InternalNode { keys, children })
    }

    pub fn encode(&self, view: &mut [u8]) {
        assert!(
            !self.keys.is_empty() && self.children.len() == self.keys.len() + 1,
            "malformed internal node: keys={}, children={}",
            self.keys.len(),
            self.children.len()
        );
        assert!(
            NODE_HEADER_SIZE + self.used() <= view.len(),
            "internal node overflow: used={}, block={}",
            self.used(),
            view.len()
        );
        view.fill(0);
        write_header(view, BlockKind::Internal, self.keys.len());
        let mut off = NODE_HEADER_SIZE;
        view[off..off + CHILD_SIZE].copy_from_slice(&self.children[0].to_le_bytes());
        off += CHILD_SIZE;
        for (key, child) in self.keys.iter().zip(&self.children[1..]) {
            view[off] = key.len() as u8;
            view[off + 1..off + 1 + key.len()].copy_from_slice(key);
            off += 1 + key.len();
            view[off..off + CHILD_SIZE].copy_from_slice(&child.to_le_bytes());
            off += CHILD_SIZE;
        }
    }

    #[inline]
    pub fn keys(&self) -> &[BTreeKey] {
        &self.keys
    }

    #[inline]
    pub fn children(&self) -> &[BlockID] {
        &self.children
    }

    #[inline]
    pub fn used(&self) -> usize {
        CHILD_SIZE
            + self
                .keys
                .iter()
                .map(|k| internal_entry_size(k.len()))
                .sum::<usize>()
    }

    /// Node with one separator and two children.
    #[inline]
    pub fn is_singleton(&self) -> bool {
        self.keys.len() == 1
    }

    /// Internal nodes split when they could not take one more separator
    /// of the largest key size.
    #[inline]
    pub fn is_full(&self, limits: &NodeLimits) -> bool {
        self.used() + limits.max_internal_entry() > limits.capacity()
    }

    #[inline]
    fn child_index(&self, key: &BTreeKey) -> usize {
        self.keys.partition_point(|sep| sep < key)
    }

    /// Returns child block that covers the key.
    #[inline]
    pub fn lookup(&self, key: &BTreeKey) -> BlockID {
        self.children[self.child_index(key)]
    }

    /// Returns an adjacent sibling of the child covering the key, together
    /// with the order of that child relative to the sibling and the index
    /// of the separator between them.
    ///
    /// The left neighbor is preferred.
    #[inline]
    pub fn sibling(&self, key: &BTreeKey) -> (BlockID, Ordering, usize) {
        let idx = self.child_index(key);
        if idx > 0 {
            (self.children[idx - 1], Ordering::Greater, idx - 1)
        } else {
            (self.children[1], Ordering::Less, 0)
        }
    }

    /// Insert separator of a split child, returns false if it does not fit.
    pub fn insert(
        &mut self,
        median: BTreeKey,
        left: BlockID,
        right: BlockID,
        limits: &NodeLimits,
    ) -> bool {
        if self.children.is_empty() {
            self.keys.push(median);
            self.children.push(left);
            self.children.push(right);
            return true;
        }
        if self.used() + internal_entry_size(median.len()) > limits.capacity() {
            return false;
        }
        match self.children.iter().position(|c| *c == left) {
            Some(idx) => {
                debug_assert!(idx == 0 || self.keys[idx - 1] < median);
                self.keys.insert(idx, median);
                self.children.insert(idx + 1, right);
                true
            }
            None => false,
        }
    }

    /// Remove separator at given index with the child on its right.
    #[inline]
    pub fn remove(&mut self, idx: usize) {
        self.keys.remove(idx);
        self.children.remove(idx + 1);
    }

    #[inline]
    pub fn update_key(&mut self, idx: usize, key: BTreeKey) {
        self.keys[idx] = key;
    }

    /// Move upper half by size into a new node, returns the new node
    /// and the separator promoted to the parent.
    pub fn split(&mut self) -> (InternalNode, BTreeKey) {
        assert!(self.keys.len() >= 3, "split internal node with {} keys", self.keys.len());
        let half = self.used() / 2;
        let mut acc = CHILD_SIZE;
        let mut mid = self.keys.len() / 2;
        for (idx, k) in self.keys.iter().enumerate() {
            acc += internal_entry_size(k.len());
            if acc >= half {
                mid = idx;
                break;
            }
        }
        let mid = mid.clamp(1, self.keys.len() - 2);
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let median = self.keys[mid];
        self.keys.truncate(mid);
        (
            InternalNode {
                keys: right_keys,
                children: right_children,
            },
            median,
        )
    }

    /// Fold the right node into this one, pulling down the separator.
    #[inline]
    pub fn merge(&mut self, sep: BTreeKey, right: InternalNode) {
        self.keys.push(sep);
        self.keys.extend(right.keys);
        self.children.extend(right.children);
    }

    /// Size after merging with a sibling through given separator.
    #[inline]
    pub fn merged_size(&self, sep: &BTreeKey, other: &InternalNode) -> usize {
        self.used() + other.used() + 1 + sep.len()
    }
}

/// Rotate separators through the parent so that the smaller node ends up
/// with at most half of the combined size.
/// Returns the new separator, or None if nothing moved.
pub fn level_internals(
    left: &mut InternalNode,
    right: &mut InternalNode,
    sep: &BTreeKey,
) -> Option<BTreeKey> {
    let target = left.merged_size(sep, right) / 2;
    let mut sep = *sep;
    let mut moved = false;
    match left.used().cmp(&right.used()) {
        Ordering::Less => {
            let mut used = left.used();
            while right.keys.len() > 1 {
                let size = internal_entry_size(sep.len());
                if used + size > target {
                    break;
                }
                used += size;
                left.keys.push(sep);
                left.children.push(right.children.remove(0));
                sep = right.keys.remove(0);
                moved = true;
            }
        }
        Ordering::Greater => {
            let mut used = right.used();
            while left.keys.len() > 1 {
                let size = internal_entry_size(sep.len());
                if used + size > target {
                    break;
                }
                used += size;
                right.keys.insert(0, sep);
                right.children.insert(0, left.children.pop()?);
                sep = left.keys.pop()?;
                moved = true;
            }
        }
        Ordering::Equal => (),
    }
    moved.then_some(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> BTreeKey {
        BTreeKey::new(k.as_bytes()).unwrap()
    }

    fn node(keys: &[&str], first_child: BlockID) -> InternalNode {
        InternalNode {
            keys: keys.iter().map(|k| key(k)).collect(),
            children: (first_child..first_child + keys.len() as u64 + 1).collect(),
        }
    }

    #[test]
    fn test_internal_lookup_and_sibling() {
        let n = node(&["c", "f", "k"], 10);
        assert_eq!(n.lookup(&key("a")), 10);
        // separator itself goes left.
        assert_eq!(n.lookup(&key("c")), 10);
        assert_eq!(n.lookup(&key("d")), 11);
        assert_eq!(n.lookup(&key("z")), 13);
        assert_eq!(n.sibling(&key("a")), (11, Ordering::Less, 0));
        assert_eq!(n.sibling(&key("g")), (11, Ordering::Greater, 1));
        assert_eq!(n.sibling(&key("z")), (12, Ordering::Greater, 2));
    }

    #[test]
    fn test_internal_insert_remove() {
        let limits = NodeLimits::new(512, 16);
        let mut n = InternalNode::new();
        assert!(n.insert(key("m"), 1, 2, &limits));
        assert!(n.is_singleton());
        assert!(n.insert(key("t"), 2, 3, &limits));
        assert!(n.insert(key("d"), 1, 4, &limits));
        assert_eq!(n.keys(), &[key("d"), key("m"), key("t")]);
        assert_eq!(n.children(), &[1, 4, 2, 3]);
        // unknown left child.
        assert!(!n.insert(key("x"), 99, 5, &limits));
        n.remove(1);
        assert_eq!(n.keys(), &[key("d"), key("t")]);
        assert_eq!(n.children(), &[1, 4, 3]);
        n.update_key(0, key("e"));
        assert_eq!(n.keys()[0], key("e"));

        let mut buf = vec![0u8; 512];
        n.encode(&mut buf);
        assert_eq!(InternalNode::decode(&buf).unwrap(), n);
    }

    #[test]
    fn test_internal_split() {
        let mut n = node(&["b", "d", "f", "h", "j", "l", "n"], 1);
        let (right, median) = n.split();
        assert_eq!(n.children().len(), n.keys().len() + 1);
        assert_eq!(right.children().len(), right.keys().len() + 1);
        assert!(n.keys().iter().all(|k| *k < median));
        assert!(right.keys().iter().all(|k| *k > median));
        assert_eq!(n.keys().len() + right.keys().len() + 1, 7);
        assert_eq!(n.children().len() + right.children().len(), 8);
    }

    #[test]
    fn test_internal_merge_and_level() {
        let mut left = node(&["b"], 1);
        let mut right = node(&["k", "m", "o", "q", "s"], 3);
        let sep = key("h");
        let new_sep = level_internals(&mut left, &mut right, &sep).unwrap();
        assert!(left.keys().len() > 1);
        assert!(left.keys().iter().all(|k| *k < new_sep));
        assert!(right.keys().iter().all(|k| *k > new_sep));
        assert_eq!(left.keys()[1], sep);
        assert_eq!(left.children().len() + right.children().len(), 8);

        let merged = left.merged_size(&new_sep, &right);
        left.merge(new_sep, right);
        assert_eq!(left.used(), merged);
        assert_eq!(left.keys().len(), 7);
        assert_eq!(left.children(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
