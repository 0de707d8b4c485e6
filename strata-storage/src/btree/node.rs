//! Typed view over node blocks.
//!
//! A block is decoded into [`Node`] once, by the discriminant in its
//! header, and all fill predicates and structural changes work on the
//! typed value. The node is encoded back into the block after mutation.
//!
//! Header layout, shared by leaves and internal nodes:
//!
//! ┌────────────────────────────────────────────────┐
//! │ kind(1) │ padding(1) │ count(2) │ reserved(4)  │
//! └────────────────────────────────────────────────┘
use crate::block::BlockKind;
use crate::btree::internal::{internal_entry_size, level_internals, InternalNode};
use crate::btree::key::BTreeKey;
use crate::btree::leaf::{level_leaves, LeafNode};
use crate::btree::value::value_encoded_size;
use crate::error::{Error, Result};

pub const NODE_HEADER_SIZE: usize = 8;
const COUNT_OFFSET: usize = 2;

#[inline]
pub(crate) fn write_header(view: &mut [u8], kind: BlockKind, count: usize) {
    view[0] = kind as u8;
    view[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&(count as u16).to_le_bytes());
}

#[inline]
pub(crate) fn read_count(view: &[u8]) -> Result<usize> {
    let bytes = view
        .get(COUNT_OFFSET..COUNT_OFFSET + 2)
        .ok_or(Error::InvalidFormat)?;
    Ok(u16::from_le_bytes(bytes.try_into()?) as usize)
}

/// Size bounds of nodes in one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    capacity: usize,
    max_key_size: usize,
}

impl NodeLimits {
    #[inline]
    pub fn new(block_size: usize, max_key_size: usize) -> Self {
        NodeLimits {
            capacity: block_size - NODE_HEADER_SIZE,
            max_key_size,
        }
    }

    /// Bytes available for node content.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-root nodes must hold at least this many content bytes.
    #[inline]
    pub fn min_fill(&self) -> usize {
        self.capacity / 4
    }

    #[inline]
    pub fn max_internal_entry(&self) -> usize {
        internal_entry_size(self.max_key_size)
    }

    /// Largest leaf entry with given inline value bound.
    #[inline]
    pub fn max_leaf_entry(&self, max_inline_value_size: usize) -> usize {
        1 + self.max_key_size + 4 + value_encoded_size(max_inline_value_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// Classify the block by its header and decode it.
    #[inline]
    pub fn decode(view: &[u8]) -> Result<Node> {
        match BlockKind::of(view) {
            Some(BlockKind::Leaf) => LeafNode::decode(view).map(Node::Leaf),
            Some(BlockKind::Internal) => InternalNode::decode(view).map(Node::Internal),
            _ => Err(Error::InvalidFormat),
        }
    }

    #[inline]
    pub fn encode(&self, view: &mut [u8]) {
        match self {
            Node::Leaf(leaf) => leaf.encode(view),
            Node::Internal(inode) => inode.encode(view),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    #[inline]
    pub fn used(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.used(),
            Node::Internal(inode) => inode.used(),
        }
    }

    #[inline]
    pub fn is_underfull(&self, limits: &NodeLimits) -> bool {
        self.used() < limits.min_fill()
    }

    /// Returns whether this node and its sibling fit in one block.
    /// Merged internal nodes must still take one more separator.
    #[inline]
    pub fn is_mergeable(&self, sibling: &Node, sep: &BTreeKey, limits: &NodeLimits) -> bool {
        match (self, sibling) {
            (Node::Leaf(a), Node::Leaf(b)) => a.used() + b.used() <= limits.capacity(),
            (Node::Internal(a), Node::Internal(b)) => {
                a.merged_size(sep, b) + limits.max_internal_entry() <= limits.capacity()
            }
            _ => panic!("sibling nodes of different kinds"),
        }
    }

    /// Split the node, returns the new right node and the median key.
    #[inline]
    pub fn split(&mut self) -> (Node, BTreeKey) {
        match self {
            Node::Leaf(leaf) => {
                let (right, median) = leaf.split();
                (Node::Leaf(right), median)
            }
            Node::Internal(inode) => {
                let (right, median) = inode.split();
                (Node::Internal(right), median)
            }
        }
    }

    /// Fold the right sibling into this node.
    #[inline]
    pub fn merge(&mut self, sep: &BTreeKey, right: Node) {
        match (self, right) {
            (Node::Leaf(left), Node::Leaf(right)) => left.merge(right),
            (Node::Internal(left), Node::Internal(right)) => left.merge(*sep, right),
            _ => panic!("merge nodes of different kinds"),
        }
    }

    /// Redistribute entries with the right sibling.
    /// Returns the replacement of the separator if anything moved.
    #[inline]
    pub fn level(&mut self, right: &mut Node, sep: &BTreeKey) -> Option<BTreeKey> {
        match (self, right) {
            (Node::Leaf(left), Node::Leaf(right)) => level_leaves(left, right),
            (Node::Internal(left), Node::Internal(right)) => level_internals(left, right, sep),
            _ => panic!("level nodes of different kinds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::leaf::LeafEntry;
    use crate::btree::value::BTreeValue;
    use crate::clock::ReplTimestamp;

    #[test]
    fn test_node_classifier() {
        let limits = NodeLimits::new(512, 16);
        let mut buf = vec![0u8; 512];
        assert!(Node::decode(&buf).is_err());

        let mut leaf = LeafNode::new();
        leaf.insert(
            LeafEntry {
                key: BTreeKey::new(b"k").unwrap(),
                value: BTreeValue::small(b"v").unwrap(),
                ts: ReplTimestamp(1),
            },
            limits.capacity(),
        );
        leaf.encode(&mut buf);
        let node = Node::decode(&buf).unwrap();
        assert!(node.is_leaf());
        assert!(node.is_underfull(&limits));

        let mut inode = InternalNode::new();
        inode.insert(BTreeKey::new(b"k").unwrap(), 1, 2, &limits);
        inode.encode(&mut buf);
        let node = Node::decode(&buf).unwrap();
        assert!(!node.is_leaf());
        assert_eq!(node.used(), 8 + internal_entry_size(1));
    }

    #[test]
    fn test_node_limits() {
        let limits = NodeLimits::new(4096, 250);
        assert_eq!(limits.capacity(), 4088);
        assert_eq!(limits.min_fill(), 1022);
        assert_eq!(limits.max_internal_entry(), 259);
        assert_eq!(limits.max_leaf_entry(250), 1 + 250 + 4 + 264);
    }
}
