//! Single-key mutation of the tree.
//!
//! The walk takes the superblock and then write locks down the path to the
//! owning leaf, holding at most the superblock, a parent and the current
//! node at any time. Internal nodes are split before descending into them,
//! so a split below always finds room for its separator. Underfull nodes
//! are merged with or leveled against a sibling on the way down and once
//! more after the leaf changes.
use crate::block::{
    is_data_block, BlockKind, BlockLock, LockIntent, Superblock, NULL_BLOCK_ID, SUPERBLOCK_ID,
};
use crate::btree::internal::InternalNode;
use crate::btree::key::BTreeKey;
use crate::btree::leaf::{LeafEntry, LeafNode};
use crate::btree::node::{Node, NodeLimits};
use crate::btree::value::BTreeValue;
use crate::btree::TreeContext;
use crate::error::{Error, Result};
use crate::large::LargeValue;
use crate::oper::{ModifyOper, ModifyOutcome};
use crate::trx::Transaction;
use std::cmp::Ordering;
use std::mem;

/// Apply the mutation to the entry of given key.
///
/// Block writes become durable when the transaction commits.
pub async fn modify<O: ModifyOper>(
    txn: &Transaction<'_>,
    ctx: &TreeContext<'_>,
    key: &BTreeKey,
    oper: &mut O,
) -> Result<()> {
    assert!(
        key.len() <= txn.limits().max_key_size,
        "key of {} bytes exceeds limit",
        key.len()
    );
    let mut walk = TreeWalk::new(txn, ctx);
    walk.acquire_root().await?;
    loop {
        match BlockKind::of(walk.buf.read_view()) {
            Some(BlockKind::Internal) => (),
            Some(BlockKind::Leaf) => break,
            _ => return Err(Error::InvalidFormat),
        }
        walk.check_and_handle_split(key, None).await?;
        walk.check_and_handle_underfull(key).await?;
        // The root can only change while the current node is the root or
        // its direct child.
        if walk.sb.is_acquired() && walk.parent.is_acquired() {
            walk.sb.release();
        }
        let child = InternalNode::decode(walk.buf.read_view())?.lookup(key);
        assert!(
            is_data_block(child),
            "invalid child {} of block {}",
            child,
            walk.buf.block_id()
        );
        let child = txn.acquire(child, LockIntent::Write).await?;
        walk.parent = mem::replace(&mut walk.buf, child);
    }
    walk.modify_leaf(key, oper).await?;
    walk.sb.release();
    walk.buf.release();
    walk.parent.release();
    Ok(())
}

/// Lock window of one descent.
struct TreeWalk<'a> {
    txn: &'a Transaction<'a>,
    ctx: &'a TreeContext<'a>,
    limits: NodeLimits,
    sb: BlockLock<'a>,
    parent: BlockLock<'a>,
    buf: BlockLock<'a>,
}

impl<'a> TreeWalk<'a> {
    #[inline]
    fn new(txn: &'a Transaction<'a>, ctx: &'a TreeContext<'a>) -> Self {
        TreeWalk {
            txn,
            ctx,
            limits: NodeLimits::new(txn.block_size(), txn.limits().max_key_size),
            sb: BlockLock::empty(),
            parent: BlockLock::empty(),
            buf: BlockLock::empty(),
        }
    }

    /// Lock superblock and root, creating an empty leaf root if the
    /// tree has none.
    async fn acquire_root(&mut self) -> Result<()> {
        self.sb = self.txn.acquire(SUPERBLOCK_ID, LockIntent::Write).await?;
        let root = Superblock::root(self.sb.read_view())?;
        if root == NULL_BLOCK_ID {
            let mut buf = self.txn.allocate().await;
            LeafNode::new().encode(buf.write_view());
            Superblock::set_root(self.sb.write_view(), buf.block_id());
            self.ctx.depth.incr();
            log::debug!("root created: root={}", buf.block_id());
            self.buf = buf;
        } else {
            assert!(is_data_block(root), "invalid root {}", root);
            self.buf = self.txn.acquire(root, LockIntent::Write).await?;
        }
        Ok(())
    }

    /// Split the current node if it is full and insert the median into
    /// the parent. Leaves are checked against the value about to be
    /// inserted, internal nodes against the largest separator.
    ///
    /// Afterwards the current node is the half that covers the key.
    async fn check_and_handle_split(
        &mut self,
        key: &BTreeKey,
        new_value: Option<&BTreeValue>,
    ) -> Result<()> {
        let mut node = Node::decode(self.buf.read_view())?;
        let full = match (&node, new_value) {
            (Node::Leaf(leaf), Some(value)) => leaf.is_full(key, value, self.limits.capacity()),
            (Node::Internal(inode), None) => inode.is_full(&self.limits),
            (Node::Leaf(_), None) => panic!("split check of leaf without value"),
            (Node::Internal(_), Some(_)) => panic!("split check of internal node with value"),
        };
        if !full {
            return Ok(());
        }
        let (right, median) = node.split();
        let mut rbuf = self.txn.allocate().await;
        node.encode(self.buf.write_view());
        right.encode(rbuf.write_view());

        let mut parent = if self.parent.is_acquired() {
            InternalNode::decode(self.parent.read_view())?
        } else {
            assert!(
                self.sb.is_acquired(),
                "split of root {} without superblock",
                self.buf.block_id()
            );
            let new_root = self.txn.allocate().await;
            Superblock::set_root(self.sb.write_view(), new_root.block_id());
            self.ctx.depth.incr();
            log::debug!(
                "root split: old_root={}, new_root={}",
                self.buf.block_id(),
                new_root.block_id()
            );
            self.parent = new_root;
            InternalNode::new()
        };
        let inserted = parent.insert(median, self.buf.block_id(), rbuf.block_id(), &self.limits);
        assert!(
            inserted,
            "no room for separator in parent {}",
            self.parent.block_id()
        );
        parent.encode(self.parent.write_view());

        if *key > median {
            mem::swap(&mut self.buf, &mut rbuf);
        }
        Ok(())
    }

    /// Merge or level the current node with a sibling if it is underfull.
    /// The root is exempt.
    async fn check_and_handle_underfull(&mut self, key: &BTreeKey) -> Result<()> {
        if !self.parent.is_acquired() {
            return Ok(());
        }
        let node = Node::decode(self.buf.read_view())?;
        if !node.is_underfull(&self.limits) {
            return Ok(());
        }
        let mut parent = InternalNode::decode(self.parent.read_view())?;
        let (sib_id, order, sep_idx) = parent.sibling(key);
        let sep = parent.keys()[sep_idx];
        let mut sib_buf = self.txn.acquire(sib_id, LockIntent::Write).await?;
        let sibling = Node::decode(sib_buf.read_view())?;
        let node_is_left = match order {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => panic!("block {} is its own sibling", sib_id),
        };
        let (mut left, mut right) = if node_is_left {
            (node, sibling)
        } else {
            (sibling, node)
        };

        if left.is_mergeable(&right, &sep, &self.limits) {
            left.merge(&sep, right);
            if node_is_left {
                left.encode(self.buf.write_view());
                sib_buf.mark_deleted();
            } else {
                left.encode(sib_buf.write_view());
                self.buf.mark_deleted();
                mem::swap(&mut self.buf, &mut sib_buf);
            }
            if parent.is_singleton() {
                // the parent lost its last separator, the merged node
                // becomes the root.
                assert!(
                    self.sb.is_acquired(),
                    "collapse of parent {} without superblock",
                    self.parent.block_id()
                );
                log::debug!(
                    "root collapse: old_root={}, new_root={}",
                    self.parent.block_id(),
                    self.buf.block_id()
                );
                self.parent.mark_deleted();
                self.parent.release();
                Superblock::set_root(self.sb.write_view(), self.buf.block_id());
                self.ctx.depth.decr();
            } else {
                parent.remove(sep_idx);
                parent.encode(self.parent.write_view());
            }
        } else if let Some(new_sep) = left.level(&mut right, &sep) {
            let (lbuf, rbuf) = if node_is_left {
                (&mut self.buf, &mut sib_buf)
            } else {
                (&mut sib_buf, &mut self.buf)
            };
            left.encode(lbuf.write_view());
            right.encode(rbuf.write_view());
            parent.update_key(sep_idx, new_sep);
            parent.encode(self.parent.write_view());
        }
        Ok(())
    }

    /// Run the callback against the current leaf and apply its outcome.
    async fn modify_leaf<O: ModifyOper>(&mut self, key: &BTreeKey, oper: &mut O) -> Result<()> {
        let txn = self.txn;
        let now = self.ctx.clock.now();
        let old = LeafNode::decode(self.buf.read_view())?
            .lookup(key)
            .map(|e| e.value);
        let expired = old.is_some_and(|v| v.expired(now));
        let visible = if expired { None } else { old };
        let mut old_large = match visible.and_then(|v| v.lb_ref()) {
            Some(lb_ref) => {
                let mut lv = LargeValue::unloaded(lb_ref);
                oper.acquire_large_value(txn, &mut lv).await?;
                Some(lv)
            }
            None => None,
        };

        let mut outcome = oper.operate(txn, visible.as_ref(), &mut old_large).await?;
        if let ModifyOutcome::Put { value, large } = &outcome {
            match (value.lb_ref(), large) {
                (Some(lb_ref), Some(lv)) => assert_eq!(
                    lb_ref,
                    lv.root_ref(),
                    "large value does not match its handle"
                ),
                (None, None) => {
                    let len = value.size();
                    assert!(
                        len <= txn.limits().max_inline_value_size,
                        "inline value of {} bytes exceeds limit",
                        len
                    );
                }
                (Some(_), None) => panic!("large value without handle"),
                (None, Some(_)) => panic!("inline value with large value handle"),
            }
        }
        // expired key untouched by the callback is removed.
        if expired && matches!(outcome, ModifyOutcome::Unchanged) {
            outcome = ModifyOutcome::Delete;
        }

        let new_large = match outcome {
            ModifyOutcome::Unchanged => return Ok(()),
            ModifyOutcome::Put { mut value, large } => {
                self.check_and_handle_split(key, Some(&value)).await?;
                if value.has_cas() && !oper.cas_already_set() {
                    value.set_cas(self.ctx.cas.next());
                }
                let entry = LeafEntry {
                    key: *key,
                    value,
                    ts: self.ctx.clock.timestamp(),
                };
                let mut leaf = LeafNode::decode(self.buf.read_view())?;
                let inserted = leaf.insert(entry, self.limits.capacity());
                assert!(inserted, "no room in leaf {} after split", self.buf.block_id());
                leaf.encode(self.buf.write_view());
                large.map(|lv| lv.root_ref())
            }
            ModifyOutcome::Delete => {
                if old.is_some() {
                    let mut leaf = LeafNode::decode(self.buf.read_view())?;
                    leaf.remove(key);
                    leaf.encode(self.buf.write_view());
                }
                None
            }
        };
        self.check_and_handle_underfull(key).await?;

        // delete the old object unless the new value still refers to it.
        if let Some(old_ref) = old.and_then(|v| v.lb_ref()) {
            if new_large.map(|r| r.root) != Some(old_ref.root) {
                let mut lv = match old_large.take() {
                    Some(lv) if lv.root_ref().root == old_ref.root => lv,
                    _ => LargeValue::unloaded(old_ref),
                };
                lv.mark_deleted(txn).await?;
            }
        }
        Ok(())
    }
}
