use crate::block::{is_data_block, BlockID, LockIntent, Superblock, NULL_BLOCK_ID, SUPERBLOCK_ID};
use crate::btree::key::BTreeKey;
use crate::btree::node::{Node, NodeLimits};
use crate::error::{Error, Result};
use crate::large::LargeValue;
use crate::trx::Transaction;

/// Shape of a verified tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, zero for a tree without root.
    pub depth: usize,
    pub leaves: usize,
    pub internals: usize,
    pub entries: usize,
    pub large_values: usize,
}

struct Pending {
    id: BlockID,
    level: usize,
    lower: Option<BTreeKey>,
    upper: Option<BTreeKey>,
}

macro_rules! violation {
    ($($arg:tt)*) => {
        return Err(Error::InvariantViolation(format!($($arg)*)))
    };
}

/// Walk the whole tree and check its invariants:
/// keys strictly ordered and within separator bounds, all leaves on the
/// same level, non-root nodes within fill bounds, large values readable.
///
/// The superblock stays read locked during the walk, so no mutation can
/// start meanwhile. A mutation that had already released the superblock
/// keeps running below it, so the result is exact only if none was in
/// flight when the walk began.
pub async fn verify(txn: &Transaction<'_>) -> Result<TreeStats> {
    let sb = txn.acquire(SUPERBLOCK_ID, LockIntent::Read).await?;
    let root = Superblock::root(sb.read_view())?;
    let mut stats = TreeStats::default();
    if root == NULL_BLOCK_ID {
        return Ok(stats);
    }
    let limits = NodeLimits::new(txn.block_size(), txn.limits().max_key_size);
    let mut stack = vec![Pending {
        id: root,
        level: 1,
        lower: None,
        upper: None,
    }];
    let mut leaf_level = None;
    while let Some(p) = stack.pop() {
        if !is_data_block(p.id) {
            violation!("invalid block id {}", p.id);
        }
        let node = {
            let lock = txn.acquire(p.id, LockIntent::Read).await?;
            Node::decode(lock.read_view())?
        };
        let is_root = p.id == root;
        if node.used() > limits.capacity() {
            violation!("block {} overflows: used={}", p.id, node.used());
        }
        let keys: Vec<BTreeKey> = match &node {
            Node::Leaf(leaf) => leaf.entries().iter().map(|e| e.key).collect(),
            Node::Internal(inode) => inode.keys().to_vec(),
        };
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            violation!("keys of block {} out of order", p.id);
        }
        if let (Some(lower), Some(first)) = (&p.lower, keys.first()) {
            if first <= lower {
                violation!("key {:?} of block {} below bound {:?}", first, p.id, lower);
            }
        }
        if let (Some(upper), Some(last)) = (&p.upper, keys.last()) {
            if last > upper {
                violation!("key {:?} of block {} above bound {:?}", last, p.id, upper);
            }
        }
        stats.depth = stats.depth.max(p.level);
        match node {
            Node::Leaf(leaf) => {
                if !is_root && leaf.used() < limits.min_fill() {
                    violation!("leaf {} underfull: used={}", p.id, leaf.used());
                }
                match leaf_level {
                    None => leaf_level = Some(p.level),
                    Some(level) if level != p.level => {
                        violation!("leaf {} on level {}, expected {}", p.id, p.level, level)
                    }
                    _ => (),
                }
                stats.leaves += 1;
                stats.entries += leaf.len();
                for e in leaf.entries() {
                    if let Some(lb_ref) = e.value.lb_ref() {
                        // loading checks chain length against the recorded size.
                        let mut lv = LargeValue::unloaded(lb_ref);
                        lv.acquire(txn).await?;
                        stats.large_values += 1;
                    }
                }
            }
            Node::Internal(inode) => {
                // a node may be one separator short after a merge below it.
                if !is_root && inode.used() + limits.max_internal_entry() < limits.min_fill() {
                    violation!("internal node {} underfull: used={}", p.id, inode.used());
                }
                stats.internals += 1;
                let keys = inode.keys();
                for (idx, child) in inode.children().iter().enumerate().rev() {
                    stack.push(Pending {
                        id: *child,
                        level: p.level + 1,
                        lower: if idx == 0 { p.lower } else { Some(keys[idx - 1]) },
                        upper: keys.get(idx).copied().or(p.upper),
                    });
                }
            }
        }
    }
    drop(sb);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockCache, MemDevice};
    use crate::btree::internal::InternalNode;
    use crate::btree::leaf::{LeafEntry, LeafNode};
    use crate::btree::value::BTreeValue;
    use crate::btree::{modify, TreeContext};
    use crate::clock::{CasGenerator, ManualClock, ReplTimestamp};
    use crate::metrics::DepthGauge;
    use crate::oper::{SetMode, SetOper};
    use crate::trx::{SizeLimits, TrxMode};
    use async_executor::LocalExecutor;

    const LIMITS: SizeLimits = SizeLimits {
        max_key_size: 16,
        max_inline_value_size: 32,
        max_value_size: 4096,
    };

    fn leaf(keys: &[&str]) -> LeafNode {
        let mut leaf = LeafNode::new();
        for k in keys {
            leaf.insert(
                LeafEntry {
                    key: BTreeKey::new(k.as_bytes()).unwrap(),
                    value: BTreeValue::small(&[b'x'; 32]).unwrap(),
                    ts: ReplTimestamp(0),
                },
                504,
            );
        }
        leaf
    }

    #[test]
    fn test_verify_detects_bad_separator() {
        smol::block_on(async {
            let cache = BlockCache::open(Box::new(MemDevice::new(512))).unwrap();
            {
                let txn = Transaction::begin(&cache, TrxMode::Read, LIMITS);
                assert_eq!(verify(&txn).await.unwrap(), TreeStats::default());
            }
            let limits = NodeLimits::new(512, 16);
            let txn = Transaction::begin(&cache, TrxMode::Write, LIMITS);
            let mut sb = txn.acquire(SUPERBLOCK_ID, LockIntent::Write).await.unwrap();
            let mut root = txn.allocate().await;
            let mut l = txn.allocate().await;
            let mut r = txn.allocate().await;
            leaf(&["a", "b", "c", "d", "e"]).encode(l.write_view());
            // "e" on the left is above the separator.
            leaf(&["f", "g", "h", "i", "j"]).encode(r.write_view());
            let mut inode = InternalNode::new();
            inode.insert(BTreeKey::new(b"d").unwrap(), l.block_id(), r.block_id(), &limits);
            inode.encode(root.write_view());
            Superblock::set_root(sb.write_view(), root.block_id());
            drop((sb, root, l, r));
            txn.commit().unwrap();

            let txn = Transaction::begin(&cache, TrxMode::Read, LIMITS);
            let res = verify(&txn).await;
            assert!(matches!(res, Err(Error::InvariantViolation(_))));
        })
    }

    async fn set(cache: &BlockCache, ctx: &TreeContext<'_>, key: &str) {
        let txn = Transaction::begin(cache, TrxMode::Write, LIMITS);
        let key = BTreeKey::new(key.as_bytes()).unwrap();
        let mut oper = SetOper::new(b"v", SetMode::Set);
        modify(&txn, ctx, &key, &mut oper).await.unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_verify_holds_back_new_mutations() {
        let cache = BlockCache::open(Box::new(MemDevice::new(512))).unwrap();
        let clock = ManualClock::new(1000);
        let cas = CasGenerator::new(&clock);
        let depth = DepthGauge::new();
        let ctx = TreeContext {
            clock: &clock,
            cas: &cas,
            depth: &depth,
        };
        let ex = LocalExecutor::new();
        smol::block_on(ex.run(async {
            for key in ["a", "b", "c"] {
                set(&cache, &ctx, key).await;
            }
            // a writer holding the root leaf stands in for a mutation that
            // is already past the superblock.
            let holder = Transaction::begin(&cache, TrxMode::Write, LIMITS);
            let root = {
                let sb = holder.acquire(SUPERBLOCK_ID, LockIntent::Read).await.unwrap();
                Superblock::root(sb.read_view()).unwrap()
            };
            let root_lock = holder.acquire(root, LockIntent::Write).await.unwrap();

            let verifying = ex.spawn(async {
                let txn = Transaction::begin(&cache, TrxMode::Read, LIMITS);
                verify(&txn).await.unwrap()
            });
            let writing = ex.spawn(set(&cache, &ctx, "d"));
            for _ in 0..16 {
                smol::future::yield_now().await;
            }
            // the walk waits below the superblock, the new mutation waits
            // for the superblock.
            assert!(!verifying.is_finished());
            assert!(!writing.is_finished());

            drop(root_lock);
            holder.commit().unwrap();
            let stats = verifying.await;
            assert_eq!(stats.entries, 3);
            writing.await;
            let txn = Transaction::begin(&cache, TrxMode::Read, LIMITS);
            assert_eq!(verify(&txn).await.unwrap().entries, 4);
        }));
    }
}
