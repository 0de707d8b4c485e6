use crate::block::{is_data_block, LockIntent, Superblock, NULL_BLOCK_ID, SUPERBLOCK_ID};
use crate::btree::key::BTreeKey;
use crate::btree::node::Node;
use crate::btree::value::ValueData;
use crate::clock::Clock;
use crate::error::Result;
use crate::large::LargeValue;
use crate::trx::Transaction;

/// Value returned by a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetValue {
    pub data: Vec<u8>,
    pub cas: Option<u64>,
    pub exptime: Option<u32>,
}

/// Point lookup with shared lock coupling: the lock on a node is
/// released only after its child is locked. Expired entries are
/// reported as absent.
pub async fn get(
    txn: &Transaction<'_>,
    clock: &dyn Clock,
    key: &BTreeKey,
) -> Result<Option<GetValue>> {
    let mut lock = txn.acquire(SUPERBLOCK_ID, LockIntent::Read).await?;
    let mut id = Superblock::root(lock.read_view())?;
    if id == NULL_BLOCK_ID {
        return Ok(None);
    }
    loop {
        lock = txn.acquire(id, LockIntent::Read).await?;
        let leaf = match Node::decode(lock.read_view())? {
            Node::Internal(inode) => {
                id = inode.lookup(key);
                assert!(
                    is_data_block(id),
                    "invalid child {} of block {}",
                    id,
                    lock.block_id()
                );
                continue;
            }
            Node::Leaf(leaf) => leaf,
        };
        let Some(value) = leaf.lookup(key).map(|e| e.value) else {
            return Ok(None);
        };
        if value.expired(clock.now()) {
            return Ok(None);
        }
        let data = match value.data() {
            ValueData::Small(bytes) => bytes.to_vec(),
            ValueData::Large(lb_ref) => {
                let mut lv = LargeValue::unloaded(*lb_ref);
                lv.acquire(txn).await?;
                lv.data().to_vec()
            }
        };
        return Ok(Some(GetValue {
            data,
            cas: value.cas(),
            exptime: value.exptime(),
        }));
    }
}

/// Number of levels of the tree, found by descending the leftmost path.
pub async fn depth(txn: &Transaction<'_>) -> Result<usize> {
    let sb = txn.acquire(SUPERBLOCK_ID, LockIntent::Read).await?;
    let mut id = Superblock::root(sb.read_view())?;
    let mut depth = 0;
    while id != NULL_BLOCK_ID {
        let lock = txn.acquire(id, LockIntent::Read).await?;
        depth += 1;
        id = match Node::decode(lock.read_view())? {
            Node::Internal(inode) => inode.children()[0],
            Node::Leaf(_) => NULL_BLOCK_ID,
        };
    }
    drop(sb);
    Ok(depth)
}
