//! Transaction scope of a single tree operation.
//!
//! A transaction collects the final image of every block written under it
//! and the ids of blocks deleted under it. Nothing reaches the device until
//! commit, which happens either explicitly or when the scope is dropped
//! normally. Dropping the scope while unwinding from a panic aborts instead:
//! the collected images are discarded and the device keeps the last
//! committed tree.
use crate::block::cache::FrameData;
use crate::block::{BlockCache, BlockID, BlockLock, LockIntent};
use crate::error::Result;
use crate::large::LargeValue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxMode {
    Read,
    Write,
}

/// Limits on keys and values accepted by the slice that runs the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    pub max_key_size: usize,
    /// Values longer than this are stored out of line.
    pub max_inline_value_size: usize,
    /// Upper bound of any value, inline or large.
    pub max_value_size: usize,
}

#[derive(Default)]
struct TrxState {
    images: BTreeMap<BlockID, FrameData>,
    deleted: BTreeSet<BlockID>,
}

pub struct Transaction<'c> {
    cache: &'c BlockCache,
    mode: TrxMode,
    limits: SizeLimits,
    state: Mutex<TrxState>,
    finished: bool,
}

impl<'c> Transaction<'c> {
    #[inline]
    pub fn begin(cache: &'c BlockCache, mode: TrxMode, limits: SizeLimits) -> Self {
        Transaction {
            cache,
            mode,
            limits,
            state: Mutex::new(TrxState::default()),
            finished: false,
        }
    }

    #[inline]
    pub fn mode(&self) -> TrxMode {
        self.mode
    }

    #[inline]
    pub fn limits(&self) -> &SizeLimits {
        &self.limits
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Acquire lock on an existing block.
    /// Waits asynchronously if the block is latched in a conflicting mode.
    #[inline]
    pub async fn acquire(&self, id: BlockID, intent: LockIntent) -> Result<BlockLock<'_>> {
        let frame = self.cache.frame(id)?;
        let lock = match intent {
            LockIntent::Read => BlockLock::read(id, frame.read_arc().await),
            LockIntent::Write => {
                assert!(
                    self.mode == TrxMode::Write,
                    "write lock in read-only transaction"
                );
                BlockLock::write(id, frame.write_arc().await, self, false)
            }
        };
        Ok(lock)
    }

    /// Allocate a new zeroed block, locked for writing.
    #[inline]
    pub async fn allocate(&self) -> BlockLock<'_> {
        assert!(
            self.mode == TrxMode::Write,
            "allocate in read-only transaction"
        );
        let (id, frame) = self.cache.new_frame();
        let guard = match frame.try_write_arc() {
            Some(guard) => guard,
            None => frame.write_arc().await,
        };
        // new block must reach the device even if caller never writes it.
        BlockLock::write(id, guard, self, true)
    }

    /// Create a large value object owned by this transaction's writes.
    #[inline]
    pub async fn create_large_value(&self, data: &[u8]) -> Result<LargeValue> {
        LargeValue::create(self, data).await
    }

    #[inline]
    pub(crate) fn record_image(&self, id: BlockID, data: &[u8]) {
        let mut state = self.state.lock();
        if state.deleted.contains(&id) {
            return;
        }
        state.images.insert(id, data.to_vec().into_boxed_slice());
    }

    #[inline]
    pub(crate) fn record_deleted(&self, id: BlockID) {
        let mut state = self.state.lock();
        state.images.remove(&id);
        state.deleted.insert(id);
    }

    /// Commit all writes of this transaction.
    #[inline]
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.write_back()
    }

    /// Discard all writes of this transaction.
    #[inline]
    pub fn abort(mut self) {
        self.finished = true;
        self.discard();
    }

    #[inline]
    fn write_back(&mut self) -> Result<()> {
        let state = std::mem::take(&mut *self.state.lock());
        if state.images.is_empty() && state.deleted.is_empty() {
            return Ok(());
        }
        log::trace!(
            "commit transaction: written={}, deleted={}",
            state.images.len(),
            state.deleted.len()
        );
        self.cache.write_back(&state.images, &state.deleted)
    }

    #[inline]
    fn discard(&mut self) {
        let state = std::mem::take(&mut *self.state.lock());
        if !state.images.is_empty() || !state.deleted.is_empty() {
            log::warn!(
                "abort transaction: discard written={}, deleted={}",
                state.images.len(),
                state.deleted.len()
            );
        }
    }
}

impl Drop for Transaction<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if thread::panicking() {
            self.discard();
            return;
        }
        if let Err(e) = self.write_back() {
            log::error!("commit transaction on scope exit failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{MemDevice, SUPERBLOCK_ID};

    const LIMITS: SizeLimits = SizeLimits {
        max_key_size: 16,
        max_inline_value_size: 32,
        max_value_size: 4096,
    };

    #[test]
    fn test_trx_commit_on_scope_exit() {
        smol::block_on(async {
            let cache = BlockCache::open(Box::new(MemDevice::new(256))).unwrap();
            let id = {
                let txn = Transaction::begin(&cache, TrxMode::Write, LIMITS);
                let mut lock = txn.allocate().await;
                lock.write_view()[0] = crate::block::BlockKind::Leaf as u8;
                lock.block_id()
            };
            assert_eq!(id, 1);
            let txn = Transaction::begin(&cache, TrxMode::Read, LIMITS);
            let lock = txn.acquire(id, LockIntent::Read).await.unwrap();
            assert_eq!(lock.read_view()[0], crate::block::BlockKind::Leaf as u8);
        })
    }

    #[test]
    fn test_trx_deleted_block_is_reused() {
        smol::block_on(async {
            let cache = BlockCache::open(Box::new(MemDevice::new(256))).unwrap();
            let txn = Transaction::begin(&cache, TrxMode::Write, LIMITS);
            let (a, b) = {
                let mut a = txn.allocate().await;
                let mut b = txn.allocate().await;
                a.write_view()[0] = crate::block::BlockKind::Leaf as u8;
                b.mark_deleted();
                (a.block_id(), b.block_id())
            };
            // not reusable before commit.
            assert_eq!(cache.free_blocks(), 0);
            txn.commit().unwrap();
            assert_eq!(cache.free_blocks(), 1);
            let txn = Transaction::begin(&cache, TrxMode::Write, LIMITS);
            let c = txn.allocate().await;
            assert_ne!(c.block_id(), a);
            assert_eq!(c.block_id(), b);
        })
    }

    #[test]
    fn test_trx_swap_locks() {
        smol::block_on(async {
            let cache = BlockCache::open(Box::new(MemDevice::new(256))).unwrap();
            let txn = Transaction::begin(&cache, TrxMode::Write, LIMITS);
            let mut sb = txn.acquire(SUPERBLOCK_ID, LockIntent::Write).await.unwrap();
            let mut other = BlockLock::empty();
            assert!(!other.is_acquired());
            std::mem::swap(&mut sb, &mut other);
            assert!(!sb.is_acquired());
            assert_eq!(other.block_id(), SUPERBLOCK_ID);
            other.release();
            other.release();
            assert!(!other.is_acquired());
        })
    }
}
