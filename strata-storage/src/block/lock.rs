use crate::block::cache::FrameData;
use crate::block::BlockID;
use crate::trx::Transaction;
use async_lock::{RwLockReadGuardArc, RwLockWriteGuardArc};
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockIntent {
    Read,
    Write,
}

enum LockState<'a> {
    Released,
    Read(RwLockReadGuardArc<FrameData>),
    Write {
        guard: RwLockWriteGuardArc<FrameData>,
        txn: &'a Transaction<'a>,
        dirty: bool,
        deleted: bool,
    },
}

/// Lock on one block, acquired through a [`Transaction`].
///
/// The latch is held until [`release`](BlockLock::release) or drop, whichever
/// comes first. Releasing a written block hands a copy of its bytes to the
/// transaction, which persists that image at commit.
///
/// Two locks can be exchanged with [`std::mem::swap`], which is how the tree
/// walker moves its lock window.
pub struct BlockLock<'a> {
    id: BlockID,
    state: LockState<'a>,
}

impl<'a> BlockLock<'a> {
    /// Returns a lock that holds nothing.
    #[inline]
    pub fn empty() -> Self {
        BlockLock {
            id: crate::block::NULL_BLOCK_ID,
            state: LockState::Released,
        }
    }

    #[inline]
    pub(crate) fn read(id: BlockID, guard: RwLockReadGuardArc<FrameData>) -> Self {
        BlockLock {
            id,
            state: LockState::Read(guard),
        }
    }

    #[inline]
    pub(crate) fn write(
        id: BlockID,
        guard: RwLockWriteGuardArc<FrameData>,
        txn: &'a Transaction<'a>,
        dirty: bool,
    ) -> Self {
        BlockLock {
            id,
            state: LockState::Write {
                guard,
                txn,
                dirty,
                deleted: false,
            },
        }
    }

    #[inline]
    pub fn is_acquired(&self) -> bool {
        !matches!(self.state, LockState::Released)
    }

    #[inline]
    pub fn block_id(&self) -> BlockID {
        assert!(self.is_acquired(), "block id of released lock");
        self.id
    }

    /// Returns read-only view of block bytes.
    #[inline]
    pub fn read_view(&self) -> &[u8] {
        match &self.state {
            LockState::Released => panic!("read view of released lock"),
            LockState::Read(guard) => guard,
            LockState::Write { guard, .. } => guard,
        }
    }

    /// Returns mutable view of block bytes and marks the block dirty.
    #[inline]
    pub fn write_view(&mut self) -> &mut [u8] {
        match &mut self.state {
            LockState::Write {
                guard,
                dirty,
                deleted,
                ..
            } => {
                assert!(!*deleted, "write view of deleted block {}", self.id);
                *dirty = true;
                guard
            }
            _ => panic!("write view requires write lock on block {}", self.id),
        }
    }

    /// Mark the block deleted. Its bytes are zeroed and the id returns
    /// to the free list once the transaction commits.
    #[inline]
    pub fn mark_deleted(&mut self) {
        match &mut self.state {
            LockState::Write {
                guard,
                txn,
                dirty,
                deleted,
            } => {
                guard.fill(0);
                *dirty = false;
                *deleted = true;
                txn.record_deleted(self.id);
            }
            _ => panic!("mark deleted requires write lock on block {}", self.id),
        }
    }

    /// Release the latch. Calling it on a released lock is a no-op.
    #[inline]
    pub fn release(&mut self) {
        match mem::replace(&mut self.state, LockState::Released) {
            LockState::Released | LockState::Read(_) => (),
            LockState::Write {
                guard, txn, dirty, ..
            } => {
                if dirty {
                    txn.record_image(self.id, &guard);
                }
                drop(guard);
            }
        }
    }
}

impl Drop for BlockLock<'_> {
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}
