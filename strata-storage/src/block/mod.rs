//! Block layer backing B-tree slices.
//!
//! Blocks are fixed-size byte arrays identified by [`BlockID`]. The cache
//! keeps one latch per block, and every access to block bytes goes through
//! a [`BlockLock`] acquired inside a transaction.
pub(crate) mod cache;
mod device;
mod lock;
mod superblock;

pub use cache::BlockCache;
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use lock::{BlockLock, LockIntent};
pub use superblock::Superblock;

pub type BlockID = u64;

/// Block holding the root pointer of the tree.
pub const SUPERBLOCK_ID: BlockID = 0;
/// Null child/root pointer.
pub const NULL_BLOCK_ID: BlockID = !0;

pub const MIN_BLOCK_SIZE: usize = 256;
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Discriminant stored in the first byte of every block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Zeroed block, either never written or deleted.
    Free = 0,
    Superblock = 1,
    Leaf = 2,
    Internal = 3,
    Large = 4,
}

impl BlockKind {
    #[inline]
    pub fn of(view: &[u8]) -> Option<BlockKind> {
        let kind = match view.first().copied()? {
            0 => BlockKind::Free,
            1 => BlockKind::Superblock,
            2 => BlockKind::Leaf,
            3 => BlockKind::Internal,
            4 => BlockKind::Large,
            _ => return None,
        };
        Some(kind)
    }
}

/// Returns whether the block id names a regular node or large value block.
#[inline]
pub fn is_data_block(id: BlockID) -> bool {
    id != SUPERBLOCK_ID && id != NULL_BLOCK_ID
}
