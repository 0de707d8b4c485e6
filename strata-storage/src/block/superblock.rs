use crate::block::{BlockID, BlockKind, NULL_BLOCK_ID};
use crate::error::{Error, Result};

const SUPERBLOCK_MAGIC: u32 = 0x5354_5342; // "STSB"
const MAGIC_OFFSET: usize = 4;
const BLOCK_SIZE_OFFSET: usize = 8;
const ROOT_OFFSET: usize = 16;

/// Root pointer record stored in block [`SUPERBLOCK_ID`](crate::block::SUPERBLOCK_ID).
///
/// Layout:
///
/// ┌──────────────────────┐
/// │ kind(1) + padding(3) │
/// ├──────────────────────┤
/// │ magic(4)             │
/// ├──────────────────────┤
/// │ block size(4)        │
/// ├──────────────────────┤
/// │ padding(4)           │
/// ├──────────────────────┤
/// │ root block id(8)     │
/// └──────────────────────┘
pub struct Superblock;

impl Superblock {
    /// Format an empty tree.
    #[inline]
    pub fn init(view: &mut [u8], block_size: usize) {
        view.fill(0);
        view[0] = BlockKind::Superblock as u8;
        view[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        view[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 4]
            .copy_from_slice(&(block_size as u32).to_le_bytes());
        Self::set_root(view, NULL_BLOCK_ID);
    }

    /// Check the record and the block size it was formatted with.
    #[inline]
    pub fn validate(view: &[u8], block_size: usize) -> Result<()> {
        if BlockKind::of(view) != Some(BlockKind::Superblock) {
            return Err(Error::InvalidFormat);
        }
        let magic = u32::from_le_bytes(view[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into()?);
        if magic != SUPERBLOCK_MAGIC {
            return Err(Error::InvalidFormat);
        }
        let bs = u32::from_le_bytes(view[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 4].try_into()?);
        if bs as usize != block_size {
            return Err(Error::ConfigMismatch);
        }
        Ok(())
    }

    /// Returns current root, or [`NULL_BLOCK_ID`] for an empty tree.
    #[inline]
    pub fn root(view: &[u8]) -> Result<BlockID> {
        if BlockKind::of(view) != Some(BlockKind::Superblock) {
            return Err(Error::InvalidFormat);
        }
        Ok(u64::from_le_bytes(
            view[ROOT_OFFSET..ROOT_OFFSET + 8].try_into()?,
        ))
    }

    #[inline]
    pub fn set_root(view: &mut [u8], root: BlockID) {
        view[ROOT_OFFSET..ROOT_OFFSET + 8].copy_from_slice(&root.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_root() {
        let mut buf = vec![0u8; 256];
        assert!(Superblock::root(&buf).is_err());
        Superblock::init(&mut buf, 256);
        Superblock::validate(&buf, 256).unwrap();
        assert!(matches!(
            Superblock::validate(&buf, 512),
            Err(Error::ConfigMismatch)
        ));
        assert_eq!(Superblock::root(&buf).unwrap(), NULL_BLOCK_ID);
        Superblock::set_root(&mut buf, 42);
        assert_eq!(Superblock::root(&buf).unwrap(), 42);
    }
}
