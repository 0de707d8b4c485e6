//! Out-of-line storage of values too long to live inside a leaf.
//!
//! A large value is a singly linked chain of blocks. Every block but the
//! last one is completely filled, so appending only touches the tail.
//!
//! Block layout:
//!
//! ┌────────────────────────────────┐
//! │ kind(1) + padding(1)           │
//! ├────────────────────────────────┤
//! │ data length(2) + padding(4)    │
//! ├────────────────────────────────┤
//! │ next block id(8)               │
//! ├────────────────────────────────┤
//! │ data                           │
//! └────────────────────────────────┘
use crate::block::{BlockID, BlockKind, LockIntent, NULL_BLOCK_ID};
use crate::error::{Error, Result};
use crate::trx::Transaction;

pub const LARGE_HEADER_SIZE: usize = 16;
const LEN_OFFSET: usize = 2;
const NEXT_OFFSET: usize = 8;

/// Reference stored in a leaf entry. The root block identifies the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeRef {
    pub root: BlockID,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeValueState {
    NotLoaded,
    Loaded,
    Deleted,
}

/// Handle of a large value object.
///
/// The handle holds no block locks between calls. Data is copied out of
/// the chain by [`acquire`](LargeValue::acquire).
pub struct LargeValue {
    lb_ref: LargeRef,
    state: LargeValueState,
    blocks: Vec<BlockID>,
    data: Vec<u8>,
}

impl LargeValue {
    /// Returns a handle of an existing object, nothing is read yet.
    #[inline]
    pub fn unloaded(lb_ref: LargeRef) -> Self {
        LargeValue {
            lb_ref,
            state: LargeValueState::NotLoaded,
            blocks: vec![],
            data: vec![],
        }
    }

    /// Create a new object holding given data.
    pub async fn create(txn: &Transaction<'_>, data: &[u8]) -> Result<Self> {
        let payload = payload_size(txn.block_size());
        let mut lock = txn.allocate().await;
        let root = lock.block_id();
        let mut blocks = vec![root];
        let mut chunks = data.chunks(payload).peekable();
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let next = if chunks.peek().is_some() {
                Some(txn.allocate().await)
            } else {
                None
            };
            let next_id = next.as_ref().map_or(NULL_BLOCK_ID, |l| l.block_id());
            init_block(lock.write_view(), chunk, next_id);
            match next {
                Some(next) => {
                    blocks.push(next.block_id());
                    lock = next;
                }
                None => break,
            }
        }
        Ok(LargeValue {
            lb_ref: LargeRef {
                root,
                size: data.len() as u64,
            },
            state: LargeValueState::Loaded,
            blocks,
            data: data.to_vec(),
        })
    }

    #[inline]
    pub fn root_ref(&self) -> LargeRef {
        self.lb_ref
    }

    #[inline]
    pub fn state(&self) -> LargeValueState {
        self.state
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.lb_ref.size as usize
    }

    /// Returns loaded data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        assert_eq!(self.state, LargeValueState::Loaded, "large value not loaded");
        &self.data
    }

    /// Load the whole chain. Loading twice is a no-op.
    pub async fn acquire(&mut self, txn: &Transaction<'_>) -> Result<()> {
        match self.state {
            LargeValueState::Loaded => return Ok(()),
            LargeValueState::Deleted => panic!("acquire deleted large value {}", self.lb_ref.root),
            LargeValueState::NotLoaded => (),
        }
        let mut data = Vec::with_capacity(self.size());
        let mut blocks = vec![];
        let mut id = self.lb_ref.root;
        while id != NULL_BLOCK_ID {
            let lock = txn.acquire(id, LockIntent::Read).await?;
            let (chunk, next) = read_block(lock.read_view())?;
            data.extend_from_slice(chunk);
            blocks.push(id);
            id = next;
        }
        if data.len() != self.size() {
            return Err(Error::InvalidFormat);
        }
        self.data = data;
        self.blocks = blocks;
        self.state = LargeValueState::Loaded;
        Ok(())
    }

    /// Append data at the end. The object keeps its root block.
    pub async fn append(&mut self, txn: &Transaction<'_>, extra: &[u8]) -> Result<()> {
        assert_eq!(self.state, LargeValueState::Loaded, "append to unloaded large value");
        let payload = payload_size(txn.block_size());
        let tail = self.blocks[self.blocks.len() - 1];
        let mut lock = txn.acquire(tail, LockIntent::Write).await?;
        let used = self.data.len() - (self.blocks.len() - 1) * payload;
        let (head, mut rest) = extra.split_at((payload - used).min(extra.len()));
        {
            let view = lock.write_view();
            let start = LARGE_HEADER_SIZE + used;
            view[start..start + head.len()].copy_from_slice(head);
            set_len(view, used + head.len());
        }
        while !rest.is_empty() {
            let mut next = txn.allocate().await;
            let n = rest.len().min(payload);
            init_block(next.write_view(), &rest[..n], NULL_BLOCK_ID);
            set_next(lock.write_view(), next.block_id());
            self.blocks.push(next.block_id());
            rest = &rest[n..];
            lock = next;
        }
        self.data.extend_from_slice(extra);
        self.lb_ref.size = self.data.len() as u64;
        Ok(())
    }

    /// Delete every block of the chain.
    pub async fn mark_deleted(&mut self, txn: &Transaction<'_>) -> Result<()> {
        assert_ne!(
            self.state,
            LargeValueState::Deleted,
            "large value {} deleted twice",
            self.lb_ref.root
        );
        let mut id = self.lb_ref.root;
        while id != NULL_BLOCK_ID {
            let mut lock = txn.acquire(id, LockIntent::Write).await?;
            let (_, next) = read_block(lock.read_view())?;
            lock.mark_deleted();
            id = next;
        }
        log::trace!("large value deleted: root={}", self.lb_ref.root);
        self.state = LargeValueState::Deleted;
        self.blocks.clear();
        self.data.clear();
        Ok(())
    }
}

#[inline]
fn payload_size(block_size: usize) -> usize {
    block_size - LARGE_HEADER_SIZE
}

#[inline]
fn init_block(view: &mut [u8], chunk: &[u8], next: BlockID) {
    view.fill(0);
    view[0] = BlockKind::Large as u8;
    set_len(view, chunk.len());
    set_next(view, next);
    view[LARGE_HEADER_SIZE..LARGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
}

#[inline]
fn set_len(view: &mut [u8], len: usize) {
    view[LEN_OFFSET..LEN_OFFSET + 2].copy_from_slice(&(len as u16).to_le_bytes());
}

#[inline]
fn set_next(view: &mut [u8], next: BlockID) {
    view[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&next.to_le_bytes());
}

#[inline]
fn read_block(view: &[u8]) -> Result<(&[u8], BlockID)> {
    if BlockKind::of(view) != Some(BlockKind::Large) {
        return Err(Error::InvalidFormat);
    }
    let len = u16::from_le_bytes(view[LEN_OFFSET..LEN_OFFSET + 2].try_into()?) as usize;
    let next = u64::from_le_bytes(view[NEXT_OFFSET..NEXT_OFFSET + 8].try_into()?);
    let data = view
        .get(LARGE_HEADER_SIZE..LARGE_HEADER_SIZE + len)
        .ok_or(Error::InvalidFormat)?;
    Ok((data, next))
}
