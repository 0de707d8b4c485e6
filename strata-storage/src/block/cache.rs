use crate::block::{BlockDevice, BlockID, BlockKind, Superblock, SUPERBLOCK_ID};
use crate::error::{Error, Result};
use async_lock::RwLock;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type FrameData = Box<[u8]>;

/// Latched in-memory copy of one block.
pub(crate) type Frame = Arc<RwLock<FrameData>>;

/// Block cache in front of a [`BlockDevice`].
///
/// Frames are loaded lazily and never evicted. Block ids are handed out
/// from the free list first, then from the end of the device.
pub struct BlockCache {
    device: Box<dyn BlockDevice>,
    block_size: usize,
    frames: Mutex<HashMap<BlockID, Frame>>,
    // ordered so that low ids are reused first.
    free_list: Mutex<BTreeSet<BlockID>>,
    next_id: AtomicU64,
}

impl BlockCache {
    /// Open cache on given device.
    ///
    /// A blank device is formatted with an empty superblock. Otherwise the
    /// superblock is validated and the free list is rebuilt by scanning for
    /// free blocks.
    pub fn open(device: Box<dyn BlockDevice>) -> Result<Self> {
        let block_size = device.block_size();
        let mut buf = vec![0u8; block_size];
        let formatted = device.read_block(SUPERBLOCK_ID, &mut buf)?;
        if formatted {
            Superblock::validate(&buf, block_size)?;
        } else {
            Superblock::init(&mut buf, block_size);
            device.write_block(SUPERBLOCK_ID, &buf)?;
            device.sync()?;
        }
        let num_blocks = device.num_blocks().max(1);
        let mut free_list = BTreeSet::new();
        for id in 1..num_blocks {
            device.read_block(id, &mut buf)?;
            match BlockKind::of(&buf) {
                Some(BlockKind::Free) => {
                    free_list.insert(id);
                }
                Some(_) => (),
                None => return Err(Error::InvalidFormat),
            }
        }
        log::debug!(
            "block cache opened: block_size={}, blocks={}, free={}",
            block_size,
            num_blocks,
            free_list.len()
        );
        Ok(BlockCache {
            device,
            block_size,
            frames: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            next_id: AtomicU64::new(num_blocks),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently available for reuse.
    #[inline]
    pub fn free_blocks(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns latched frame of the block, loading it from device on miss.
    #[inline]
    pub(crate) fn frame(&self, id: BlockID) -> Result<Frame> {
        assert!(
            id < self.next_id.load(Ordering::Acquire),
            "block id {} out of bound",
            id
        );
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&id) {
            return Ok(Arc::clone(frame));
        }
        let mut data = vec![0u8; self.block_size].into_boxed_slice();
        self.device.read_block(id, &mut data)?;
        let frame = Arc::new(RwLock::new(data));
        frames.insert(id, Arc::clone(&frame));
        Ok(frame)
    }

    /// Reserve a block id and install a zeroed frame for it.
    #[inline]
    pub(crate) fn new_frame(&self) -> (BlockID, Frame) {
        let id = {
            let mut free_list = self.free_list.lock();
            match free_list.pop_first() {
                Some(id) => id,
                None => self.next_id.fetch_add(1, Ordering::AcqRel),
            }
        };
        let frame = Arc::new(RwLock::new(vec![0u8; self.block_size].into_boxed_slice()));
        // A deleted block is unreachable from the tree, so nobody else
        // can hold its old frame.
        self.frames.lock().insert(id, Arc::clone(&frame));
        (id, frame)
    }

    /// Write committed block images and release deleted blocks.
    ///
    /// Node images are made durable before the superblock, and deleted
    /// blocks are zeroed only after the superblock, so the root on the
    /// device always refers to written nodes. A crash after the superblock
    /// write leaks the deleted blocks until they are freed again.
    pub(crate) fn write_back(
        &self,
        images: &BTreeMap<BlockID, FrameData>,
        deleted: &BTreeSet<BlockID>,
    ) -> Result<()> {
        for (id, data) in images.range(SUPERBLOCK_ID + 1..) {
            if !deleted.contains(id) {
                self.device.write_block(*id, data)?;
            }
        }
        if let Some(data) = images.get(&SUPERBLOCK_ID) {
            self.device.sync()?;
            self.device.write_block(SUPERBLOCK_ID, data)?;
        }
        if !deleted.is_empty() {
            self.device.sync()?;
            let zero = vec![0u8; self.block_size];
            for id in deleted {
                self.device.write_block(*id, &zero)?;
            }
        }
        self.device.sync()?;
        if !deleted.is_empty() {
            let mut free_list = self.free_list.lock();
            free_list.extend(deleted.iter().copied());
        }
        Ok(())
    }
}
