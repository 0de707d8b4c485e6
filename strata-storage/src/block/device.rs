use crate::block::BlockID;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Persistent storage of fixed-size blocks.
pub trait BlockDevice: Send + Sync {
    /// Size of each block in bytes.
    fn block_size(&self) -> usize;

    /// Number of block slots on the device, i.e. highest written id plus one.
    fn num_blocks(&self) -> u64;

    /// Read block into given buffer.
    /// Returns false if the block was never written, in which case
    /// the buffer is zeroed.
    fn read_block(&self, id: BlockID, buf: &mut [u8]) -> Result<bool>;

    /// Write block from given buffer.
    fn write_block(&self, id: BlockID, buf: &[u8]) -> Result<()>;

    /// Make all previous writes durable.
    fn sync(&self) -> Result<()>;
}

/// Device keeping blocks in memory.
pub struct MemDevice {
    block_size: usize,
    blocks: Mutex<HashMap<BlockID, Box<[u8]>>>,
}

impl MemDevice {
    #[inline]
    pub fn new(block_size: usize) -> Self {
        MemDevice {
            block_size,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemDevice {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn num_blocks(&self) -> u64 {
        let blocks = self.blocks.lock();
        blocks.keys().max().map(|id| id + 1).unwrap_or(0)
    }

    #[inline]
    fn read_block(&self, id: BlockID, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), self.block_size);
        let blocks = self.blocks.lock();
        match blocks.get(&id) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(true)
            }
            None => {
                buf.fill(0);
                Ok(false)
            }
        }
    }

    #[inline]
    fn write_block(&self, id: BlockID, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        let mut blocks = self.blocks.lock();
        blocks.insert(id, buf.to_vec().into_boxed_slice());
        Ok(())
    }

    #[inline]
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Device storing blocks in a single file, block `i` at offset `i * block_size`.
pub struct FileDevice {
    file: File,
    block_size: usize,
    num_blocks: AtomicU64,
}

impl FileDevice {
    /// Open or create the data file.
    #[inline]
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        // A torn tail block is ignored, it was never committed.
        let num_blocks = len / block_size as u64;
        Ok(FileDevice {
            file,
            block_size,
            num_blocks: AtomicU64::new(num_blocks),
        })
    }
}

impl BlockDevice for FileDevice {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Acquire)
    }

    #[inline]
    fn read_block(&self, id: BlockID, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), self.block_size);
        if id >= self.num_blocks() {
            buf.fill(0);
            return Ok(false);
        }
        self.file
            .read_exact_at(buf, id * self.block_size as u64)?;
        Ok(true)
    }

    #[inline]
    fn write_block(&self, id: BlockID, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.file.write_all_at(buf, id * self.block_size as u64)?;
        self.num_blocks.fetch_max(id + 1, Ordering::AcqRel);
        Ok(())
    }

    #[inline]
    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
