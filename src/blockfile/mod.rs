//! Fixed-block-size file storage.
//!
//! A [`BlockFile`] divides a file into blocks of `block_size` bytes (a
//! positive multiple of 4096) addressed by their absolute byte offset. Block 0
//! is the control block; it carries a checksummed header and an opaque
//! userdata region for the layer above. Unused blocks are threaded into a
//! LIFO free list through their own first 8 bytes:
//!
//! ```text
//! +-----------------+-----------------+-----------------+-----------------+
//! | control block   | data block      | free block      | data block      |
//! | crc32, blksize, |                 | next_free:u64   |                 |
//! | free_head,      |                 | (0 terminates)  |                 |
//! | free_len,       |                 |                 |                 |
//! | userdata        |                 |                 |                 |
//! +-----------------+-----------------+-----------------+-----------------+
//! offset 0          blksize           2*blksize         3*blksize
//! ```
//!
//! All reads and writes go through an injected [`BufferCache`]: reads are
//! served from the cache when possible, and a write whose bytes match the
//! cached copy is elided entirely.
//!
//! The file assumes exactly one active user at a time; there is no internal
//! locking.

mod control;

use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder};

use crate::cache::BufferCache;
use crate::error::Result;
use crate::Error;

use control::ControlBlock;
pub use control::{CONTROL_SIZE, CRC32};

/// Default block size in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// Attempts before a positional seek that keeps landing elsewhere is fatal.
const SEEK_RETRIES: u32 = 3;

/// Narrow capability surface a block file exposes to upper layers.
pub trait BlockDevice {
    fn block_size(&self) -> u32;
    fn allocate(&mut self) -> Result<u64>;
    fn free(&mut self, pos: u64) -> Result<()>;
    fn read_block(&mut self, pos: u64) -> Result<Vec<u8>>;
    fn write_block(&mut self, pos: u64, block: &[u8]) -> Result<()>;
}

/// A block device shared by the single-threaded layers above it.
pub type SharedDevice = Rc<RefCell<dyn BlockDevice>>;

/// Options for a block file.
#[derive(Debug, Clone)]
pub struct Options {
    /// Block size in bytes (default: 4096). Must be a positive multiple
    /// of 4096.
    pub block_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
        }
    }
}

impl Options {
    /// Set the block size.
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }
}

/// A file of fixed-size blocks with a free list and a write-through cache.
pub struct BlockFile {
    path: PathBuf,
    file: Option<File>,
    cache: Box<dyn BufferCache>,
    ctrl: ControlBlock,
}

impl fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .field("block_size", &self.ctrl.blksize)
            .finish()
    }
}

impl BlockFile {
    /// Creates a block file handle with default options. No I/O happens until
    /// [`open`](Self::open).
    pub fn new(path: impl Into<PathBuf>, cache: Box<dyn BufferCache>) -> Result<Self> {
        Self::with_options(path, cache, Options::default())
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        cache: Box<dyn BufferCache>,
        options: Options,
    ) -> Result<Self> {
        if options.block_size == 0 || options.block_size % 4096 != 0 {
            return Err(Error::InvalidBlockSize(options.block_size));
        }
        Ok(Self {
            path: path.into(),
            file: None,
            cache,
            ctrl: ControlBlock::new(options.block_size),
        })
    }

    /// Opens the file, creating it if necessary. A zero-length file is
    /// initialized with a fresh control block; otherwise the control block is
    /// read and its checksum validated.
    pub fn open(&mut self) -> Result<()> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.file = Some(file);

        let result = self.init();
        if result.is_err() {
            self.file = None;
        } else {
            tracing::debug!(path = %self.path.display(), "opened block file");
        }
        result
    }

    fn init(&mut self) -> Result<()> {
        if self.size()? == 0 {
            self.allocate()?;
            self.write_ctrl()
        } else {
            self.read_ctrl()
        }
    }

    /// Closes the file. Further operations fail with NotOpen.
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(Error::NotOpen),
        }
    }

    /// Deletes the file. Fails with StillOpen unless closed first.
    pub fn remove(&self) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::StillOpen);
        }
        fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u32 {
        self.ctrl.blksize
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        Ok(file.metadata()?.len())
    }

    /// The userdata region of the control block.
    pub fn control_data(&self) -> &[u8] {
        &self.ctrl.userdata
    }

    pub(crate) fn free_head(&self) -> u64 {
        self.ctrl.free_head
    }

    pub(crate) fn free_len(&self) -> u32 {
        self.ctrl.free_len
    }

    /// Replaces the userdata region and persists the control block. The data
    /// is zero-padded to the full region width.
    pub fn set_control_data(&mut self, data: &[u8]) -> Result<()> {
        let max = self.ctrl.blksize as usize - CONTROL_SIZE;
        if data.len() > max {
            return Err(Error::TooLarge {
                size: data.len(),
                max,
            });
        }
        self.ctrl.userdata.fill(0);
        self.ctrl.userdata[..data.len()].copy_from_slice(data);
        self.write_ctrl()
    }

    fn write_ctrl(&mut self) -> Result<()> {
        let block = self.ctrl.encode()?;
        self.write_block(0, &block)
    }

    fn read_ctrl(&mut self) -> Result<()> {
        let block = self.read_block(0)?;
        self.ctrl = ControlBlock::decode(&block, self.ctrl.blksize)?;
        Ok(())
    }

    /// Returns a usable block offset: the head of the free list if one is
    /// available, otherwise a freshly appended block.
    pub fn allocate(&mut self) -> Result<u64> {
        if self.ctrl.free_len == 0 {
            self.extend(1)
        } else {
            self.pop_free()
        }
    }

    /// Appends `n` contiguous blocks, bypassing the free list, and returns
    /// the offset of the first.
    pub fn allocate_blocks(&mut self, n: u32) -> Result<u64> {
        self.extend(n)
    }

    fn extend(&mut self, n: u32) -> Result<u64> {
        let size = self.size()?;
        let amt = self.ctrl.blksize as u64 * n as u64;
        let file = self.file.as_ref().ok_or(Error::NotOpen)?;
        file.set_len(size + amt)?;
        tracing::trace!(pos = size, blocks = n, "extended block file");
        Ok(size)
    }

    fn pop_free(&mut self) -> Result<u64> {
        if self.ctrl.free_head == 0 && self.ctrl.free_len == 0 {
            return Err(Error::NoFreeBlocks);
        }
        let pos = self.ctrl.free_head;
        let block = self.read_block(pos)?;
        self.ctrl.free_head = BigEndian::read_u64(&block[0..8]);
        self.ctrl.free_len -= 1;
        self.write_ctrl()?;
        tracing::trace!(pos, free_len = self.ctrl.free_len, "popped free block");
        Ok(pos)
    }

    /// Pushes the block at `pos` onto the free list. The previous list head
    /// is written into the block's first 8 bytes before the control block is
    /// updated.
    pub fn free(&mut self, pos: u64) -> Result<()> {
        let mut block = vec![0u8; self.ctrl.blksize as usize];
        BigEndian::write_u64(&mut block[0..8], self.ctrl.free_head);
        self.write_block(pos, &block)?;
        self.ctrl.free_head = pos;
        self.ctrl.free_len += 1;
        self.write_ctrl()?;
        tracing::trace!(pos, free_len = self.ctrl.free_len, "freed block");
        Ok(())
    }

    /// Reads one block, consulting the cache first.
    pub fn read_block(&mut self, pos: u64) -> Result<Vec<u8>> {
        let blksize = self.ctrl.blksize;
        let file = self.file.as_mut().ok_or(Error::NotOpen)?;
        if let Some(block) = self.cache.read(pos, blksize) {
            return Ok(block);
        }
        let mut block = vec![0u8; blksize as usize];
        seek_to(file, pos)?;
        file.read_exact(&mut block)?;
        self.cache.update(pos, &block);
        Ok(block)
    }

    /// Reads `n` contiguous blocks. The cache is probed under the full
    /// extent but not populated on a miss, so single-block entries keep
    /// serving single-block reads.
    pub fn read_blocks(&mut self, pos: u64, n: u32) -> Result<Vec<u8>> {
        let len = self.ctrl.blksize * n;
        let file = self.file.as_mut().ok_or(Error::NotOpen)?;
        if let Some(bytes) = self.cache.read(pos, len) {
            return Ok(bytes);
        }
        let mut bytes = vec![0u8; len as usize];
        seek_to(file, pos)?;
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Writes one block through the cache. The write is elided when the cache
    /// already holds an identical buffer for the extent.
    pub fn write_block(&mut self, pos: u64, block: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NotOpen)?;
        if let Some(cached) = self.cache.read(pos, block.len() as u32) {
            if cached == block {
                return Ok(());
            }
        }
        seek_to(file, pos)?;
        file.write_all(block)?;
        self.cache.update(pos, block);
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn block_size(&self) -> u32 {
        BlockFile::block_size(self)
    }

    fn allocate(&mut self) -> Result<u64> {
        BlockFile::allocate(self)
    }

    fn free(&mut self, pos: u64) -> Result<()> {
        BlockFile::free(self, pos)
    }

    fn read_block(&mut self, pos: u64) -> Result<Vec<u8>> {
        BlockFile::read_block(self, pos)
    }

    fn write_block(&mut self, pos: u64, block: &[u8]) -> Result<()> {
        BlockFile::write_block(self, pos, block)
    }
}

/// Positions the file at `pos`, retrying a bounded number of times if the
/// seek reports a different offset.
fn seek_to(file: &mut File, pos: u64) -> Result<()> {
    let mut got = 0;
    for _ in 0..SEEK_RETRIES {
        got = file.seek(SeekFrom::Start(pos))?;
        if got == pos {
            return Ok(());
        }
    }
    Err(Error::Seek { want: pos, got })
}
