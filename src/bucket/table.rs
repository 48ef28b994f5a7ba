use std::io;

use crate::blockfile::{BlockDevice, SharedDevice};
use crate::error::Result;
use crate::Error;

use super::header::{BlockHeader, BLOCK_HEADER_SIZE};

/// One block of a chain: its file offset, decoded header, and data region.
struct ChainBlock {
    pos: u64,
    header: BlockHeader,
    data: Vec<u8>,
}

impl ChainBlock {
    /// Allocates a fresh zeroed block on the device.
    fn alloc(device: &mut dyn BlockDevice, header: BlockHeader) -> Result<Self> {
        let pos = device.allocate()?;
        let data = vec![0u8; device.block_size() as usize - BLOCK_HEADER_SIZE];
        Ok(ChainBlock { pos, header, data })
    }

    fn read(device: &mut dyn BlockDevice, pos: u64) -> Result<Self> {
        let bytes = device.read_block(pos)?;
        let header = BlockHeader::decode(&bytes)?;
        Ok(ChainBlock {
            pos,
            header,
            data: bytes[BLOCK_HEADER_SIZE..].to_vec(),
        })
    }

    fn write(&self, device: &mut dyn BlockDevice) -> Result<()> {
        let mut bytes = vec![0u8; BLOCK_HEADER_SIZE + self.data.len()];
        self.header.encode(&mut bytes[..BLOCK_HEADER_SIZE])?;
        bytes[BLOCK_HEADER_SIZE..].copy_from_slice(&self.data);
        device.write_block(self.pos, &bytes)
    }
}

/// A sorted table of fixed-width records over a chain of blocks.
///
/// Records are `keysize + valsize` bytes and live in slots spread across the
/// chain in chain order. The first `records` slots are occupied, sorted by
/// raw lexicographic key order; the rest are reserve. Duplicate keys are
/// permitted and kept adjacent. The chain grows by one block when an insert
/// would fill the last slot and releases its tail block back to the device
/// once a whole block's worth of reserve opens up.
pub struct BlockTable {
    dev: SharedDevice,
    pos: u64,
    header: BlockHeader,
    blocks: Vec<ChainBlock>,
}

impl BlockTable {
    /// Creates a new single-block table on the device. Keys are at most
    /// 8 bytes wide.
    pub fn create(dev: SharedDevice, keysize: u8, valsize: u8) -> Result<Self> {
        if keysize == 0 || keysize > 8 {
            return Err(Error::KeyTooBig(keysize));
        }
        let header = BlockHeader::new(keysize, valsize);
        let block = {
            let mut device = dev.borrow_mut();
            let block = ChainBlock::alloc(&mut *device, header)?;
            block.write(&mut *device)?;
            block
        };
        let pos = block.pos;
        Ok(BlockTable {
            dev,
            pos,
            header,
            blocks: vec![block],
        })
    }

    /// Loads an existing table by walking the chain from its head block.
    pub fn load(dev: SharedDevice, pos: u64) -> Result<Self> {
        let blocks = {
            let mut device = dev.borrow_mut();
            let head = ChainBlock::read(&mut *device, pos)?;
            if head.header.is_continuation() || head.header.blocks == 0 {
                return Err(Error::Decode(
                    "flags",
                    io::Error::new(io::ErrorKind::InvalidData, "not a chain head"),
                ));
            }
            if head.header.keysize == 0 || head.header.keysize > 8 {
                return Err(Error::KeyTooBig(head.header.keysize));
            }
            let expected = head.header.blocks;
            let mut next = head.header.next;
            let mut blocks = vec![head];
            while (blocks.len() as u32) < expected {
                if next == 0 {
                    return Err(Error::ChainBroken {
                        expected,
                        got: blocks.len() as u32,
                    });
                }
                let block = ChainBlock::read(&mut *device, next)?;
                next = block.header.next;
                blocks.push(block);
            }
            blocks
        };
        let header = blocks[0].header;
        Ok(BlockTable {
            dev,
            pos,
            header,
            blocks,
        })
    }

    /// Offset of the head block; the stable address of this table.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Number of occupied records.
    pub fn len(&self) -> usize {
        self.header.records as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.records == 0
    }

    /// Record slots per chain block.
    pub fn records_per_block(&self) -> usize {
        self.blocks[0].data.len() / self.record_size()
    }

    pub(crate) fn keysize(&self) -> u8 {
        self.header.keysize
    }

    pub(crate) fn chain_len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn device(&self) -> SharedDevice {
        self.dev.clone()
    }

    fn record_size(&self) -> usize {
        self.header.keysize as usize + self.header.valsize as usize
    }

    /// Total record slots across the chain.
    fn capacity(&self) -> usize {
        self.records_per_block() * self.blocks.len()
    }

    /// The (key, value) fields of slot `i`.
    fn record(&self, i: usize) -> (&[u8], &[u8]) {
        let rpb = self.records_per_block();
        let size = self.record_size();
        let block = &self.blocks[i / rpb];
        let offset = (i % rpb) * size;
        let record = &block.data[offset..offset + size];
        record.split_at(self.header.keysize as usize)
    }

    fn record_key(&self, i: usize) -> &[u8] {
        self.record(i).0
    }

    pub(crate) fn record_value(&self, i: usize) -> &[u8] {
        self.record(i).1
    }

    /// Writes `key` and `value` into slot `i`, zero-padding the value field.
    fn set_record(&mut self, i: usize, key: &[u8], value: &[u8]) {
        let rpb = self.records_per_block();
        let size = self.record_size();
        let keysize = self.header.keysize as usize;
        let block = &mut self.blocks[i / rpb];
        let offset = (i % rpb) * size;
        let slot = &mut block.data[offset..offset + size];
        slot[..keysize].copy_from_slice(key);
        slot[keysize..].fill(0);
        slot[keysize..keysize + value.len()].copy_from_slice(value);
    }

    fn copy_record(&mut self, from: usize, to: usize) {
        let (key, value) = self.record(from);
        let (key, value) = (key.to_vec(), value.to_vec());
        self.set_record(to, &key, &value);
    }

    /// Iterates the occupied records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        (0..self.header.records as usize).map(move |i| self.record(i))
    }

    /// Binary search over the occupied records. Returns the index of the
    /// first record with an equal key and `true`, or the lower-bound
    /// insertion index and `false`.
    pub(crate) fn find(&self, key: &[u8]) -> (usize, bool) {
        let n = self.header.records as usize;
        let mut lo = 0;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.record_key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo, lo < n && self.record_key(lo) == key)
    }

    /// The contiguous run of records whose key equals `key` (possibly empty).
    pub(crate) fn find_run(&self, key: &[u8]) -> std::ops::Range<usize> {
        let (start, found) = self.find(key);
        if !found {
            return start..start;
        }
        let n = self.header.records as usize;
        let mut end = start + 1;
        while end < n && self.record_key(end) == key {
            end += 1;
        }
        start..end
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.find(key).1
    }

    /// Returns the value field of the first record with this key.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (i, found) = self.find(key);
        if !found {
            return Err(Error::KeyNotFound);
        }
        Ok(self.record_value(i).to_vec())
    }

    /// Inserts or replaces the first record with this key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, |_| Ok(Some(value.to_vec())))
    }

    /// Sorted insert with replacement control. When equal-key records exist,
    /// `decide` is offered each one's value bytes in turn; returning
    /// `Some(replacement)` overwrites that record in place, while `None` for
    /// the whole run inserts a fresh record at the head of the run.
    pub(crate) fn put_with<F>(&mut self, key: &[u8], value: &[u8], mut decide: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<Option<Vec<u8>>>,
    {
        if key.len() != self.header.keysize as usize {
            return Err(Error::BadKeySize {
                want: self.header.keysize,
                got: key.len(),
            });
        }
        let valsize = self.header.valsize as usize;
        if value.len() > valsize {
            return Err(Error::TooLarge {
                size: value.len(),
                max: valsize,
            });
        }

        if self.header.records as usize + 1 >= self.capacity() {
            self.add_block()?;
        }

        let (mut i, found) = self.find(key);
        let mut bytes = value.to_vec();
        let mut replacing = false;
        if found {
            let n = self.header.records as usize;
            let mut j = i;
            while j < n && self.record_key(j) == key {
                let candidate = self.record_value(j).to_vec();
                if let Some(replacement) = decide(&candidate)? {
                    if replacement.len() > valsize {
                        return Err(Error::TooLarge {
                            size: replacement.len(),
                            max: valsize,
                        });
                    }
                    i = j;
                    bytes = replacement;
                    replacing = true;
                    break;
                }
                j += 1;
            }
        }

        if !replacing {
            // Shift [i, records) one slot right, tail first.
            let n = self.header.records as usize;
            let mut j = n;
            while j > i {
                self.copy_record(j - 1, j);
                j -= 1;
            }
            self.header.records += 1;
        }
        self.set_record(i, key, &bytes);
        self.save()
    }

    /// Removes the first record with this key.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let (i, found) = self.find(key);
        if !found {
            return Err(Error::KeyNotFound);
        }
        self.remove_at(i)
    }

    /// Removes the record at index `i`, shrinking the chain once a whole
    /// block of reserve opens up.
    pub(crate) fn remove_at(&mut self, i: usize) -> Result<()> {
        let n = self.header.records as usize;
        for j in i..n - 1 {
            self.copy_record(j + 1, j);
        }
        self.header.records -= 1;
        if (self.header.records as usize / self.records_per_block()) + 1 < self.blocks.len() {
            self.remove_block()?;
        }
        self.save()
    }

    /// Replaces the table contents wholesale: records must be presorted and
    /// of matching widths. Used when splitting a bucket.
    pub(crate) fn bulk_load(&mut self, records: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        while self.capacity() < records.len() {
            self.add_block()?;
        }
        for (i, (key, value)) in records.iter().enumerate() {
            self.set_record(i, key, value);
        }
        self.header.records = records.len() as u32;
        while (self.header.records as usize / self.records_per_block()) + 1 < self.blocks.len() {
            self.remove_block()?;
        }
        self.save()
    }

    /// Appends a continuation block to the chain.
    pub(crate) fn add_block(&mut self) -> Result<()> {
        let block = {
            let mut device = self.dev.borrow_mut();
            ChainBlock::alloc(&mut *device, BlockHeader::continuation())?
        };
        let pos = block.pos;
        let last = self.blocks.len() - 1;
        if last == 0 {
            self.header.next = pos;
        } else {
            self.blocks[last].header.next = pos;
        }
        self.blocks.push(block);
        self.header.blocks += 1;
        tracing::trace!(pos, blocks = self.header.blocks, "grew chain");
        self.save()
    }

    /// Drops the tail block and returns it to the device free list.
    pub(crate) fn remove_block(&mut self) -> Result<()> {
        if self.blocks.len() <= 1 {
            return Err(Error::LastBlock);
        }
        let freed = self.blocks.swap_remove(self.blocks.len() - 1);
        self.header.blocks -= 1;
        let last = self.blocks.len() - 1;
        if last == 0 {
            self.header.next = 0;
        } else {
            self.blocks[last].header.next = 0;
        }
        self.dev.borrow_mut().free(freed.pos)?;
        tracing::trace!(pos = freed.pos, blocks = self.header.blocks, "shrank chain");
        Ok(())
    }

    /// Persists the live header into the head block and writes the chain
    /// back through the device; clean blocks are elided by the cache.
    pub(crate) fn save(&mut self) -> Result<()> {
        self.blocks[0].header = self.header;
        let mut device = self.dev.borrow_mut();
        for block in &self.blocks {
            block.write(&mut *device)?;
        }
        Ok(())
    }
}
