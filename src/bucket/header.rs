use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

/// Byte width of the chain-block header region. Every block of a chain
/// reserves this much, so record slots line up identically in head and
/// continuation blocks.
pub(crate) const BLOCK_HEADER_SIZE: usize = 19;

const FLAG_CONTINUATION: u8 = 0x01;

/// Header of a chain block.
///
/// ```text
/// +--------+--------+----------+----------+-----------+----------+
/// |flags:u8|next:u64|keysize:u8|valsize:u8|records:u32|blocks:u32|
/// +--------+--------+----------+----------+-----------+----------+
/// ```
///
/// Big-endian throughout. A continuation block carries only `flags` and
/// `next`; the remaining fields are written as zero. `records` counts
/// occupied slots across the whole chain and `blocks` its length, both
/// authoritative only in the head block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BlockHeader {
    pub flags: u8,
    pub next: u64,
    pub keysize: u8,
    pub valsize: u8,
    pub records: u32,
    pub blocks: u32,
}

impl BlockHeader {
    pub fn new(keysize: u8, valsize: u8) -> Self {
        BlockHeader {
            flags: 0,
            next: 0,
            keysize,
            valsize,
            records: 0,
            blocks: 1,
        }
    }

    pub fn continuation() -> Self {
        BlockHeader {
            flags: FLAG_CONTINUATION,
            next: 0,
            keysize: 0,
            valsize: 0,
            records: 0,
            blocks: 0,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.flags & FLAG_CONTINUATION != 0
    }

    /// Encodes the header into the leading bytes of a block buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut writer = &mut buf[..];
        writer
            .write_u8(self.flags)
            .map_err(|e| Error::Encode("flags", e))?;
        writer
            .write_u64::<BigEndian>(self.next)
            .map_err(|e| Error::Encode("next", e))?;
        writer
            .write_u8(self.keysize)
            .map_err(|e| Error::Encode("keysize", e))?;
        writer
            .write_u8(self.valsize)
            .map_err(|e| Error::Encode("valsize", e))?;
        writer
            .write_u32::<BigEndian>(self.records)
            .map_err(|e| Error::Encode("records", e))?;
        writer
            .write_u32::<BigEndian>(self.blocks)
            .map_err(|e| Error::Encode("blocks", e))?;
        Ok(())
    }

    /// Decodes a header from the leading bytes of a block buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut reader = buf;
        let flags = reader.read_u8().map_err(|e| Error::Decode("flags", e))?;
        let next = reader
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("next", e))?;
        let keysize = reader.read_u8().map_err(|e| Error::Decode("keysize", e))?;
        let valsize = reader.read_u8().map_err(|e| Error::Decode("valsize", e))?;
        let records = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("records", e))?;
        let blocks = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("blocks", e))?;

        Ok(BlockHeader {
            flags,
            next,
            keysize,
            valsize,
            records,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_header_round_trip() {
        let mut header = BlockHeader::new(8, 16);
        header.records = 42;
        header.blocks = 3;
        header.next = 8192;

        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        header.encode(&mut buf).expect("Failed to encode header");

        let decoded = BlockHeader::decode(&buf).expect("Failed to decode header");
        assert_eq!(header, decoded);
        assert!(!decoded.is_continuation());
    }

    #[test]
    fn test_continuation_header_round_trip() {
        let mut header = BlockHeader::continuation();
        header.next = 12288;

        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        header.encode(&mut buf).expect("Failed to encode header");

        let decoded = BlockHeader::decode(&buf).expect("Failed to decode header");
        assert!(decoded.is_continuation());
        assert_eq!(decoded.next, 12288);
        assert_eq!(decoded.records, 0);
        assert_eq!(decoded.blocks, 0);
    }

    #[test]
    fn test_decode_short_buffer() {
        let buf = [0u8; BLOCK_HEADER_SIZE - 1];
        assert!(BlockHeader::decode(&buf).is_err());
    }
}
