use std::io;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::Result;
use crate::Error;

/// Bytes of the control block reserved for file metadata; the rest is
/// user data owned by the layer above.
pub const CONTROL_SIZE: usize = 20;

/// CRC32 (IEEE polynomial) over control block bytes 4..blksize.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The control block stored at offset 0.
///
/// ```text
/// +---------+----------+-------------+------------+--------------------+
/// |crc32:u32|blksize:u32|free_head:u64|free_len:u32| userdata           |
/// +---------+----------+-------------+------------+--------------------+
/// | 4 bytes | 4 bytes  |  8 bytes    |  4 bytes   | blksize - 20 bytes |
/// +---------+----------+-------------+------------+--------------------+
/// ```
///
/// All integers are big-endian. The checksum covers everything after itself.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ControlBlock {
    pub blksize: u32,
    pub free_head: u64,
    pub free_len: u32,
    pub userdata: Vec<u8>,
}

impl ControlBlock {
    pub fn new(blksize: u32) -> Self {
        ControlBlock {
            blksize,
            free_head: 0,
            free_len: 0,
            userdata: vec![0; blksize as usize - CONTROL_SIZE],
        }
    }

    /// Encodes the control block into a full block buffer, checksum patched in
    /// last.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.blksize as usize);
        buf.extend_from_slice(&[0u8; 4]);
        buf.write_u32::<BigEndian>(self.blksize)
            .map_err(|e| Error::Encode("blksize", e))?;
        buf.write_u64::<BigEndian>(self.free_head)
            .map_err(|e| Error::Encode("free_head", e))?;
        buf.write_u32::<BigEndian>(self.free_len)
            .map_err(|e| Error::Encode("free_len", e))?;
        buf.extend_from_slice(&self.userdata);

        let computed = CRC32.checksum(&buf[4..]);
        BigEndian::write_u32(&mut buf[0..4], computed);
        Ok(buf)
    }

    /// Decodes and validates a control block read from disk. `blksize` is the
    /// block size this file was opened with; a file recorded with a different
    /// size is rejected.
    pub fn decode(bytes: &[u8], blksize: u32) -> Result<Self> {
        if bytes.len() < CONTROL_SIZE {
            return Err(Error::Decode(
                "control block",
                io::Error::new(io::ErrorKind::UnexpectedEof, "control block too short"),
            ));
        }

        let mut reader = bytes;
        let stored = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("crc32", e))?;
        let computed = CRC32.checksum(&bytes[4..]);
        if computed != stored {
            return Err(Error::BadChecksum { computed, stored });
        }

        let found = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("blksize", e))?;
        if found != blksize {
            return Err(Error::Decode(
                "blksize",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("file block size {found} does not match {blksize}"),
                ),
            ));
        }

        let free_head = reader
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("free_head", e))?;
        let free_len = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("free_len", e))?;

        Ok(ControlBlock {
            blksize,
            free_head,
            free_len,
            userdata: bytes[CONTROL_SIZE..].to_vec(),
        })
    }
}
