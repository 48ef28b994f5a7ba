use std::fmt::Display;
use std::io;

/// Errors produced by the storage substrate.
#[derive(Debug)]
pub enum Error {
    /// Operation on a BlockFile that is not open.
    NotOpen,
    /// Remove was called while the file is still open.
    StillOpen,
    /// The control block checksum did not validate on load.
    BadChecksum { computed: u32, stored: u32 },
    /// Data exceeds the reserved width (control userdata or a record value).
    TooLarge { size: usize, max: usize },
    /// A pop was attempted on an empty free list.
    NoFreeBlocks,
    /// A block chain ended before its header said it would.
    ChainBroken { expected: u32, got: u32 },
    /// Attempt to remove the only block in a chain.
    LastBlock,
    /// Unsupported key width for a block table (must be 1..=8 bytes).
    KeyTooBig(u8),
    /// Lookup or removal missed.
    KeyNotFound,
    /// Unsupported hash width for a hash bucket (must be 8 bytes).
    UnsupportedHashSize(u8),
    /// Block size must be a positive multiple of 4096.
    InvalidBlockSize(u32),
    /// A key of the wrong width was passed to a fixed-width table.
    BadKeySize { want: u8, got: usize },
    /// A positional seek kept landing at the wrong offset.
    Seek { want: u64, got: u64 },
    /// Failed to decode the named field.
    Decode(&'static str, io::Error),
    /// Failed to encode the named field.
    Encode(&'static str, io::Error),
    /// An underlying I/O error.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotOpen => write!(f, "file is not open"),
            Error::StillOpen => write!(f, "file is still open"),
            Error::BadChecksum { computed, stored } => {
                write!(f, "bad control block checksum {computed:#010x} != {stored:#010x}")
            }
            Error::TooLarge { size, max } => {
                write!(f, "data of {size} bytes exceeds reserved width {max}")
            }
            Error::NoFreeBlocks => write!(f, "no blocks on the free list"),
            Error::ChainBroken { expected, got } => {
                write!(f, "block chain ended after {got} of {expected} blocks")
            }
            Error::LastBlock => write!(f, "cannot remove the last block of a chain"),
            Error::KeyTooBig(size) => write!(f, "key size {size} unsupported (must be 1..=8)"),
            Error::KeyNotFound => write!(f, "key not found"),
            Error::UnsupportedHashSize(size) => {
                write!(f, "hash size {size} unsupported (must be 8)")
            }
            Error::InvalidBlockSize(size) => {
                write!(f, "block size {size} is not a positive multiple of 4096")
            }
            Error::BadKeySize { want, got } => {
                write!(f, "key size is wrong, {got} != {want}")
            }
            Error::Seek { want, got } => {
                write!(f, "seek to offset {want} landed at {got}")
            }
            Error::Decode(field, err) => write!(f, "failed to decode {field}: {err}"),
            Error::Encode(field, err) => write!(f, "failed to encode {field}: {err}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(_, err) | Error::Encode(_, err) | Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// A Result returning the crate-wide Error.
pub type Result<T> = std::result::Result<T, Error>;
