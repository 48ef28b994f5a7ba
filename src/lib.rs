pub mod blockfile;
pub mod bucket;
pub mod cache;
pub mod error;

pub use blockfile::{BlockDevice, BlockFile, Options, SharedDevice};
pub use bucket::{BlockTable, HashBucket, KVStore, SharedKVStore};
pub use cache::{BlockCache, BufferCache};
pub use error::{Error, Result};
