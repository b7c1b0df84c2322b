//! # cow-block
//!
//! Content-addressed block store backing the copy-on-write overlay.
//!
//! Fixed-size blocks are named by the CRC-64 digest of their contents, so
//! byte-identical blocks always collapse to one on-disk object and a "copy"
//! is just another reference to it.
//!
//! ## Directory Layout
//!
//! ```text
//! attribute_dir/
//! ├── .cowstore.json        # block size + layout, fixed at creation
//! ├── .cowstore.lock        # exclusive owner lock
//! └── 995dc9bbdf1939fa      # 32-byte attribute record (refcount, size, flags)
//! data_dir/
//! └── 995dc9bbdf1939fa      # block_size bytes of payload
//! ```
//!
//! With fan-out enabled both directories gain one level keyed by the first
//! two hex characters (`99/995dc9bbdf1939fa`).
//!
//! ## Lifetime
//!
//! `put` takes a reference, `release` drops one. A block whose count reaches
//! zero is reclaimed once no reader holds it; the all-zero block carries a
//! standing reference owned by the store and is never reclaimed.

pub mod digest;
pub mod ident;
pub mod layout;
mod lock;
mod reclaim;
pub mod record;
mod store;

pub use digest::{crc64, digest, Crc64, Endian};
pub use ident::{decode, encode, BlockId, DIGEST_LEN, ID_HEX_LEN};
pub use reclaim::{ScrubReport, SweepReport};
pub use record::{BlockAttributeRecord, BlockFlags, RecordDecodeError};
pub use store::{Store, StoreOptions, StoreStats};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Why a block failed verification on read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    #[error("data hashes to {actual}")]
    DigestMismatch { actual: BlockId },

    #[error("expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("data file is missing")]
    MissingData,
}

/// Errors that can occur during block store operations
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid block size: expected at most {expected} bytes, got {actual}")]
    InvalidBlockSize { expected: u64, actual: u64 },

    #[error("malformed block identifier {input:?}: {reason}")]
    MalformedIdentifier { input: String, reason: String },

    #[error("block not found: {id}")]
    BlockNotFound { id: BlockId },

    #[error("integrity violation on block {id}: {fault}")]
    IntegrityViolation { id: BlockId, fault: IntegrityFault },

    #[error("reference count underflow on block {id}: {reason}")]
    Underflow { id: BlockId, reason: &'static str },

    #[error("corrupt attribute record for block {id}: {source}")]
    CorruptRecord {
        id: BlockId,
        #[source]
        source: RecordDecodeError,
    },

    #[error("store at {path} is locked by another owner")]
    StoreLocked { path: PathBuf },

    #[error("storage I/O error at {path}: {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// Attach the offending path to an `io::Error`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| BlockError::StorageIo {
            path: path.to_path_buf(),
            source,
        })
    }
}
