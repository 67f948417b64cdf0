//! A key-value store optimized for atomically committing a small collection of metadata.
//!
//! [Metadata] keeps the guardian's durable bookkeeping (scan cursor, applied version) across
//! restarts. All keys are held in memory and written out together on [Metadata::sync].
//!
//! # Format
//!
//! Data stored in [Metadata] is serialized as a sequence of key-value pairs in either a
//! "left" or "right" blob:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 |    ...    | 8 | 9 |10 |11 |12 |  ...  |   |   |   |   |   |...|   |   |   |   |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |    Version (u64)  | Len(K1) (u32) |   Key1    | Len(V1) (u32) |Value1 |...| CRC32(u32)|
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! _To ensure the integrity of the data, a CRC32 checksum is appended to the end of the blob.
//! This ensures that partial writes are detected before any data is relied on._
//!
//! # Atomic Updates
//!
//! [Metadata] maintains two blobs. When a new update is committed, it is written (and synced)
//! to the older of the two blobs with an incremented version. On restart, the valid blob with
//! the highest version wins and a blob that fails its checksum is truncated, so a torn write
//! only ever loses the update that was in flight.
//!
//! # Example
//!
//! ```rust,no_run
//! use commonware_guardian::metadata::{Config, Metadata};
//!
//! # async fn example() -> Result<(), commonware_guardian::metadata::Error> {
//! let mut metadata = Metadata::init(Config {
//!     directory: "/tmp/guardian".into(),
//!     partition: "state".to_string(),
//! })
//! .await?;
//!
//! // Store metadata and commit it
//! metadata.put("hello", b"world".to_vec());
//! metadata.sync().await?;
//!
//! // Retrieve some metadata
//! assert_eq!(metadata.get("hello"), Some(&b"world".to_vec()));
//! metadata.close().await?;
//! # Ok(())
//! # }
//! ```

mod storage;
pub use storage::Metadata;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when interacting with [Metadata].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob too large: {0}")]
    BlobTooLarge(u64),
    #[error("key too big: {0}")]
    KeyTooBig(String),
    #[error("value too big: {0}")]
    ValueTooBig(String),
}

/// Configuration for [Metadata] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory containing all partitions.
    pub directory: PathBuf,

    /// The partition (subdirectory) to use for storing metadata.
    pub partition: String,
}

impl Config {
    fn partition_path(&self) -> PathBuf {
        self.directory.join(&self.partition)
    }
}
