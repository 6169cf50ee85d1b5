//! Summary: Error types for the pirin storage engine.
//! Copyright (c) YOAB. All rights reserved.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for pirin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pirin database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Key length is at or above the maximum key size.
    #[error("key too large")]
    KeyTooLarge,
    /// Value length is at or above one gigabyte.
    #[error("value too large")]
    ValueTooLarge,
    /// A node does not fit into a single page.
    #[error("not enough space to serialize node")]
    NotEnoughSpace,
    /// The freelist has no page numbers left to hand out.
    #[error("no pages left")]
    NoPagesLeft,
    /// No bucket with the given name exists.
    #[error("bucket not found")]
    BucketNotFound,
    /// A bucket with the given name already exists.
    #[error("bucket already exists")]
    BucketExists,
    /// The transaction has already been committed or rolled back.
    #[error("transaction closed")]
    TxClosed,
    /// A mutation was attempted through a read-only transaction.
    #[error("write in read transaction")]
    WriteInReadTx,
    /// The requested key is not present in the tree.
    #[error("node not found")]
    NodeNotFound,
    /// The blob payload exceeds the maximum blob size.
    #[error("blob too large")]
    BlobTooLarge,
    /// An item value carries an unrecognized type tag.
    #[error("unknown item type")]
    UnknownItemType,
    /// The database file was written by an incompatible major version.
    #[error("invalid db version")]
    BadDbVersion,
    /// The database file does not carry the expected magic name.
    #[error("invalid db name")]
    BadDbName,
    /// A page number beyond the end of the file was requested.
    #[error("page number {page} is greater than max page number {max}")]
    PageOutOfRange { page: u64, max: u64 },
    /// Page 0 holds the meta page and can never be released.
    #[error("cannot release page 0")]
    ReleasePageZero,
    /// Merging two siblings would overflow a single page.
    #[error("merge overflow: combined size {size} exceeds max page size {max}")]
    MergeOverflow { size: usize, max: usize },
    /// The advisory file lock is held by another process.
    #[error("could not lock database file: {path:?}")]
    FileLock { path: PathBuf },
    /// The database or log file could not be opened.
    #[error("could not open {path:?}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Reading a page from the backing file failed.
    #[error("failed to read page {page}: {source}")]
    PageRead {
        page: u64,
        #[source]
        source: io::Error,
    },
    /// Writing a page to the backing file failed.
    #[error("failed to write page {page}: {source}")]
    PageWrite {
        page: u64,
        #[source]
        source: io::Error,
    },
    /// Flushing file contents to stable storage failed.
    #[error("failed to sync file: {source}")]
    FileSync {
        #[source]
        source: io::Error,
    },
    /// The transaction log checksum does not match its contents.
    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    LogCrcMismatch { expected: u32, actual: u32 },
    /// The transaction log is structurally invalid.
    #[error("transaction log corrupted: {reason}")]
    LogCorrupted { reason: String },
    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
