//! Summary: Database facade: open/close, transactions, and statistics.
//! Copyright (c) YOAB. All rights reserved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::RwLock;

use crate::error::Result;
use crate::page::PAGE_SIZE;
use crate::pager::Pager;
use crate::tx::Tx;

/// Options controlling how a database file is opened.
#[derive(Debug, Clone)]
pub struct Options {
    /// Unix permission bits for the database and log files.
    pub file_mode: u32,
    /// Page size for freshly created files; existing files keep theirs.
    pub page_size: u64,
    /// Whether a pending transaction log is replayed on open.
    pub enable_recovery: bool,
    /// Transaction log path; defaults to the database path with the
    /// extension replaced by `.tlog`.
    pub tx_log_path: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            file_mode: 0o600,
            page_size: PAGE_SIZE as u64,
            enable_recovery: true,
            tx_log_path: None,
        }
    }
}

impl Options {
    pub fn with_file_mode(mut self, file_mode: u32) -> Options {
        self.file_mode = file_mode;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Options {
        self.page_size = page_size;
        self
    }

    pub fn with_recovery(mut self, enable: bool) -> Options {
        self.enable_recovery = enable;
        self
    }

    pub fn with_tx_log_path(mut self, path: impl Into<PathBuf>) -> Options {
        self.tx_log_path = Some(path.into());
        self
    }
}

/// Per-bucket usage counters reported by [`Database::stat`].
#[derive(Debug, Clone, Default)]
pub struct BucketStat {
    pub items_n: u64,
    pub blobs_n: u64,
    pub bytes_in_use: u64,
}

/// Whole-database statistics.
#[derive(Debug, Clone, Default)]
pub struct DbStat {
    /// Total number of pages the file can hold.
    pub total_pages: u64,
    /// Pages that have never been allocated plus released ones.
    pub free_pages: u64,
    /// Pages below the allocation high-water mark plus freelist pages.
    pub used_pages: u64,
    /// Released pages awaiting reuse.
    pub released_pages: u64,
    /// Pages occupied by the freelist itself.
    pub freelist_pages: u64,
    /// Total file size in bytes.
    pub total_size: u64,
    /// Free page capacity in bytes.
    pub avail_size: u64,
    /// Used page capacity in bytes.
    pub used_size: u64,
    /// Usage counters per bucket, keyed by name.
    pub buckets: BTreeMap<Vec<u8>, BucketStat>,
    /// Read transactions currently open.
    pub tx_n: i32,
}

/// The main database handle.
///
/// # Concurrency
///
/// At most one write transaction runs at a time; any number of read
/// transactions run concurrently. Writers wait for readers to finish and
/// vice versa. A second process opening the same file is refused by the
/// advisory file lock.
pub struct Database {
    pub(crate) state: RwLock<Pager>,
    pub(crate) readers: AtomicI32,
}

impl Database {
    /// Opens a database at the given path, creating it if missing.
    ///
    /// When recovery is enabled and a finalized transaction log is
    /// present, it is replayed before the file is used.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or locked, when it
    /// was written by an incompatible engine, or when a pending
    /// transaction log fails CRC validation.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Database> {
        let pager = Pager::open(path.as_ref(), &opts)?;
        Ok(Database {
            state: RwLock::new(pager),
            readers: AtomicI32::new(0),
        })
    }

    /// Closes the database, flushing file contents and releasing the
    /// advisory lock.
    pub fn close(self) -> Result<()> {
        let pager = self.state.into_inner();
        pager.sync()?;
        Ok(())
    }

    /// Begins a transaction.
    ///
    /// `begin(true)` blocks until no other transaction is active;
    /// `begin(false)` blocks only while a writer holds the lock.
    pub fn begin(&self, write: bool) -> Tx<'_> {
        Tx::new(self, write)
    }

    /// Runs `f` inside a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(false);
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Runs `f` inside a write transaction, committing on success and
    /// rolling back on error.
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin(true);
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Collects page-accounting and per-bucket statistics.
    pub fn stat(&self) -> DbStat {
        let (total_pages, free_pages, used_pages, released_pages, freelist_pages, page_size) = {
            let pager = self.state.read();
            let freelist = &pager.freelist;
            let released = freelist.released_pages.len() as u64;
            let chain = freelist.freelist_pages.len() as u64;
            (
                freelist.max_pages,
                freelist.max_pages.saturating_sub(freelist.current_page) + released,
                freelist.current_page + chain,
                released,
                chain,
                pager.page_size(),
            )
        };

        let mut buckets = BTreeMap::new();
        let _ = self.view(|tx| {
            for name in tx.buckets() {
                if let Ok(bucket) = tx.get_bucket(&name) {
                    buckets.insert(
                        name,
                        BucketStat {
                            items_n: bucket.items(),
                            blobs_n: bucket.blobs(),
                            bytes_in_use: bucket.bytes_in_use(),
                        },
                    );
                }
            }
            Ok(())
        });

        DbStat {
            total_pages,
            free_pages,
            used_pages,
            released_pages,
            freelist_pages,
            total_size: total_pages * page_size,
            avail_size: free_pages * page_size,
            used_size: used_pages * page_size,
            buckets,
            tx_n: self.readers.load(Ordering::SeqCst),
        }
    }
}
