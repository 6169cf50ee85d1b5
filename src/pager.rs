//! Summary: Paged file access, advisory locking, growth, and page routing.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The pager owns the backing file and everything persisted in it: the
//! meta page, the freelist, and the transaction log. Reads return fresh
//! copies of page contents; writes go through [`Pager::set_page`], which
//! routes to the transaction log while a commit has it active and to the
//! main file otherwise.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::db::Options;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::meta::{Meta, META_PAGE_NUMBER};
use crate::page::{Page, PageId};
use crate::txlog::TxLog;

/// Smallest backing file size (32KB).
pub(crate) const MIN_FILE_SIZE: u64 = 1024 * 32;

/// One gigabyte; the growth-policy threshold and the value size ceiling.
pub(crate) const ONE_GIGABYTE: usize = 1024 * 1024 * 1024;

/// Nodes are considered under-populated below this fraction of a page.
pub(crate) const MIN_FILL_PERCENT: f32 = 0.45;

/// Nodes are considered over-populated above this fraction of a page.
pub(crate) const MAX_FILL_PERCENT: f32 = 0.95;

/// Fault-injection hook invoked before every page write.
///
/// Receives the page and whether the transaction log is currently active;
/// an error aborts the write.
pub(crate) type SetPageHook = Box<dyn Fn(&Page, bool) -> Result<()> + Send + Sync>;

/// Owns the backing file and the structures persisted in it.
pub(crate) struct Pager {
    file: File,
    path: PathBuf,
    size: u64,
    pub(crate) max_pages: u64,
    page_size: u64,
    pub(crate) meta: Meta,
    pub(crate) freelist: Freelist,
    pub(crate) txlog: TxLog,
    pub(crate) before_set_page: Option<SetPageHook>,
}

impl Pager {
    /// Opens (or creates) the database file at `path`.
    ///
    /// Takes the advisory exclusive lock, replays a pending transaction
    /// log when recovery is enabled, then loads the meta page and the
    /// freelist. A fresh file is initialized with a meta page, a persisted
    /// freelist, and a zeroed root node page.
    ///
    /// # Errors
    ///
    /// Returns `FileLock` when another process holds the lock, `BadDbName`
    /// / `BadDbVersion` for foreign files, and `LogCrcMismatch` when the
    /// pending transaction log fails validation.
    pub(crate) fn open(path: &Path, opts: &Options) -> Result<Pager> {
        let file_exists = path.exists();
        if file_exists {
            debug!(path = %path.display(), "database file already exists");
        } else {
            debug!(path = %path.display(), "database file does not exist");
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(opts.file_mode)
            .open(path)
            .map_err(|source| Error::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        lock_file(&file, path)?;

        let file_len = file.metadata()?.len();
        let size = file_len.max(MIN_FILE_SIZE);
        if file_len < size {
            file.set_len(size)?;
        }
        info!(path = %path.display(), size, "open database file");

        let tlog_path = opts
            .tx_log_path
            .clone()
            .unwrap_or_else(|| path.with_extension("tlog"));
        let mut txlog = TxLog::open(&tlog_path, opts.file_mode, opts.page_size)?;

        if file_exists && file_len > 0 && opts.enable_recovery {
            let mut replayed = 0u64;
            txlog.recover(|offset, page| {
                file.write_all_at(&page.data, offset)
                    .map_err(|source| Error::PageWrite {
                        page: page.number,
                        source,
                    })?;
                replayed += 1;
                Ok(())
            })?;
            if replayed > 0 {
                info!(pages = replayed, "replayed transaction log");
                fdatasync(&file)?;
            }
        }

        let mut pager = Pager {
            file,
            path: path.to_path_buf(),
            size,
            max_pages: size / opts.page_size,
            page_size: opts.page_size,
            meta: Meta::new(opts.page_size),
            freelist: Freelist::new(opts.page_size, size / opts.page_size),
            txlog,
            before_set_page: None,
        };

        if file_exists && file_len > 0 {
            pager.meta = pager.read_meta()?;
            if pager.meta.page_size != pager.page_size {
                pager.page_size = pager.meta.page_size;
                pager.max_pages = pager.size / pager.page_size;
                pager.txlog.set_page_size(pager.page_size);
                pager.freelist = Freelist::new(pager.page_size, 0);
            }
            pager.read_freelist()?;
        } else {
            pager.write_meta()?;
            // A fresh freelist must reach the disk even though nothing has
            // been released yet, so a create-close-reopen cycle sees the
            // reserved-page high-water mark.
            pager.freelist.dirty = true;
            let pages = pager.write_freelist_pages()?;
            for page in &pages {
                pager.set_page(page)?;
            }
            fdatasync(&pager.file)?;
        }

        Ok(pager)
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.page_size
    }

    pub(crate) fn min_threshold(&self) -> f32 {
        MIN_FILL_PERCENT * self.page_size as f32
    }

    pub(crate) fn max_threshold(&self) -> f32 {
        MAX_FILL_PERCENT * self.page_size as f32
    }

    /// Hands out a zeroed page, growing the file when the freelist is out
    /// of page numbers.
    pub(crate) fn allocate_page(&mut self) -> Result<Page> {
        let number = match self.freelist.next_page_number() {
            Ok(number) => number,
            Err(Error::NoPagesLeft) => {
                debug!("no pages left, growing database file");
                self.grow()?;
                self.freelist.next_page_number()?
            }
            Err(err) => return Err(err),
        };
        debug!(page = number, "allocated page");
        Ok(Page::new(number, self.page_size as usize))
    }

    /// Returns a page to the freelist. Page 0 is never released.
    pub(crate) fn release_page(&mut self, number: PageId) -> Result<()> {
        if number == 0 {
            return Err(Error::ReleasePageZero);
        }
        self.freelist.release_page(number);
        Ok(())
    }

    /// Reads `page_size` bytes at the page's file offset into a fresh
    /// buffer. Mutating the returned page does not affect the file.
    pub(crate) fn get_page(&self, number: PageId) -> Result<Page> {
        if number >= self.max_pages {
            return Err(Error::PageOutOfRange {
                page: number,
                max: self.max_pages,
            });
        }
        let mut page = Page::new(number, self.page_size as usize);
        self.file
            .read_exact_at(&mut page.data, number * self.page_size)
            .map_err(|source| Error::PageRead {
                page: number,
                source,
            })?;
        Ok(page)
    }

    /// Persists a page: through the transaction log while a commit has it
    /// active, in place otherwise. The `before_set_page` hook runs first
    /// and may abort the write.
    pub(crate) fn set_page(&mut self, page: &Page) -> Result<()> {
        if let Some(hook) = &self.before_set_page {
            hook(page, self.txlog.active)?;
        }
        let offset = page.number * self.page_size;
        if self.txlog.active {
            self.txlog.write_page(offset, page)
        } else {
            self.file
                .write_all_at(&page.data, offset)
                .map_err(|source| Error::PageWrite {
                    page: page.number,
                    source,
                })
        }
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|source| Error::FileSync { source })
    }

    fn grow(&mut self) -> Result<()> {
        let new_size = if self.size < ONE_GIGABYTE as u64 {
            self.size * 2
        } else {
            self.size + ONE_GIGABYTE as u64
        };
        info!(old_size = self.size, new_size, "growing database file");
        self.file.set_len(new_size)?;
        self.size = new_size;
        self.max_pages = new_size / self.page_size;
        self.freelist.max_pages = self.max_pages;
        Ok(())
    }

    fn read_meta(&self) -> Result<Meta> {
        let page = self.get_page(META_PAGE_NUMBER)?;
        let meta = Meta::deserialize(&page.data)?;
        debug!(root = meta.root, version = %meta.version_string(), "read meta page");
        Ok(meta)
    }

    pub(crate) fn write_meta(&mut self) -> Result<()> {
        let page = self.meta_page();
        debug!(root = self.meta.root, "write meta page");
        self.set_page(&page)
    }

    /// Serializes the current meta into a page buffer.
    pub(crate) fn meta_page(&self) -> Page {
        let mut page = Page::new(META_PAGE_NUMBER, self.page_size as usize);
        self.meta.serialize(&mut page.data);
        page
    }

    /// Walks the freelist chain from the meta-declared first page.
    fn read_freelist(&mut self) -> Result<()> {
        let mut freelist = Freelist::new(self.page_size, 0);
        freelist.freelist_pages = vec![self.meta.freelist_page_number];

        let first = self.get_page(self.meta.freelist_page_number)?;
        let (total, mut next) = freelist.decode_first_page(&first.data);

        while next != 0 && (freelist.released_pages.len() as u64) < total {
            freelist.freelist_pages.push(next);
            let page = self.get_page(next)?;
            next = freelist.decode_extra_page(&page.data, total);
        }

        debug!(
            current_page = freelist.current_page,
            released = freelist.released_pages.len(),
            pages_read = freelist.freelist_pages.len(),
            "read freelist"
        );
        self.freelist = freelist;
        Ok(())
    }

    /// Serializes the freelist into page buffers, growing or shrinking its
    /// page chain as needed, and clears the dirty flag.
    ///
    /// Returns an empty vector when the freelist is clean.
    pub(crate) fn write_freelist_pages(&mut self) -> Result<Vec<Page>> {
        if !self.freelist.dirty {
            return Ok(Vec::new());
        }
        let pages_needed = self.freelist.pages_needed();

        if self.freelist.freelist_pages.is_empty() {
            self.freelist
                .freelist_pages
                .push(self.meta.freelist_page_number);
        } else if self.freelist.freelist_pages[0] != self.meta.freelist_page_number {
            self.freelist.freelist_pages[0] = self.meta.freelist_page_number;
        }

        while self.freelist.freelist_pages.len() < pages_needed {
            let page = self.allocate_page()?;
            self.freelist.freelist_pages.push(page.number);
        }
        if pages_needed < self.freelist.freelist_pages.len() {
            for index in pages_needed..self.freelist.freelist_pages.len() {
                let excess = self.freelist.freelist_pages[index];
                debug!(page = excess, "freelist drops its own page");
                self.release_page(excess)?;
            }
            self.freelist.freelist_pages.truncate(pages_needed);
        }

        let chain = self.freelist.freelist_pages.clone();
        let mut pages = Vec::with_capacity(chain.len());
        let mut entry_index = 0usize;
        for (position, &page_number) in chain.iter().enumerate() {
            let mut page = Page::new(page_number, self.page_size as usize);
            let next = if position + 1 < chain.len() {
                chain[position + 1]
            } else {
                0
            };
            let written = if position == 0 {
                self.freelist.encode_first_page(&mut page.data, next)
            } else {
                self.freelist
                    .encode_extra_page(&mut page.data, next, entry_index)
            };
            entry_index += written;
            pages.push(page);
        }

        debug!(
            released = self.freelist.released_pages.len(),
            pages_used = chain.len(),
            "write freelist"
        );
        self.freelist.dirty = false;
        Ok(pages)
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        // SAFETY: flock on a valid open descriptor.
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(path = %self.path.display(), "released database file lock");
    }
}

fn lock_file(file: &File, path: &Path) -> Result<()> {
    // SAFETY: flock on a valid open descriptor.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        return Err(Error::FileLock {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// fdatasync on Unix; faster than fsync because it skips file metadata.
pub(crate) fn fdatasync(file: &File) -> Result<()> {
    // SAFETY: fdatasync is a standard POSIX call, safe with a valid fd.
    let ret = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if ret != 0 {
        return Err(Error::FileSync {
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
