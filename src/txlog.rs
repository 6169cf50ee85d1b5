//! Summary: Double-write transaction log with CRC32 validation.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every commit streams its dirty pages into this side-car file before
//! rewriting them in place. A crash between the two passes is healed on
//! the next open by replaying the log, which rewrites the same bytes at
//! the same offsets and is therefore idempotent.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::debug;

use crate::error::{Error, Result};
use crate::page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, Page};
use crate::pager::fdatasync;

// TxLog header map
// 0            8            10       14
// +------------+------------+--------+
// | Num Pages  | Page Size  |  CRC   |
// |  uint64    |  uint16    | uint32 |
// +------------+------------+--------+

// TxLog record map
// 0         8               16             16 + page size
// +---------+---------------+--------------------+ ... N records
// | offset  | Page Number   |      Page data     |
// | uint64  |   uint64      |       uint8[]      |
// +---------+---------------+--------------------+

pub(crate) const TXLOG_HEADER_SIZE: usize = 14;
pub(crate) const TXLOG_RECORD_HEADER_SIZE: usize = 16;

/// Side-car journal for a single write transaction.
///
/// While `active`, the pager routes every `set_page` here instead of the
/// main file. `leave` finalizes the header (page count + CRC) and fsyncs;
/// only then may the in-place pass begin.
pub(crate) struct TxLog {
    file: File,
    path: PathBuf,
    page_size: u64,
    num_pages: u64,
    cursor: u64,
    crc: Hasher,
    pub(crate) active: bool,
}

impl TxLog {
    pub(crate) fn open(path: &Path, file_mode: u32, page_size: u64) -> Result<TxLog> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(file_mode)
            .open(path)
            .map_err(|source| Error::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(TxLog {
            file,
            path: path.to_path_buf(),
            page_size,
            num_pages: 0,
            cursor: 0,
            crc: Hasher::new(),
            active: false,
        })
    }

    pub(crate) fn set_page_size(&mut self, page_size: u64) {
        self.page_size = page_size;
    }

    /// Starts a new journal scope: truncates the file, seeks past the
    /// header, and resets the running CRC.
    pub(crate) fn enter(&mut self) -> Result<()> {
        debug!(path = %self.path.display(), "entering transaction log scope");
        self.file.set_len(0)?;
        self.cursor = TXLOG_HEADER_SIZE as u64;
        self.num_pages = 0;
        self.crc = Hasher::new();
        self.active = true;
        Ok(())
    }

    /// Appends one (offset, page number, page bytes) record.
    pub(crate) fn write_page(&mut self, offset: u64, page: &Page) -> Result<()> {
        let mut header = [0u8; TXLOG_RECORD_HEADER_SIZE];
        write_u64(&mut header, 0, offset);
        write_u64(&mut header, 8, page.number);
        self.file.write_all_at(&header, self.cursor)?;
        self.crc.update(&header);
        self.file
            .write_all_at(&page.data, self.cursor + TXLOG_RECORD_HEADER_SIZE as u64)?;
        self.crc.update(&page.data);
        self.cursor += (TXLOG_RECORD_HEADER_SIZE + page.data.len()) as u64;
        self.num_pages += 1;
        Ok(())
    }

    /// Finalizes the header with the record count and CRC, then fsyncs.
    ///
    /// The log is deactivated even when finalization fails, so the pager
    /// falls back to in-place writes instead of appending to a dead scope.
    pub(crate) fn leave(&mut self) -> Result<()> {
        let result = self.finalize();
        self.active = false;
        result
    }

    fn finalize(&mut self) -> Result<()> {
        let mut header = [0u8; TXLOG_HEADER_SIZE];
        write_u64(&mut header, 0, self.num_pages);
        write_u16(&mut header, 8, self.page_size as u16);
        write_u32(&mut header, 10, self.crc.clone().finalize());
        self.file.write_all_at(&header, 0)?;
        fdatasync(&self.file)
    }

    /// Replays a previously finalized log through `callback`.
    ///
    /// The CRC is recomputed over the whole record region and compared to
    /// the header before any record is surfaced. Each record must write at
    /// `page_number * page_size`; a disagreeing offset is corruption.
    ///
    /// # Errors
    ///
    /// Returns `LogCrcMismatch` when the stored checksum disagrees with
    /// the contents, and `LogCorrupted` for truncated or inconsistent
    /// records. An empty log is not an error.
    pub(crate) fn recover(
        &mut self,
        mut callback: impl FnMut(u64, &Page) -> Result<()>,
    ) -> Result<()> {
        let total_size = self.file.metadata()?.len();
        if total_size == 0 {
            return Ok(());
        }

        let mut header = [0u8; TXLOG_HEADER_SIZE];
        self.file.read_exact_at(&mut header, 0)?;
        let num_pages = read_u64(&header, 0);
        let page_size = read_u16(&header, 8) as usize;
        let expected_crc = read_u32(&header, 10);

        if total_size <= TXLOG_HEADER_SIZE as u64 {
            return Ok(());
        }
        let mut data = vec![0u8; (total_size - TXLOG_HEADER_SIZE as u64) as usize];
        self.file.read_exact_at(&mut data, TXLOG_HEADER_SIZE as u64)?;

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            return Err(Error::LogCrcMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let record_size = TXLOG_RECORD_HEADER_SIZE + page_size;
        let mut cursor = 0usize;
        for _ in 0..num_pages {
            if page_size == 0 || cursor + record_size > data.len() {
                return Err(Error::LogCorrupted {
                    reason: format!("record at byte {cursor} extends past the end of the log"),
                });
            }
            let offset = read_u64(&data, cursor);
            let page_number = read_u64(&data, cursor + 8);
            if offset != page_number * page_size as u64 {
                return Err(Error::LogCorrupted {
                    reason: format!("record offset {offset} does not match page {page_number}"),
                });
            }
            let mut page = Page::new(page_number, page_size);
            page.data
                .copy_from_slice(&data[cursor + TXLOG_RECORD_HEADER_SIZE..cursor + record_size]);
            callback(offset, &page)?;
            cursor += record_size;
        }
        Ok(())
    }
}
