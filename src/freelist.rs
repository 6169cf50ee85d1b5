//! Summary: Released-page tracking and on-disk freelist chain.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The freelist tracks pages that have been released and the high-water
//! "next never allocated" page number. Released pages are reused in LIFO
//! order before the file is grown. On disk the freelist occupies a linked
//! chain of one or more freelist pages.

use tracing::debug;

use crate::error::{Error, Result};
use crate::meta::ROOT_PAGE_NUMBER;
use crate::page::{read_u64, write_u64, PageId, PageType};

// Freelist first page map
// 0            1                        9                        17                       25                       33
// +------------+------------------------+------------------------+------------------------+------------------------+----------------------+
// | Page Type  |      Next Page         |    Current Page        |      Max Pages         |  Num Freelist Entries  |   Freelist Entries   |
// |  uint8     |       uint64           |        uint64          |        uint64          |        uint64          |   uint64[]           |
// +------------+------------------------+------------------------+------------------------+------------------------+----------------------+

// Freelist extra page map
// 0            1                        9
// +------------+------------------------+---------------------+
// | Page Type  |      Next Page         |  Freelist Entries   |
// |  uint8     |       uint64           |     uint64[]        |
// +------------+------------------------+---------------------+

const NEXT_PAGE_OFFSET: usize = 1;
const CURRENT_PAGE_OFFSET: usize = NEXT_PAGE_OFFSET + 8;
const MAX_PAGES_OFFSET: usize = CURRENT_PAGE_OFFSET + 8;
const NUM_ENTRIES_OFFSET: usize = MAX_PAGES_OFFSET + 8;
pub(crate) const FIRST_PAGE_ENTRIES_OFFSET: usize = NUM_ENTRIES_OFFSET + 8;
pub(crate) const EXTRA_PAGE_ENTRIES_OFFSET: usize = NEXT_PAGE_OFFSET + 8;

/// Tracks released pages and the allocation high-water mark.
#[derive(Debug)]
pub(crate) struct Freelist {
    /// Highest page number ever allocated.
    pub(crate) current_page: PageId,
    /// Capacity in pages derived from the current file size.
    pub(crate) max_pages: u64,
    /// Released page numbers, reused in LIFO order.
    pub(crate) released_pages: Vec<PageId>,
    /// Pages the freelist itself occupies; index 0 is the meta-declared one.
    pub(crate) freelist_pages: Vec<PageId>,
    entries_per_first_page: usize,
    entries_per_extra_page: usize,
    pub(crate) dirty: bool,
}

impl Freelist {
    pub(crate) fn new(page_size: u64, max_pages: u64) -> Freelist {
        let (entries_per_first_page, entries_per_extra_page) = Self::capacities(page_size as usize);
        Freelist {
            current_page: ROOT_PAGE_NUMBER,
            max_pages,
            released_pages: Vec::new(),
            freelist_pages: Vec::new(),
            entries_per_first_page,
            entries_per_extra_page,
            dirty: false,
        }
    }

    /// Entry capacity of the first and of each overflow freelist page.
    pub(crate) fn capacities(page_size: usize) -> (usize, usize) {
        let first = (page_size - FIRST_PAGE_ENTRIES_OFFSET) / 8 - 1;
        let extra = (page_size - EXTRA_PAGE_ENTRIES_OFFSET) / 8 - 1;
        (first, extra)
    }

    /// Hands out the next usable page number.
    ///
    /// Released pages are reused first (LIFO); otherwise the high-water
    /// mark advances.
    ///
    /// # Errors
    ///
    /// Returns `NoPagesLeft` when the high-water mark reaches capacity;
    /// the caller is expected to grow the file and retry.
    pub(crate) fn next_page_number(&mut self) -> Result<PageId> {
        self.dirty = true;
        if let Some(page) = self.released_pages.pop() {
            return Ok(page);
        }
        if self.current_page >= self.max_pages.saturating_sub(1) {
            return Err(Error::NoPagesLeft);
        }
        self.current_page += 1;
        debug!(page = self.current_page, "freelist hands out fresh page");
        Ok(self.current_page)
    }

    /// Marks a page as released and available for reuse.
    pub(crate) fn release_page(&mut self, page: PageId) {
        self.dirty = true;
        debug!(page, "releasing page");
        self.released_pages.push(page);
    }

    /// Number of freelist pages needed to hold the current entry count.
    pub(crate) fn pages_needed(&self) -> usize {
        let entries = self.released_pages.len();
        if entries <= self.entries_per_first_page {
            return 1;
        }
        1 + (entries - self.entries_per_first_page).div_ceil(self.entries_per_extra_page)
    }

    /// Serializes the header page of the chain. Returns entries written.
    pub(crate) fn encode_first_page(&self, data: &mut [u8], next: PageId) -> usize {
        data[0] = PageType::Freelist as u8;
        write_u64(data, NEXT_PAGE_OFFSET, next);
        write_u64(data, CURRENT_PAGE_OFFSET, self.current_page);
        write_u64(data, MAX_PAGES_OFFSET, self.max_pages);
        write_u64(data, NUM_ENTRIES_OFFSET, self.released_pages.len() as u64);
        write_entries(
            data,
            FIRST_PAGE_ENTRIES_OFFSET,
            &self.released_pages,
            0,
            self.entries_per_first_page,
        )
    }

    /// Serializes one overflow page of the chain. Returns entries written.
    pub(crate) fn encode_extra_page(&self, data: &mut [u8], next: PageId, start: usize) -> usize {
        data[0] = PageType::Freelist as u8;
        write_u64(data, NEXT_PAGE_OFFSET, next);
        write_entries(
            data,
            EXTRA_PAGE_ENTRIES_OFFSET,
            &self.released_pages,
            start,
            self.entries_per_extra_page,
        )
    }

    /// Parses the header page. Returns (total entry count, next page).
    pub(crate) fn decode_first_page(&mut self, data: &[u8]) -> (u64, PageId) {
        self.current_page = read_u64(data, CURRENT_PAGE_OFFSET);
        self.max_pages = read_u64(data, MAX_PAGES_OFFSET);
        let total = read_u64(data, NUM_ENTRIES_OFFSET);
        read_entries(
            data,
            FIRST_PAGE_ENTRIES_OFFSET,
            self.entries_per_first_page,
            &mut self.released_pages,
            total,
        );
        (total, read_u64(data, NEXT_PAGE_OFFSET))
    }

    /// Parses one overflow page. Returns the next page in the chain.
    pub(crate) fn decode_extra_page(&mut self, data: &[u8], total: u64) -> PageId {
        read_entries(
            data,
            EXTRA_PAGE_ENTRIES_OFFSET,
            self.entries_per_extra_page,
            &mut self.released_pages,
            total,
        );
        read_u64(data, NEXT_PAGE_OFFSET)
    }
}

fn write_entries(
    data: &mut [u8],
    start_pos: usize,
    entries: &[PageId],
    start_index: usize,
    max_entries: usize,
) -> usize {
    let mut pos = start_pos;
    let mut written = 0;
    while written < max_entries && start_index + written < entries.len() {
        write_u64(data, pos, entries[start_index + written]);
        pos += 8;
        written += 1;
    }
    written
}

fn read_entries(
    data: &[u8],
    start_pos: usize,
    max_entries: usize,
    entries: &mut Vec<PageId>,
    total: u64,
) {
    let mut pos = start_pos;
    for _ in 0..max_entries {
        if entries.len() as u64 >= total || pos + 8 > data.len() {
            break;
        }
        entries.push(read_u64(data, pos));
        pos += 8;
    }
}
