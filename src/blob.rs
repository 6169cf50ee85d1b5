//! Summary: Blob chains for values too large to live inside a node.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A blob is a singly linked chain of pages addressed by its first page.
//! The first page additionally records the total page count and the
//! payload byte length so readers can size their buffer up front.

use tracing::warn;

use crate::error::{Error, Result};
use crate::page::{read_u32, read_u64, write_u32, write_u64, PageId, PageType};
use crate::pager::ONE_GIGABYTE;
use crate::tx::Tx;

// Blob - first page
// 0            1            5                     9                        17
// +------------+------------+---------------------+------------------------+---------------------+
// | Page Type  | Page Count |     Data Size       |      Next Page         |       Data          |
// |   uint8    |   uint32   |      uint32         |       uint64           |     (bytes)         |
// +------------+------------+---------------------+------------------------+---------------------+

// Blob - extra page
// 0            1                        9
// +------------+------------------------+---------------------+
// | Page Type  |      Next Page         |       Data          |
// |   uint8    |       uint64           |     (bytes)         |
// +------------+------------------------+---------------------+

const PAGE_COUNT_OFFSET: usize = 1;
const DATA_SIZE_OFFSET: usize = PAGE_COUNT_OFFSET + 4;
const FIRST_NEXT_PAGE_OFFSET: usize = DATA_SIZE_OFFSET + 4;
const FIRST_DATA_OFFSET: usize = FIRST_NEXT_PAGE_OFFSET + 8;
const EXTRA_NEXT_PAGE_OFFSET: usize = 1;
const EXTRA_DATA_OFFSET: usize = EXTRA_NEXT_PAGE_OFFSET + 8;

/// Maximum blob payload size (1 GiB).
pub(crate) const MAX_BLOB_SIZE: usize = ONE_GIGABYTE;

/// Number of pages a payload of `data_len` bytes occupies.
pub(crate) fn calc_page_count(data_len: usize, page_size: usize) -> usize {
    let first_page_capacity = page_size - FIRST_DATA_OFFSET;
    let extra_page_capacity = page_size - EXTRA_DATA_OFFSET;
    if data_len <= first_page_capacity {
        return 1;
    }
    1 + (data_len - first_page_capacity).div_ceil(extra_page_capacity)
}

/// Writes `data` as a blob chain and returns its first page number.
///
/// Every page of the chain is pre-allocated first so each page can point
/// at its successor by number.
pub(crate) fn save_blob(tx: &Tx<'_>, data: &[u8]) -> Result<PageId> {
    if data.len() > MAX_BLOB_SIZE {
        return Err(Error::BlobTooLarge);
    }
    let page_size = tx.page_size() as usize;
    let page_count = calc_page_count(data.len(), page_size);

    let mut pages = Vec::with_capacity(page_count);
    for _ in 0..page_count {
        pages.push(tx.allocate_page()?);
    }

    let mut data_offset = 0usize;
    for page_index in 0..page_count {
        let next_page = if page_index + 1 < page_count {
            pages[page_index + 1].number
        } else {
            0
        };
        let page = &mut pages[page_index];
        page.data[0] = PageType::Blob as u8;

        let mut pos = EXTRA_NEXT_PAGE_OFFSET;
        if page_index == 0 {
            write_u32(&mut page.data, PAGE_COUNT_OFFSET, page_count as u32);
            write_u32(&mut page.data, DATA_SIZE_OFFSET, data.len() as u32);
            pos = FIRST_NEXT_PAGE_OFFSET;
        }
        write_u64(&mut page.data, pos, next_page);
        pos += 8;

        let capacity = page_size - pos;
        let to_copy = capacity.min(data.len() - data_offset);
        page.data[pos..pos + to_copy].copy_from_slice(&data[data_offset..data_offset + to_copy]);
        data_offset += to_copy;
    }

    let first_page = pages[0].number;
    for page in pages {
        tx.set_page(page);
    }
    Ok(first_page)
}

/// Reads a blob chain back into one contiguous buffer.
pub(crate) fn get_blob(tx: &Tx<'_>, first_page: PageId) -> Result<Vec<u8>> {
    let start = tx.get_page(first_page)?;
    if start.data[0] != PageType::Blob as u8 {
        warn!(tag = start.data[0], page = first_page, "page type is not a blob page");
    }
    let page_count = read_u32(&start.data, PAGE_COUNT_OFFSET) as usize;
    let data_len = read_u32(&start.data, DATA_SIZE_OFFSET) as usize;
    let mut next_page = read_u64(&start.data, FIRST_NEXT_PAGE_OFFSET);

    let mut data = vec![0u8; data_len];
    let mut bytes_remaining = data_len;
    let mut data_offset = 0usize;

    let first_chunk = bytes_remaining.min(start.data.len() - FIRST_DATA_OFFSET);
    data[..first_chunk].copy_from_slice(&start.data[FIRST_DATA_OFFSET..FIRST_DATA_OFFSET + first_chunk]);
    data_offset += first_chunk;
    bytes_remaining -= first_chunk;

    for _ in 1..page_count {
        let page = tx.get_page(next_page)?;
        if page.data[0] != PageType::Blob as u8 {
            warn!(tag = page.data[0], page = next_page, "page type is not a blob page");
        }
        next_page = read_u64(&page.data, EXTRA_NEXT_PAGE_OFFSET);

        let chunk = bytes_remaining.min(page.data.len() - EXTRA_DATA_OFFSET);
        data[data_offset..data_offset + chunk]
            .copy_from_slice(&page.data[EXTRA_DATA_OFFSET..EXTRA_DATA_OFFSET + chunk]);
        data_offset += chunk;
        bytes_remaining -= chunk;
    }

    Ok(data)
}

/// Walks a blob chain collecting its page numbers, releases every one,
/// and returns the payload byte length the chain held.
pub(crate) fn delete_blob(tx: &Tx<'_>, first_page: PageId) -> Result<usize> {
    let start = tx.get_page(first_page)?;
    let page_count = read_u32(&start.data, PAGE_COUNT_OFFSET) as usize;
    let data_len = read_u32(&start.data, DATA_SIZE_OFFSET) as usize;

    let mut pages = Vec::with_capacity(page_count);
    pages.push(first_page);
    let mut next_page = read_u64(&start.data, FIRST_NEXT_PAGE_OFFSET);
    for _ in 1..page_count {
        pages.push(next_page);
        let page = tx.get_page(next_page)?;
        next_page = read_u64(&page.data, EXTRA_NEXT_PAGE_OFFSET);
    }

    for page_number in pages {
        tx.delete_page(page_number);
    }
    Ok(data_len)
}
