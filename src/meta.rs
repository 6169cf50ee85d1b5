//! Summary: Meta page describing file identity, version, and roots.
//! Copyright (c) YOAB. All rights reserved.

use tracing::warn;

use crate::error::{Error, Result};
use crate::page::{read_u16, read_u64, write_u16, write_u64, PageId, PageType};

// Meta page map
// 0            1            8            10                       18                       26
// +------------+------------+------------+------------------------+------------------------+------------------------+
// | Page Type  | DB Name    | DB Version |       Root Page        |     Freelist Page      |      Page Size         |
// |  uint8     |  7 bytes   |  uint16    |        uint64          |        uint64          |        uint64          |
// +------------+------------+------------+------------------------+------------------------+------------------------+

/// Magic name identifying pirin database files.
pub(crate) const DB_NAME: &[u8; 7] = b"pirindb";

/// Current file format major version. A major mismatch refuses to open.
pub(crate) const DB_VERSION_MAJOR: u8 = 0;

/// Current file format minor version. Minor differences are compatible.
pub(crate) const DB_VERSION_MINOR: u8 = 1;

/// Page number of the meta page.
pub(crate) const META_PAGE_NUMBER: PageId = 0;

/// Page number of the first freelist page.
pub(crate) const FREELIST_PAGE_NUMBER: PageId = 1;

/// Page number of the initial root bucket node.
pub(crate) const ROOT_PAGE_NUMBER: PageId = 2;

const DB_NAME_OFFSET: usize = 1;
const DB_VERSION_OFFSET: usize = DB_NAME_OFFSET + DB_NAME.len();
const ROOT_OFFSET: usize = DB_VERSION_OFFSET + 2;
const FREELIST_OFFSET: usize = ROOT_OFFSET + 8;
const PAGE_SIZE_OFFSET: usize = FREELIST_OFFSET + 8;

/// The singleton meta header, serialized at page 0.
///
/// Created on first open and rewritten on every commit.
#[derive(Debug, Clone)]
pub(crate) struct Meta {
    db_name: [u8; 7],
    db_version: u16,
    pub(crate) root: PageId,
    pub(crate) freelist_page_number: PageId,
    pub(crate) page_size: u64,
}

impl Meta {
    pub(crate) fn new(page_size: u64) -> Meta {
        Meta {
            db_name: *DB_NAME,
            db_version: u16::from(DB_VERSION_MAJOR) << 8 | u16::from(DB_VERSION_MINOR),
            root: ROOT_PAGE_NUMBER,
            freelist_page_number: FREELIST_PAGE_NUMBER,
            page_size,
        }
    }

    /// Returns the (major, minor) file format version.
    pub(crate) fn version(&self) -> (u8, u8) {
        ((self.db_version >> 8) as u8, (self.db_version & 0xff) as u8)
    }

    pub(crate) fn version_string(&self) -> String {
        let (major, minor) = self.version();
        format!("{major}.{minor}")
    }

    pub(crate) fn serialize(&self, data: &mut [u8]) {
        data[0] = PageType::Meta as u8;
        data[DB_NAME_OFFSET..DB_NAME_OFFSET + DB_NAME.len()].copy_from_slice(&self.db_name);
        write_u16(data, DB_VERSION_OFFSET, self.db_version);
        write_u64(data, ROOT_OFFSET, self.root);
        write_u64(data, FREELIST_OFFSET, self.freelist_page_number);
        write_u64(data, PAGE_SIZE_OFFSET, self.page_size);
    }

    /// Parses page 0, validating the magic name and the major version.
    ///
    /// # Errors
    ///
    /// Returns `BadDbName` when the magic name does not match, and
    /// `BadDbVersion` when the major version differs.
    pub(crate) fn deserialize(data: &[u8]) -> Result<Meta> {
        if data[0] != PageType::Meta as u8 {
            warn!(tag = data[0], "page type is not a meta page");
        }
        let mut db_name = [0u8; 7];
        db_name.copy_from_slice(&data[DB_NAME_OFFSET..DB_NAME_OFFSET + DB_NAME.len()]);
        if &db_name != DB_NAME {
            return Err(Error::BadDbName);
        }
        let db_version = read_u16(data, DB_VERSION_OFFSET);
        if db_version >> 8 != u16::from(DB_VERSION_MAJOR) {
            return Err(Error::BadDbVersion);
        }
        Ok(Meta {
            db_name,
            db_version,
            root: read_u64(data, ROOT_OFFSET),
            freelist_page_number: read_u64(data, FREELIST_OFFSET),
            page_size: read_u64(data, PAGE_SIZE_OFFSET),
        })
    }
}
