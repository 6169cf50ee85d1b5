//! Summary: Embedded page-based key-value storage engine.
//! Copyright (c) YOAB. All rights reserved.
//!
//! pirin stores named buckets of ordered byte-string keys in a single
//! file of fixed-size pages. Each bucket is its own B-tree; values too
//! large for a node spill into linked blob-page chains. Transactions are
//! ACID with single-writer / multi-reader concurrency, and every commit
//! is journaled through a double-write transaction log so a crash at any
//! point is recovered on the next open.
//!
//! # Example
//!
//! ```no_run
//! use pirin::{Database, Options};
//!
//! # fn main() -> pirin::Result<()> {
//! let db = Database::open("app.db", Options::default())?;
//! db.update(|tx| {
//!     let mut bucket = tx.create_bucket(b"users")?;
//!     bucket.put(b"id", b"1234")
//! })?;
//! db.view(|tx| {
//!     let bucket = tx.get_bucket(b"users")?;
//!     assert_eq!(bucket.get(b"id"), Some(b"1234".to_vec()));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod blob;
mod bucket;
mod cursor;
mod db;
mod error;
mod freelist;
mod meta;
mod node;
mod page;
mod pager;
mod tx;
mod txlog;

pub use bucket::{Bucket, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use cursor::Cursor;
pub use db::{BucketStat, Database, DbStat, Options};
pub use error::{Error, Result};
pub use page::{PageId, PageType, PAGE_SIZE};
pub use tx::Tx;
