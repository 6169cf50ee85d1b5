//! Summary: Transactions: dirty-set buffering and two-phase commit.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A write transaction never touches the file directly. Mutations land in
//! its dirty sets, and commit streams every affected page through the
//! transaction log (durably, with a CRC) before rewriting the same bytes
//! in place. A crash between the two passes is healed by log replay on
//! the next open.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::bucket::{Bucket, BucketRecord};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::node::{Item, Node};
use crate::page::{Page, PageId};
use crate::pager::Pager;

pub(crate) enum TxGuard<'db> {
    Read(RwLockReadGuard<'db, Pager>),
    Write(RwLockWriteGuard<'db, Pager>),
}

/// A transaction over the database.
///
/// Write transactions hold the exclusive lock for their whole lifetime;
/// read transactions share the lock with other readers. Dropping an
/// unfinished transaction rolls it back.
pub struct Tx<'db> {
    db: &'db Database,
    guard: RefCell<TxGuard<'db>>,
    pub(crate) write: bool,
    dirty_nodes: RefCell<HashMap<PageId, Node>>,
    dirty_pages: RefCell<HashMap<PageId, Page>>,
    dirty_buckets: RefCell<HashMap<Vec<u8>, BucketRecord>>,
    pages_to_delete: RefCell<Vec<PageId>>,
    allocated_pages: RefCell<Vec<PageId>>,
    meta_snapshot: Option<Meta>,
    closed: Cell<bool>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db Database, write: bool) -> Tx<'db> {
        let (guard, meta_snapshot) = if write {
            let pager = db.state.write();
            let snapshot = pager.meta.clone();
            (TxGuard::Write(pager), Some(snapshot))
        } else {
            let pager = db.state.read();
            db.readers.fetch_add(1, Ordering::SeqCst);
            (TxGuard::Read(pager), None)
        };
        Tx {
            db,
            guard: RefCell::new(guard),
            write,
            dirty_nodes: RefCell::new(HashMap::new()),
            dirty_pages: RefCell::new(HashMap::new()),
            dirty_buckets: RefCell::new(HashMap::new()),
            pages_to_delete: RefCell::new(Vec::new()),
            allocated_pages: RefCell::new(Vec::new()),
            meta_snapshot,
            closed: Cell::new(false),
        }
    }

    pub(crate) fn ensure_write(&self) -> Result<()> {
        if self.write {
            Ok(())
        } else {
            Err(Error::WriteInReadTx)
        }
    }

    pub(crate) fn with_pager<R>(&self, f: impl FnOnce(&Pager) -> R) -> R {
        match &*self.guard.borrow() {
            TxGuard::Read(pager) => f(pager),
            TxGuard::Write(pager) => f(pager),
        }
    }

    pub(crate) fn with_pager_mut<R>(&self, f: impl FnOnce(&mut Pager) -> Result<R>) -> Result<R> {
        match &mut *self.guard.borrow_mut() {
            TxGuard::Read(_) => Err(Error::WriteInReadTx),
            TxGuard::Write(pager) => f(pager),
        }
    }

    pub(crate) fn page_size(&self) -> u64 {
        self.with_pager(|pager| pager.page_size())
    }

    pub(crate) fn min_threshold(&self) -> f32 {
        self.with_pager(|pager| pager.min_threshold())
    }

    pub(crate) fn max_threshold(&self) -> f32 {
        self.with_pager(|pager| pager.max_threshold())
    }

    pub(crate) fn meta_root(&self) -> PageId {
        self.with_pager(|pager| pager.meta.root)
    }

    pub(crate) fn set_meta_root(&self, root: PageId) {
        if let TxGuard::Write(pager) = &mut *self.guard.borrow_mut() {
            pager.meta.root = root;
        }
    }

    /// Allocates a zeroed page and records it for rollback.
    pub(crate) fn allocate_page(&self) -> Result<Page> {
        let page = self.with_pager_mut(|pager| pager.allocate_page())?;
        self.allocated_pages.borrow_mut().push(page.number);
        Ok(page)
    }

    /// Builds a node over a freshly allocated page.
    pub(crate) fn new_node(&self, items: Vec<Item>, children: Vec<PageId>) -> Result<Node> {
        let page = self.allocate_page()?;
        Ok(Node {
            page_num: page.number,
            items,
            children,
        })
    }

    /// Fetches a node, preferring the transaction's dirty copy.
    pub(crate) fn get_node(&self, page_num: PageId) -> Result<Node> {
        if let Some(node) = self.dirty_nodes.borrow().get(&page_num) {
            return Ok(node.clone());
        }
        let page = self.with_pager(|pager| pager.get_page(page_num))?;
        let mut node = Node::deserialize(&page.data);
        node.page_num = page_num;
        Ok(node)
    }

    pub(crate) fn set_node(&self, node: &Node) {
        self.dirty_nodes
            .borrow_mut()
            .insert(node.page_num, node.clone());
    }

    /// Fetches a raw page, preferring the transaction's dirty copy.
    pub(crate) fn get_page(&self, page_num: PageId) -> Result<Page> {
        if let Some(page) = self.dirty_pages.borrow().get(&page_num) {
            return Ok(page.clone());
        }
        self.with_pager(|pager| pager.get_page(page_num))
    }

    pub(crate) fn set_page(&self, page: Page) {
        self.dirty_pages.borrow_mut().insert(page.number, page);
    }

    /// Schedules a page for release at commit time.
    pub(crate) fn delete_page(&self, page_num: PageId) {
        self.pages_to_delete.borrow_mut().push(page_num);
    }

    pub(crate) fn record_dirty_bucket(&self, name: Vec<u8>, record: BucketRecord) {
        self.dirty_buckets.borrow_mut().insert(name, record);
    }

    /// The unnamed bucket whose tree holds every bucket record.
    pub(crate) fn root_bucket(&self) -> Bucket<'_, 'db> {
        Bucket::new_root(self, self.meta_root())
    }

    /// Creates a new empty bucket.
    ///
    /// # Errors
    ///
    /// Returns `BucketExists` when the name is taken and
    /// `WriteInReadTx` in a read-only transaction.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.ensure_write()?;
        if self.get_bucket(name).is_ok() {
            return Err(Error::BucketExists);
        }
        let node = self.new_node(Vec::new(), Vec::new())?;
        self.set_node(&node);
        let bucket = Bucket::with_record(
            self,
            name,
            BucketRecord {
                root: node.page_num,
                ..BucketRecord::default()
            },
        );
        bucket.sync_to_tx();
        let mut root = self.root_bucket();
        root.put(name, &bucket.record().serialize())?;
        Ok(bucket)
    }

    /// Looks up an existing bucket by name.
    ///
    /// In a write transaction the bucket is tracked as dirty so its
    /// updated root and counters are rewritten on commit.
    ///
    /// # Errors
    ///
    /// Returns `BucketNotFound` when no record exists under `name`.
    pub fn get_bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        let root = self.root_bucket();
        let value = root.get(name).ok_or(Error::BucketNotFound)?;
        let bucket = Bucket::with_record(self, name, BucketRecord::deserialize(&value));
        if self.write {
            bucket.sync_to_tx();
        }
        Ok(bucket)
    }

    /// `create_bucket` that treats "already exists" as `get_bucket`.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        match self.create_bucket(name) {
            Err(Error::BucketExists) => self.get_bucket(name),
            other => other,
        }
    }

    /// Removes the bucket record from the root bucket.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.ensure_write()?;
        self.dirty_buckets.borrow_mut().remove(name);
        let mut root = self.root_bucket();
        root.remove(name)
    }

    /// All bucket names in ascending byte order.
    pub fn buckets(&self) -> Vec<Vec<u8>> {
        let root = self.root_bucket();
        let mut cursor = root.cursor();
        let mut names = Vec::new();
        let mut entry = cursor.first();
        while let Some((key, _)) = entry {
            names.push(key);
            entry = cursor.next();
        }
        names
    }

    /// Commits the transaction.
    ///
    /// Write path: materializes dirty bucket records into the root bucket,
    /// serializes every dirty page once, streams the buffers through the
    /// transaction log (finalized with a CRC and fsync), then rewrites
    /// them in place. Read path is equivalent to rollback.
    ///
    /// # Errors
    ///
    /// A failure before the log is finalized loses the transaction but
    /// leaves the file untouched; a failure during the in-place pass is
    /// healed by replay on the next open.
    pub fn commit(self) -> Result<()> {
        if !self.write {
            self.finish_read();
            return Ok(());
        }
        let result = self.commit_write();
        if result.is_ok() {
            self.closed.set(true);
        }
        result
    }

    /// Discards the transaction. Write path returns every page allocated
    /// during the transaction to the freelist and restores the meta
    /// snapshot taken at begin.
    pub fn rollback(self) {
        // Drop performs the cleanup.
    }

    fn finish_read(&self) {
        if !self.closed.get() {
            self.closed.set(true);
            self.db.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn commit_write(&self) -> Result<()> {
        // Materialize every dirty bucket's record into the root bucket.
        // This may dirty more nodes, so it happens before page collection.
        let records: Vec<(Vec<u8>, BucketRecord)> = self
            .dirty_buckets
            .borrow()
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        {
            let mut root = self.root_bucket();
            for (name, record) in &records {
                root.put(name, &record.serialize())?;
            }
        }

        let page_size = self.page_size() as usize;
        let mut pages: Vec<Page> = Vec::new();

        let mut nodes: Vec<Node> = self
            .dirty_nodes
            .borrow_mut()
            .drain()
            .map(|(_, node)| node)
            .collect();
        nodes.sort_by_key(|node| node.page_num);
        for node in &nodes {
            let mut page = Page::new(node.page_num, page_size);
            node.serialize(&mut page.data)?;
            pages.push(page);
        }

        let mut raw_pages: Vec<Page> = self
            .dirty_pages
            .borrow_mut()
            .drain()
            .map(|(_, page)| page)
            .collect();
        raw_pages.sort_by_key(|page| page.number);
        pages.append(&mut raw_pages);

        let deleted: Vec<PageId> = self.pages_to_delete.borrow_mut().drain(..).collect();

        self.with_pager_mut(|pager| {
            for page_num in deleted {
                pager.freelist.release_page(page_num);
            }
            let mut freelist_pages = pager.write_freelist_pages()?;
            pages.append(&mut freelist_pages);
            pages.push(pager.meta_page());

            // First pass: every page goes to the transaction log.
            pager.txlog.enter()?;
            let mut log_error = None;
            for page in &pages {
                if let Err(err) = pager.set_page(page) {
                    log_error = Some(err);
                    break;
                }
            }
            let leave_result = pager.txlog.leave();
            if let Some(err) = log_error {
                return Err(err);
            }
            leave_result?;

            // Second pass: the log is durable, rewrite the pages in place.
            for page in &pages {
                pager.set_page(page)?;
            }
            Ok(())
        })?;

        self.allocated_pages.borrow_mut().clear();
        self.dirty_buckets.borrow_mut().clear();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_before_set_page(&self, hook: crate::pager::SetPageHook) {
        if let TxGuard::Write(pager) = &mut *self.guard.borrow_mut() {
            pager.before_set_page = Some(hook);
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);
        if !self.write {
            self.db.readers.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.dirty_nodes.borrow_mut().clear();
        self.dirty_pages.borrow_mut().clear();
        self.dirty_buckets.borrow_mut().clear();
        self.pages_to_delete.borrow_mut().clear();
        let allocated = std::mem::take(&mut *self.allocated_pages.borrow_mut());
        let snapshot = self.meta_snapshot.take();
        if let TxGuard::Write(pager) = &mut *self.guard.borrow_mut() {
            for page_num in allocated {
                // A failed commit may already have released pages this
                // transaction also allocated; released numbers stay unique.
                if !pager.freelist.released_pages.contains(&page_num) {
                    pager.freelist.release_page(page_num);
                }
            }
            if let Some(meta) = snapshot {
                pager.meta = meta;
            }
        }
    }
}
