//! Summary: Named buckets: ordered maps stored as their own B-trees.
//! Copyright (c) YOAB. All rights reserved.
//!
//! A bucket is a 40-byte record stored under its name in the database's
//! root bucket: the root page of the bucket's own tree, a monotonic
//! counter, and usage counters. The root bucket itself is unnamed and its
//! root page lives in the meta page.

use tracing::debug;

use crate::blob;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::{self, Item, ItemValue};
use crate::page::{read_u64, write_u64, PageId};
use crate::pager::ONE_GIGABYTE;
use crate::tx::Tx;

/// Maximum key length in bytes (exclusive).
pub const MAX_KEY_SIZE: usize = 512;

/// Largest value stored inline in a node; anything bigger becomes a blob.
pub const MAX_VALUE_SIZE: usize = 1024;

// Bucket value map
// 0            8            16          24          32            40
// +------------+------------+-----------+-----------+------------+
// |   Root     |  Counter   |   ItemN   |   BlobN   | BytesInUse |
// |  uint64    |  uint64    |  uint64   |  uint64   |  uint64    |
// +------------+------------+-----------+-----------+------------+

/// The persistent 40-byte bucket record.
#[derive(Debug, Clone, Default)]
pub(crate) struct BucketRecord {
    pub(crate) root: PageId,
    pub(crate) counter: u64,
    pub(crate) items_n: u64,
    pub(crate) blobs_n: u64,
    pub(crate) bytes_in_use: u64,
}

impl BucketRecord {
    pub(crate) const SIZE: usize = 40;

    pub(crate) fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        write_u64(&mut data, 0, self.root);
        write_u64(&mut data, 8, self.counter);
        write_u64(&mut data, 16, self.items_n);
        write_u64(&mut data, 24, self.blobs_n);
        write_u64(&mut data, 32, self.bytes_in_use);
        data
    }

    /// Short buffers decode to an empty record, matching a bucket that
    /// has never been written.
    pub(crate) fn deserialize(data: &[u8]) -> BucketRecord {
        if data.len() < Self::SIZE {
            return BucketRecord::default();
        }
        BucketRecord {
            root: read_u64(data, 0),
            counter: read_u64(data, 8),
            items_n: read_u64(data, 16),
            blobs_n: read_u64(data, 24),
            bytes_in_use: read_u64(data, 32),
        }
    }
}

/// A named ordered map bound to a transaction.
pub struct Bucket<'tx, 'db> {
    tx: &'tx Tx<'db>,
    name: Vec<u8>,
    root: PageId,
    counter: u64,
    items_n: u64,
    blobs_n: u64,
    bytes_in_use: u64,
}

impl<'tx, 'db> Bucket<'tx, 'db> {
    pub(crate) fn new_root(tx: &'tx Tx<'db>, root: PageId) -> Bucket<'tx, 'db> {
        Bucket {
            tx,
            name: Vec::new(),
            root,
            counter: 0,
            items_n: 0,
            blobs_n: 0,
            bytes_in_use: 0,
        }
    }

    pub(crate) fn with_record(
        tx: &'tx Tx<'db>,
        name: &[u8],
        record: BucketRecord,
    ) -> Bucket<'tx, 'db> {
        Bucket {
            tx,
            name: name.to_vec(),
            root: record.root,
            counter: record.counter,
            items_n: record.items_n,
            blobs_n: record.blobs_n,
            bytes_in_use: record.bytes_in_use,
        }
    }

    /// The root bucket is the unnamed one; its root page is tracked in
    /// the meta page rather than in a record.
    fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    pub(crate) fn record(&self) -> BucketRecord {
        BucketRecord {
            root: self.root,
            counter: self.counter,
            items_n: self.items_n,
            blobs_n: self.blobs_n,
            bytes_in_use: self.bytes_in_use,
        }
    }

    /// Pushes the current record into the transaction's dirty buckets so
    /// commit rewrites it. The root bucket persists through the meta page
    /// instead.
    pub(crate) fn sync_to_tx(&self) {
        if !self.is_root() {
            self.tx.record_dirty_bucket(self.name.clone(), self.record());
        }
    }

    /// Point lookup. Returns `None` for missing keys and on any read
    /// failure along the way.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.root == 0 {
            return None;
        }
        let search = node::find(self.tx, self.root, key, true).ok()??;
        let found = self.tx.get_node(search.page).ok()?;
        found.items.get(search.index)?.read_value(self.tx).ok()
    }

    /// Inserts or overwrites a key-value pair.
    ///
    /// Oversize values are spilled to a blob chain before the tree is
    /// touched, so a failure there leaves the tree unchanged. After the
    /// leaf insert the breadcrumb path is walked bottom-up and every
    /// over-populated node is split; an over-populated root is split
    /// under a fresh root node.
    ///
    /// # Errors
    ///
    /// Returns `KeyTooLarge` / `ValueTooLarge` for out-of-bounds inputs
    /// and `WriteInReadTx` in a read-only transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_write()?;
        if key.len() >= MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() >= ONE_GIGABYTE {
            return Err(Error::ValueTooLarge);
        }

        let encoded = if value.len() > MAX_VALUE_SIZE {
            let first_page = blob::save_blob(self.tx, value)?;
            ItemValue::Blob(first_page).encode()
        } else {
            ItemValue::Inline(value.to_vec()).encode()
        };
        let item = Item {
            key: key.to_vec(),
            value: encoded,
        };

        // First insert ever: create the bucket's root node.
        if self.root == 0 {
            let root = self.tx.new_node(vec![item], Vec::new())?;
            self.tx.set_node(&root);
            self.root = root.page_num;
            self.record_insert(key.len(), value.len());
            self.sync_to_tx();
            return Ok(());
        }

        let search =
            node::find(self.tx, self.root, key, false)?.ok_or(Error::NodeNotFound)?;
        let mut target = self.tx.get_node(search.page)?;
        let key_exists = search.exact;
        if key_exists {
            target.items[search.index] = item;
        } else {
            target.insert_item_at(item, search.index);
        }
        self.tx.set_node(&target);

        let ancestors = self.ancestor_pages(&search.breadcrumbs)?;
        let max_threshold = self.tx.max_threshold();

        // Rebalance bottom-up, excluding the root.
        for level in (0..ancestors.len().saturating_sub(1)).rev() {
            let mut child = self.tx.get_node(ancestors[level + 1])?;
            if child.is_over_populated(max_threshold) {
                let mut parent = self.tx.get_node(ancestors[level])?;
                node::split_child(
                    self.tx,
                    &mut parent,
                    &mut child,
                    search.breadcrumbs[level + 1],
                )?;
            }
        }

        // The root has no parent to split under; give it a fresh one.
        let root_node = self.tx.get_node(ancestors[0])?;
        if root_node.is_over_populated(max_threshold) {
            let mut new_root = self.tx.new_node(Vec::new(), vec![root_node.page_num])?;
            debug!(
                old_root = root_node.page_num,
                new_root = new_root.page_num,
                "splitting root node"
            );
            let mut old_root = root_node;
            node::split_child(self.tx, &mut new_root, &mut old_root, 0)?;
            self.tx.set_node(&new_root);
            self.root = new_root.page_num;
            if self.is_root() {
                self.tx.set_meta_root(new_root.page_num);
            }
        }

        if !key_exists {
            self.record_insert(key.len(), value.len());
        }
        self.sync_to_tx();
        Ok(())
    }

    /// Removes a key.
    ///
    /// Blob chains are released first. Removing from an internal node
    /// replaces the item with its in-order predecessor; the breadcrumb
    /// path is then walked bottom-up and every under-populated node is
    /// rebalanced. A root left empty but with children is collapsed onto
    /// its first child.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` when the key is absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.tx.ensure_write()?;
        if self.root == 0 {
            return Err(Error::NodeNotFound);
        }
        let search = node::find(self.tx, self.root, key, true)?.ok_or(Error::NodeNotFound)?;
        let mut breadcrumbs = search.breadcrumbs;
        let mut target = self.tx.get_node(search.page)?;

        let item = target.items.get(search.index).ok_or(Error::NodeNotFound)?;
        let (value_len, was_blob) = item.release_value(self.tx)?;

        if target.is_leaf() {
            target.remove_item_at_leaf(search.index);
        } else {
            let affected = node::remove_item_from_internal(self.tx, &mut target, search.index)?;
            breadcrumbs.extend(affected);
        }
        self.tx.set_node(&target);

        let ancestors = self.ancestor_pages(&breadcrumbs)?;
        let min_threshold = self.tx.min_threshold();

        // Rebalance bottom-up, excluding the root.
        for level in (0..ancestors.len().saturating_sub(1)).rev() {
            let child = self.tx.get_node(ancestors[level + 1])?;
            if child.is_under_populated(min_threshold) {
                let mut parent = self.tx.get_node(ancestors[level])?;
                node::rebalance_remove(self.tx, &mut parent, breadcrumbs[level + 1])?;
            }
        }

        let root_node = self.tx.get_node(ancestors[0])?;
        if root_node.items.is_empty() && !root_node.children.is_empty() {
            self.root = root_node.children[0];
            if self.is_root() {
                self.tx.set_meta_root(self.root);
            }
        }

        self.items_n = self.items_n.saturating_sub(1);
        self.bytes_in_use = self
            .bytes_in_use
            .saturating_sub((key.len() + value_len) as u64);
        if was_blob {
            self.blobs_n = self.blobs_n.saturating_sub(1);
        }
        self.sync_to_tx();
        Ok(())
    }

    /// A fresh cursor positioned before the first item.
    pub fn cursor(&self) -> Cursor<'tx, 'db> {
        Cursor::new(self.tx, self.root)
    }

    /// Calls `f` for every key-value pair in ascending key order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let mut cursor = self.cursor();
        let mut entry = cursor.first();
        while let Some((key, value)) = entry {
            f(&key, &value)?;
            entry = cursor.next();
        }
        Ok(())
    }

    /// Increments and returns the bucket's monotonic counter.
    ///
    /// # Errors
    ///
    /// Returns `WriteInReadTx` in a read-only transaction.
    pub fn next_sequence(&mut self) -> Result<u64> {
        self.tx.ensure_write()?;
        self.counter += 1;
        self.sync_to_tx();
        Ok(self.counter)
    }

    /// The current value of the monotonic counter.
    pub fn sequence(&self) -> u64 {
        self.counter
    }

    /// Number of items stored in the bucket.
    pub fn items(&self) -> u64 {
        self.items_n
    }

    /// Number of items whose values live in blob chains.
    pub fn blobs(&self) -> u64 {
        self.blobs_n
    }

    /// Key and value bytes accounted to the bucket.
    pub fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    fn record_insert(&mut self, key_len: usize, value_len: usize) {
        self.items_n += 1;
        self.bytes_in_use += (key_len + value_len) as u64;
        if value_len > MAX_VALUE_SIZE {
            self.blobs_n += 1;
        }
    }

    /// Resolves the page number of every node along a breadcrumb path,
    /// walking down from the bucket root by child index.
    fn ancestor_pages(&self, breadcrumbs: &[usize]) -> Result<Vec<PageId>> {
        let mut pages = vec![self.root];
        let mut current = self.tx.get_node(self.root)?;
        for &index in &breadcrumbs[1..] {
            let child = *current.children.get(index).ok_or(Error::NodeNotFound)?;
            current = self.tx.get_node(child)?;
            pages.push(current.page_num);
        }
        Ok(pages)
    }
}
