//! Summary: Ordered traversal over a bucket with an explicit frame stack.
//! Copyright (c) YOAB. All rights reserved.
//!
//! The cursor records one frame per ancestor instead of keeping parent
//! pointers in nodes: every descent pushes a frame, every ascent pops.
//! `None` is the end-of-iteration sentinel in both directions.

use crate::node::{Item, Node};
use crate::page::PageId;
use crate::tx::Tx;

#[derive(Debug, Clone)]
struct Frame {
    page_num: PageId,
    children: Vec<PageId>,
    child_index: usize,
    item_index: usize,
}

/// Ordered traversal over one bucket's tree.
pub struct Cursor<'tx, 'db> {
    tx: &'tx Tx<'db>,
    root: PageId,
    node: Option<Node>,
    item_index: usize,
    child_index: usize,
    stack: Vec<Frame>,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    pub(crate) fn new(tx: &'tx Tx<'db>, root: PageId) -> Cursor<'tx, 'db> {
        Cursor {
            tx,
            root,
            node: None,
            item_index: 0,
            child_index: 0,
            stack: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.node = None;
        self.item_index = 0;
        self.child_index = 0;
    }

    fn emit(&self, item: Item) -> Option<(Vec<u8>, Vec<u8>)> {
        let value = item.read_value(self.tx).ok()?;
        Some((item.key, value))
    }

    /// Positions on the smallest key and returns it.
    pub fn first(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.reset();
        if self.root == 0 {
            return None;
        }
        let root = self.tx.get_node(self.root).ok()?;
        let (item, leaf) = self.descend_first(root)?;
        self.node = Some(leaf);
        self.item_index = 0;
        self.child_index = 0;
        self.emit(item)
    }

    /// Positions on the largest key and returns it.
    pub fn last(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.reset();
        if self.root == 0 {
            return None;
        }
        let root = self.tx.get_node(self.root).ok()?;
        let (item, leaf) = self.descend_last(root)?;
        self.item_index = leaf.items.len() - 1;
        self.node = Some(leaf);
        self.emit(item)
    }

    /// Positions on the smallest key greater than or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.reset();
        if self.root == 0 {
            return None;
        }
        let mut node = self.tx.get_node(self.root).ok()?;
        loop {
            let (position, found) = node.find_key_position(key);
            if found {
                let item = node.items[position].clone();
                self.item_index = position;
                // Internal-node positions keep child_index one ahead of
                // item_index so next/prev can tell which subtree borders
                // the separator item.
                self.child_index = position + 1;
                self.node = Some(node);
                return self.emit(item);
            }
            if node.is_leaf() {
                if position < node.items.len() {
                    let item = node.items[position].clone();
                    self.item_index = position;
                    self.node = Some(node);
                    return self.emit(item);
                }
                if node.items.is_empty() {
                    self.node = Some(node);
                    return None;
                }
                // Past every item in this leaf: step to the successor.
                self.item_index = node.items.len() - 1;
                self.node = Some(node);
                return self.next();
            }
            self.stack.push(Frame {
                page_num: node.page_num,
                children: node.children.clone(),
                child_index: position,
                item_index: position,
            });
            node = self.tx.get_node(node.children[position]).ok()?;
        }
    }

    /// Advances to the in-order successor.
    pub fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let is_leaf = self.node.as_ref()?.is_leaf();
        if is_leaf {
            let num_items = self.node.as_ref()?.items.len();
            if self.item_index + 1 < num_items {
                self.item_index += 1;
                let item = self.node.as_ref()?.items[self.item_index].clone();
                return self.emit(item);
            }
            // The leaf is exhausted: pop until an ancestor still has an
            // unexplored right sibling and return its separator item.
            loop {
                let parent = self.stack.pop()?;
                if parent.child_index + 1 < parent.children.len() {
                    let parent_node = self.tx.get_node(parent.page_num).ok()?;
                    let item = parent_node.items.get(parent.item_index)?.clone();
                    self.node = Some(parent_node);
                    self.child_index = parent.child_index;
                    self.item_index = parent.item_index + 1;
                    return self.emit(item);
                }
            }
        }

        // On an internal node, sitting on a separator item: descend into
        // the subtree immediately to its right.
        let (page_num, children) = {
            let node = self.node.as_ref()?;
            (node.page_num, node.children.clone())
        };
        let target_child = if self.item_index > self.child_index {
            self.child_index + 1
        } else {
            self.child_index
        };
        if target_child >= children.len() {
            return None;
        }
        let child_page = children[target_child];
        self.stack.push(Frame {
            page_num,
            children,
            child_index: target_child,
            item_index: target_child,
        });
        let child = self.tx.get_node(child_page).ok()?;
        let (item, leaf) = self.descend_first(child)?;
        self.node = Some(leaf);
        self.item_index = 0;
        self.child_index = 0;
        self.emit(item)
    }

    /// Steps back to the in-order predecessor.
    pub fn prev(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let is_leaf = self.node.as_ref()?.is_leaf();
        if is_leaf {
            if self.item_index > 0 {
                self.item_index -= 1;
                let item = self.node.as_ref()?.items.get(self.item_index)?.clone();
                return self.emit(item);
            }
            loop {
                let parent = self.stack.pop()?;
                if parent.child_index > 0 {
                    let parent_node = self.tx.get_node(parent.page_num).ok()?;
                    self.child_index = parent.child_index;
                    self.item_index = parent.item_index.checked_sub(1)?;
                    let item = parent_node.items.get(self.item_index)?.clone();
                    self.node = Some(parent_node);
                    return self.emit(item);
                }
            }
        }

        // On an internal node, sitting on a separator item: descend into
        // the subtree immediately to its left.
        let (page_num, children) = {
            let node = self.node.as_ref()?;
            (node.page_num, node.children.clone())
        };
        let target_child = if self.item_index > self.child_index {
            self.child_index
        } else {
            self.child_index.checked_sub(1)?
        };
        let child_page = *children.get(target_child)?;
        self.stack.push(Frame {
            page_num,
            children,
            child_index: target_child,
            item_index: target_child,
        });
        let child = self.tx.get_node(child_page).ok()?;
        let (item, leaf) = self.descend_last(child)?;
        self.item_index = leaf.items.len() - 1;
        self.child_index = 0;
        self.node = Some(leaf);
        self.emit(item)
    }

    /// Follows first children down to a leaf, pushing a frame per level.
    fn descend_first(&mut self, mut node: Node) -> Option<(Item, Node)> {
        loop {
            if node.is_leaf() {
                let item = node.items.first()?.clone();
                return Some((item, node));
            }
            let child_page = node.children[0];
            self.stack.push(Frame {
                page_num: node.page_num,
                children: node.children.clone(),
                child_index: 0,
                item_index: 0,
            });
            node = self.tx.get_node(child_page).ok()?;
        }
    }

    /// Follows last children down to a leaf, pushing a frame per level.
    fn descend_last(&mut self, mut node: Node) -> Option<(Item, Node)> {
        loop {
            if node.is_leaf() {
                let item = node.items.last()?.clone();
                return Some((item, node));
            }
            let child_index = node.children.len() - 1;
            let child_page = node.children[child_index];
            self.stack.push(Frame {
                page_num: node.page_num,
                children: node.children.clone(),
                child_index,
                item_index: node.items.len(),
            });
            node = self.tx.get_node(child_page).ok()?;
        }
    }
}
