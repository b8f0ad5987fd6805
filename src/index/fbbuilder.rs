//! # B-Tree Bulk Builder
//!
//! Builds a fully packed frozen tree from sorted input in one pass, used
//! by load, compact, and the persist path when an index has no frozen
//! tree yet. Keys must arrive in strictly increasing order.
//!
//! One pending node is kept per level. When a leaf fills, it is written
//! out and a truncated separator (between its last key and the incoming
//! key) is promoted to the level above; inner levels cascade the same
//! way. `finish` flushes the pending nodes bottom-up; the single node at
//! the top level becomes the root.

use std::mem;
use std::sync::Arc;

use eyre::{ensure, Result};

use super::fbtree::Fbtree;
use super::node::{separator, Node};
use crate::config::NODE_LIMIT;
use crate::storage::{Offset, Store, SMALL_OFFSET_LEN};

pub struct FbBuilder {
    store: Arc<Store>,
    levels: Vec<Level>,
    prev: Vec<u8>,
    count: usize,
}

struct Level {
    node: Node,
    /// Separator to emit alongside the pending node when it flushes;
    /// empty for the leftmost node of a level.
    promote: Vec<u8>,
    flushed: usize,
}

impl Level {
    fn new(level: u8) -> Level {
        Level {
            node: Node {
                level,
                entries: Vec::new(),
            },
            promote: Vec::new(),
            flushed: 0,
        }
    }
}

impl FbBuilder {
    pub fn new(store: Arc<Store>) -> FbBuilder {
        FbBuilder {
            store,
            levels: Vec::new(),
            prev: Vec::new(),
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn add(&mut self, key: &[u8], off: Offset) -> Result<()> {
        ensure!(
            self.count == 0 || self.prev.as_slice() < key,
            "btree builder keys must be strictly increasing"
        );
        self.insert(0, key.to_vec(), off);
        self.prev = key.to_vec();
        self.count += 1;
        Ok(())
    }

    fn insert(&mut self, lvl: usize, key: Vec<u8>, off: Offset) {
        if lvl == self.levels.len() {
            self.levels.push(Level::new(lvl as u8));
        }
        let entry_cost = 2 + key.len() + SMALL_OFFSET_LEN;
        let level = &mut self.levels[lvl];
        if !level.node.entries.is_empty() && level.node.encoded_len() + entry_cost > NODE_LIMIT {
            // flush the pending node, start a fresh one with this entry
            let node = mem::replace(&mut level.node, Node::blank(lvl as u8));
            let boundary = if lvl == 0 {
                separator(&node.entries.last().unwrap().0, &key)
            } else {
                key.clone()
            };
            let parent_sep = mem::replace(&mut level.promote, boundary);
            level.flushed += 1;
            push_entry(&mut level.node, lvl, key, off);
            let node_off = node.write_to(&self.store);
            self.insert(lvl + 1, parent_sep, node_off);
        } else {
            push_entry(&mut level.node, lvl, key, off);
        }
    }

    pub fn finish(mut self) -> Result<Fbtree> {
        if self.levels.is_empty() {
            return Ok(Fbtree::empty(self.store));
        }
        let mut lvl = 0;
        loop {
            debug_assert!(!self.levels[lvl].node.entries.is_empty());
            if lvl == self.levels.len() - 1 && self.levels[lvl].flushed == 0 {
                // the only node at the top level is the root
                let node = mem::take(&mut self.levels[lvl].node);
                let root = node.write_to(&self.store);
                return Ok(Fbtree::open(self.store, root, lvl));
            }
            let level = &mut self.levels[lvl];
            let node = mem::replace(&mut level.node, Node::blank(lvl as u8));
            let parent_sep = mem::take(&mut level.promote);
            level.flushed += 1;
            let node_off = node.write_to(&self.store);
            self.insert(lvl + 1, parent_sep, node_off);
            lvl += 1;
        }
    }
}

fn push_entry(node: &mut Node, lvl: usize, key: Vec<u8>, off: Offset) {
    // an inner node's first separator is always empty
    let key = if lvl > 0 && node.entries.is_empty() {
        Vec::new()
    } else {
        key
    };
    node.entries.push((key, off));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[test]
    fn builder_round_trip_small() {
        let store = Arc::new(Store::heap(64 * 1024));
        let mut b = FbBuilder::new(Arc::clone(&store));
        for (i, k) in ["aa", "bb", "cc"].iter().enumerate() {
            b.add(k.as_bytes(), i as u64 + 1).unwrap();
        }
        let fb = b.finish().unwrap();
        assert_eq!(fb.levels, 0);
        assert_eq!(fb.lookup(b"bb").unwrap(), Some(2));
    }

    #[test]
    fn builder_round_trip_large() {
        // mirrors the original builder test: sequential numeric keys,
        // verify every key/offset pair comes back in order
        let store = Arc::new(Store::heap(1024 * 1024));
        let mut b = FbBuilder::new(Arc::clone(&store));
        for i in 100_000..120_000u64 {
            b.add(i.to_string().as_bytes(), i).unwrap();
        }
        let fb = b.finish().unwrap();
        assert!(fb.levels >= 2);
        let mut expect = 100_000u64;
        let n = fb
            .check(&mut |off| {
                assert_eq!(off, expect);
                expect += 1;
            })
            .unwrap();
        assert_eq!(n, 20_000);
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let store = Arc::new(Store::heap(4096));
        let mut b = FbBuilder::new(store);
        b.add(b"bb", 1).unwrap();
        assert!(b.add(b"aa", 2).is_err());
        assert!(b.add(b"bb", 3).is_err()); // duplicates too
    }

    #[test]
    fn empty_builder_gives_empty_tree() {
        let store = Arc::new(Store::heap(4096));
        let fb = FbBuilder::new(store).finish().unwrap();
        assert!(fb.is_empty());
    }
}
