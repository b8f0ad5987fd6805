//! # Frozen B-Tree
//!
//! An immutable, persistent key→offset map. Nodes are written once and
//! never modified; a tree is named by `(root offset, tree levels)` and a
//! handle is just those two numbers plus the store, so opening one does
//! no I/O. Updates go through [`super::fbupdate::FbUpdate`], which
//! produces a *new* root and leaves every reachable node of the old tree
//! intact — readers holding the old root are never disturbed.
//!
//! Point reads descend by separator; ordered access is seek-based:
//! `seek(key, Gt|Ge|Lt|Le)` finds the neighboring entry in O(levels),
//! which makes merged overlay iteration and direction reversal simple to
//! get right (each step re-seeks from the last returned key).
//!
//! `root == 0` is the empty tree: offset 0 is inside the file header, so
//! no node can live there.

use std::sync::Arc;

use eyre::Result;

use super::node::Node;
use crate::errors::corrupt;
use crate::storage::{Offset, Store};

#[derive(Clone)]
pub struct Fbtree {
    pub store: Arc<Store>,
    pub root: Offset,
    pub levels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Seek {
    fn forward(self) -> bool {
        matches!(self, Seek::Gt | Seek::Ge)
    }
}

impl Fbtree {
    pub fn open(store: Arc<Store>, root: Offset, levels: usize) -> Fbtree {
        Fbtree {
            store,
            root,
            levels,
        }
    }

    pub fn empty(store: Arc<Store>) -> Fbtree {
        Fbtree {
            store,
            root: 0,
            levels: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Exact-match lookup returning the stored offset.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Offset>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut node = Node::read(&self.store, self.root)?;
        while !node.is_leaf() {
            let c = node.child_for(key);
            node = Node::read(&self.store, node.entries[c].1)?;
        }
        Ok(node.search(key).ok().map(|i| node.entries[i].1))
    }

    /// The neighboring entry of `key` in the given direction, e.g.
    /// `Seek::Gt` returns the smallest entry strictly greater.
    pub fn seek(&self, key: &[u8], mode: Seek) -> Result<Option<(Vec<u8>, Offset)>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.seek_in(self.root, key, mode)
    }

    fn seek_in(&self, off: Offset, key: &[u8], mode: Seek) -> Result<Option<(Vec<u8>, Offset)>> {
        let node = Node::read(&self.store, off)?;
        if node.is_leaf() {
            let i = match (node.search(key), mode) {
                (Ok(i), Seek::Ge) | (Err(i), Seek::Ge) => i as isize,
                (Ok(i), Seek::Gt) => i as isize + 1,
                (Err(i), Seek::Gt) => i as isize,
                (Ok(i), Seek::Le) => i as isize,
                (Err(i), Seek::Le) | (Ok(i), Seek::Lt) | (Err(i), Seek::Lt) => i as isize - 1,
            };
            if i < 0 {
                return Ok(None);
            }
            return Ok(node.entries.get(i as usize).cloned());
        }
        let c = node.child_for(key);
        if let Some(found) = self.seek_in(node.entries[c].1, key, mode)? {
            return Ok(Some(found));
        }
        // nothing on that side within child c: take the nearest entry of
        // the adjacent subtrees (skipping any emptied leaves)
        if mode.forward() {
            for i in c + 1..node.entries.len() {
                if let Some(found) = self.edge_in(node.entries[i].1, true)? {
                    return Ok(Some(found));
                }
            }
        } else {
            for i in (0..c).rev() {
                if let Some(found) = self.edge_in(node.entries[i].1, false)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    /// First (or last) entry of the whole tree.
    pub fn edge(&self, first: bool) -> Result<Option<(Vec<u8>, Offset)>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.edge_in(self.root, first)
    }

    fn edge_in(&self, off: Offset, first: bool) -> Result<Option<(Vec<u8>, Offset)>> {
        let node = Node::read(&self.store, off)?;
        if node.is_leaf() {
            let e = if first {
                node.entries.first()
            } else {
                node.entries.last()
            };
            return Ok(e.cloned());
        }
        let order: Box<dyn Iterator<Item = &(Vec<u8>, u64)>> = if first {
            Box::new(node.entries.iter())
        } else {
            Box::new(node.entries.iter().rev())
        };
        for (_, child) in order {
            if let Some(found) = self.edge_in(*child, first)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Verifies structure and checksums of every reachable node, calling
    /// `on_leaf` with each leaf entry's data offset. Returns the entry
    /// count.
    pub fn check(&self, on_leaf: &mut dyn FnMut(Offset)) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let mut prev: Vec<u8> = Vec::new();
        let mut first = true;
        self.check_in(self.root, self.levels as isize, &mut prev, &mut first, on_leaf)
    }

    fn check_in(
        &self,
        off: Offset,
        level: isize,
        prev: &mut Vec<u8>,
        first: &mut bool,
        on_leaf: &mut dyn FnMut(Offset),
    ) -> Result<usize> {
        let node = Node::read_ck(&self.store, off)?;
        if node.level as isize != level {
            return Err(corrupt(format!(
                "btree level mismatch: node {} expected {}",
                node.level, level
            )));
        }
        let mut count = 0;
        if node.is_leaf() {
            for (key, data) in &node.entries {
                if !*first && key <= prev {
                    return Err(corrupt("btree keys out of order"));
                }
                *first = false;
                prev.clone_from(key);
                on_leaf(*data);
                count += 1;
            }
            return Ok(count);
        }
        let mut prev_sep: Option<&[u8]> = None;
        for (i, (sep, child)) in node.entries.iter().enumerate() {
            if i == 0 && !sep.is_empty() {
                return Err(corrupt("inner node's first separator must be empty"));
            }
            if let Some(p) = prev_sep {
                if sep.as_slice() <= p {
                    return Err(corrupt("btree separators out of order"));
                }
            }
            if i > 0 {
                prev_sep = Some(sep);
            }
            count += self.check_in(*child, level - 1, prev, first, on_leaf)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fbbuilder::FbBuilder;
    use super::*;

    fn build(keys: &[&str]) -> Fbtree {
        let store = Arc::new(Store::heap(64 * 1024));
        let mut b = FbBuilder::new(Arc::clone(&store));
        for (i, k) in keys.iter().enumerate() {
            b.add(k.as_bytes(), i as u64 + 100).unwrap();
        }
        b.finish().unwrap()
    }

    #[test]
    fn lookup_and_seek() {
        let fb = build(&["bb", "dd", "ff"]);
        assert_eq!(fb.lookup(b"dd").unwrap(), Some(101));
        assert_eq!(fb.lookup(b"cc").unwrap(), None);
        assert_eq!(fb.seek(b"cc", Seek::Gt).unwrap().unwrap().0, b"dd");
        assert_eq!(fb.seek(b"dd", Seek::Gt).unwrap().unwrap().0, b"ff");
        assert_eq!(fb.seek(b"dd", Seek::Ge).unwrap().unwrap().0, b"dd");
        assert_eq!(fb.seek(b"dd", Seek::Lt).unwrap().unwrap().0, b"bb");
        assert_eq!(fb.seek(b"ff", Seek::Gt).unwrap(), None);
        assert_eq!(fb.seek(b"bb", Seek::Lt).unwrap(), None);
        assert_eq!(fb.edge(true).unwrap().unwrap().0, b"bb");
        assert_eq!(fb.edge(false).unwrap().unwrap().0, b"ff");
    }

    #[test]
    fn empty_tree() {
        let store = Arc::new(Store::heap(4096));
        let fb = Fbtree::empty(store);
        assert_eq!(fb.lookup(b"x").unwrap(), None);
        assert_eq!(fb.seek(b"x", Seek::Ge).unwrap(), None);
        assert_eq!(fb.check(&mut |_| {}).unwrap(), 0);
    }

    #[test]
    fn check_counts_entries() {
        let keys: Vec<String> = (0..500).map(|i| format!("key{:05}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let fb = build(&refs);
        assert!(fb.levels >= 1, "500 keys should not fit one node");
        let mut offs = Vec::new();
        let n = fb.check(&mut |off| offs.push(off)).unwrap();
        assert_eq!(n, 500);
        assert_eq!(offs[0], 100);
        assert_eq!(offs[499], 599);
    }
}
