//! # Frozen-Tree Update Buffer
//!
//! Applies a batch of inserts and deletes to a frozen tree without
//! touching any of its pages, producing a new root. While the update is
//! in progress, modified nodes live in memory under virtual ids and a
//! **redirects map** translates frozen offsets to their replacements —
//! parents are not rewritten just because a child changed, so a large
//! batch touches each path once no matter how many keys land in it.
//!
//! `save` then resolves the tree top-down: any node whose children all
//! kept their offsets is reused as-is; everything else (redirected
//! nodes, fresh splits, and the spine above them) is written out once,
//! bottom-up, yielding the new `(root, levels)`.
//!
//! This is the persist path's mechanism — the only place tree levels
//! grow — and the merge step that folds an in-memory delta tree into its
//! frozen base is just `update` over the delta's entries.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;

use super::fbtree::Fbtree;
use super::node::{separator, Node};
use crate::config::NODE_LIMIT;
use crate::storage::{Offset, Store};

/// Virtual node ids have this bit set; they index `nodes`, not the store.
const MEM_BIT: u64 = 1 << 62;

pub struct FbUpdate {
    store: Arc<Store>,
    root: u64,
    levels: usize,
    redirects: HashMap<Offset, u64>,
    nodes: HashMap<u64, Node>,
    next_id: u64,
}

impl Fbtree {
    /// Runs `f` against an update buffer and returns the resulting tree.
    /// The original tree is untouched and remains fully readable.
    pub fn update(&self, f: impl FnOnce(&mut FbUpdate) -> Result<()>) -> Result<Fbtree> {
        let mut up = FbUpdate {
            store: Arc::clone(&self.store),
            root: self.root,
            levels: self.levels,
            redirects: HashMap::new(),
            nodes: HashMap::new(),
            next_id: MEM_BIT,
        };
        f(&mut up)?;
        up.save()
    }
}

impl FbUpdate {
    fn get(&self, id: u64) -> Result<Node> {
        if id & MEM_BIT != 0 {
            return Ok(self.nodes[&id].clone());
        }
        if let Some(&mem) = self.redirects.get(&id) {
            return Ok(self.nodes[&mem].clone());
        }
        Node::read(&self.store, id)
    }

    fn fresh(&mut self, node: Node) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    /// Redirects a frozen node into memory (or returns it if already
    /// there), so it can be mutated without rewriting its parent.
    fn make_mut(&mut self, id: u64) -> Result<u64> {
        if id & MEM_BIT != 0 {
            return Ok(id);
        }
        if let Some(&mem) = self.redirects.get(&id) {
            return Ok(mem);
        }
        let node = Node::read(&self.store, id)?;
        let mem = self.fresh(node);
        self.redirects.insert(id, mem);
        Ok(mem)
    }

    pub fn insert(&mut self, key: &[u8], off: Offset) -> Result<()> {
        if self.root == 0 {
            let mut leaf = Node::blank(0);
            leaf.entries.push((key.to_vec(), off));
            self.root = self.fresh(leaf);
            return Ok(());
        }
        // descend to the leaf, remembering (node id, child index) per level
        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut cur = self.root;
        let mut node = self.get(cur)?;
        while !node.is_leaf() {
            let c = node.child_for(key);
            path.push((cur, c));
            cur = node.entries[c].1;
            node = self.get(cur)?;
        }
        let leaf_id = self.make_mut(cur)?;
        let leaf = self.nodes.get_mut(&leaf_id).unwrap();
        match leaf.search(key) {
            Ok(i) => leaf.entries[i].1 = off, // re-insert replaces
            Err(i) => leaf.entries.insert(i, (key.to_vec(), off)),
        }
        if self.nodes[&leaf_id].encoded_len() > NODE_LIMIT {
            self.split(&path, leaf_id)?;
        }
        Ok(())
    }

    /// Removes a key. Missing keys are a no-op returning false (a delta
    /// may delete a key that only ever lived in memory).
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.root == 0 {
            return Ok(false);
        }
        let mut cur = self.root;
        let mut node = self.get(cur)?;
        while !node.is_leaf() {
            let c = node.child_for(key);
            cur = node.entries[c].1;
            node = self.get(cur)?;
        }
        if node.search(key).is_err() {
            return Ok(false);
        }
        let leaf_id = self.make_mut(cur)?;
        let leaf = self.nodes.get_mut(&leaf_id).unwrap();
        if let Ok(i) = leaf.search(key) {
            leaf.entries.remove(i);
            return Ok(true);
        }
        Ok(false)
    }

    fn split(&mut self, path: &[(u64, usize)], id: u64) -> Result<()> {
        let node = self.nodes.get_mut(&id).unwrap();
        let level = node.level;
        let mid = node.entries.len() / 2;
        let mut right_entries = node.entries.split_off(mid);
        let sep = if level == 0 {
            separator(&node.entries.last().unwrap().0, &right_entries[0].0)
        } else {
            // an inner node's boundary is its first separator, which
            // becomes empty inside the new right node
            std::mem::take(&mut right_entries[0].0)
        };
        let right_id = self.fresh(Node {
            level,
            entries: right_entries,
        });
        match path.split_last() {
            None => {
                // root split: grow the tree by one level
                let old_root = id;
                let root = Node {
                    level: level + 1,
                    entries: vec![(Vec::new(), old_root), (sep, right_id)],
                };
                self.root = self.fresh(root);
                self.levels += 1;
            }
            Some((&(parent, c), rest)) => {
                let parent_id = self.make_mut(parent)?;
                let pnode = self.nodes.get_mut(&parent_id).unwrap();
                pnode.entries.insert(c + 1, (sep, right_id));
                if self.nodes[&parent_id].encoded_len() > NODE_LIMIT {
                    self.split(rest, parent_id)?;
                }
            }
        }
        Ok(())
    }

    fn save(mut self) -> Result<Fbtree> {
        if self.root == 0 {
            return Ok(Fbtree::empty(self.store));
        }
        // an emptied tree collapses back to the empty handle
        let root_node = self.get(self.root)?;
        if root_node.is_leaf() && root_node.entries.is_empty() {
            return Ok(Fbtree::empty(self.store));
        }
        let root = self.resolve(self.root)?;
        Ok(Fbtree::open(Arc::clone(&self.store), root, self.levels))
    }

    /// Writes out everything that changed beneath `id`, returning the
    /// final disk offset. Unchanged frozen subtrees keep their offsets.
    fn resolve(&mut self, id: u64) -> Result<Offset> {
        let (mut node, frozen) = if id & MEM_BIT != 0 {
            (self.nodes[&id].clone(), None)
        } else if let Some(&mem) = self.redirects.get(&id) {
            (self.nodes[&mem].clone(), None)
        } else {
            (Node::read(&self.store, id)?, Some(id))
        };
        if node.is_leaf() {
            return Ok(match frozen {
                Some(off) => off,
                None => node.write_to(&self.store),
            });
        }
        let mut changed = frozen.is_none();
        for i in 0..node.entries.len() {
            let child = node.entries[i].1;
            let resolved = self.resolve(child)?;
            if resolved != child {
                node.entries[i].1 = resolved;
                changed = true;
            }
        }
        Ok(if changed {
            node.write_to(&self.store)
        } else {
            frozen.unwrap()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fbbuilder::FbBuilder;
    use super::*;
    use crate::index::fbtree::Seek;

    fn build(store: &Arc<Store>, keys: &[(&str, u64)]) -> Fbtree {
        let mut b = FbBuilder::new(Arc::clone(store));
        for (k, off) in keys {
            b.add(k.as_bytes(), *off).unwrap();
        }
        b.finish().unwrap()
    }

    #[test]
    fn insert_into_existing_tree() {
        let store = Arc::new(Store::heap(64 * 1024));
        let fb = build(&store, &[("bb", 1), ("dd", 2)]);
        let fb2 = fb
            .update(|up| {
                up.insert(b"cc", 3)?;
                up.insert(b"aa", 4)?;
                Ok(())
            })
            .unwrap();
        // new tree sees everything
        assert_eq!(fb2.lookup(b"aa").unwrap(), Some(4));
        assert_eq!(fb2.lookup(b"cc").unwrap(), Some(3));
        assert_eq!(fb2.lookup(b"bb").unwrap(), Some(1));
        // old tree is untouched
        assert_eq!(fb.lookup(b"cc").unwrap(), None);
        assert_eq!(fb.lookup(b"bb").unwrap(), Some(1));
    }

    #[test]
    fn delete_and_collapse() {
        let store = Arc::new(Store::heap(64 * 1024));
        let fb = build(&store, &[("aa", 1), ("bb", 2)]);
        let fb2 = fb
            .update(|up| {
                assert!(up.delete(b"aa")?);
                assert!(!up.delete(b"zz")?);
                Ok(())
            })
            .unwrap();
        assert_eq!(fb2.lookup(b"aa").unwrap(), None);
        assert_eq!(fb2.lookup(b"bb").unwrap(), Some(2));

        let fb3 = fb2.update(|up| up.delete(b"bb").map(|_| ())).unwrap();
        assert!(fb3.is_empty());
    }

    #[test]
    fn many_inserts_split_and_stay_ordered() {
        let store = Arc::new(Store::heap(1024 * 1024));
        let fb = Fbtree::empty(Arc::clone(&store));
        let fb = fb
            .update(|up| {
                // shuffled order via stride
                for i in 0..2000u64 {
                    let k = (i * 7919) % 2000;
                    up.insert(format!("k{:06}", k).as_bytes(), k + 1)?;
                }
                Ok(())
            })
            .unwrap();
        assert!(fb.levels >= 1);
        let mut n = 0;
        let mut prev = 0;
        fb.check(&mut |off| {
            assert!(n == 0 || off == prev + 1);
            prev = off;
            n += 1;
        })
        .unwrap();
        assert_eq!(n, 2000);
    }

    #[test]
    fn unchanged_subtrees_keep_their_offsets() {
        let store = Arc::new(Store::heap(1024 * 1024));
        let keys: Vec<(String, u64)> = (0..2000u64).map(|i| (format!("k{:06}", i), i)).collect();
        let mut b = FbBuilder::new(Arc::clone(&store));
        for (k, off) in &keys {
            b.add(k.as_bytes(), *off).unwrap();
        }
        let fb = b.finish().unwrap();
        let before = store.size();
        let fb2 = fb.update(|up| up.insert(b"k0005000x", 9999)).unwrap();
        let written = store.size() - before;
        // one leaf path rewritten, not the whole tree
        assert!(written < before / 4, "rewrote too much: {} bytes", written);
        assert_eq!(fb2.lookup(b"k0005000x").unwrap(), Some(9999));
    }

    #[test]
    fn reverse_seek_over_updated_tree() {
        let store = Arc::new(Store::heap(64 * 1024));
        let fb = build(&store, &[("bb", 1), ("dd", 2), ("ff", 3)]);
        let fb = fb.update(|up| up.insert(b"ee", 4)).unwrap();
        assert_eq!(fb.seek(b"ff", Seek::Lt).unwrap().unwrap().0, b"ee");
        assert_eq!(fb.seek(b"ee", Seek::Lt).unwrap().unwrap().0, b"dd");
    }
}
