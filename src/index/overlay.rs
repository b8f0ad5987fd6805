//! # Index Overlay
//!
//! The live form of one index: a frozen base tree plus a stack of
//! in-memory delta layers, newest last, merged on the fly into a single
//! ordered view. A lookup consults the layers newest-first — an insert
//! marker takes precedence over any same-key entry beneath it, a delete
//! tombstone hides them — and falls through to the frozen tree.
//!
//! Ordered access works by re-seeking every source from the last
//! returned key, which makes the merged cursor bidirectional and makes
//! direction reversal exact: after returning row `r` going forward, the
//! first backward step lands on `r`'s predecessor, never on `r` again.
//!
//! An update transaction's private delta rides along as an `extra`
//! layer on top; committed-but-unmerged transactions sit in `layers`
//! until the background merger squashes them into one and the persister
//! folds that into a new frozen tree.

use std::sync::Arc;

use eyre::Result;

use super::fbtree::{Fbtree, Seek};
use super::mbtree::{MbSlot, Mbtree};
use crate::storage::Offset;

#[derive(Clone)]
pub struct Overlay {
    pub fb: Fbtree,
    pub layers: Vec<Arc<Mbtree>>,
}

impl Overlay {
    pub fn new(fb: Fbtree) -> Overlay {
        Overlay {
            fb,
            layers: Vec::new(),
        }
    }

    /// A new overlay with `mb` pushed as the newest layer (commit).
    pub fn with_layer(&self, mb: Arc<Mbtree>) -> Overlay {
        let mut layers = self.layers.clone();
        layers.push(mb);
        Overlay {
            fb: self.fb.clone(),
            layers,
        }
    }

    /// Squashes the oldest `n` layers into one (the background merger).
    pub fn squash(&self, n: usize) -> Overlay {
        if n <= 1 {
            return self.clone();
        }
        let n = n.min(self.layers.len());
        let mut merged = (*self.layers[0]).clone();
        for layer in &self.layers[1..n] {
            merged.fold_in(layer);
        }
        let mut layers = vec![Arc::new(merged)];
        layers.extend_from_slice(&self.layers[n..]);
        Overlay {
            fb: self.fb.clone(),
            layers,
        }
    }

    /// Folds every layer into the frozen tree, producing a layerless
    /// overlay on a new root (the persister).
    pub fn flatten(&self) -> Result<Overlay> {
        if self.layers.is_empty() {
            return Ok(self.clone());
        }
        let fb = self.fb.update(|up| {
            for layer in &self.layers {
                let mut err = None;
                layer.for_each(|key, slot| {
                    if err.is_some() {
                        return;
                    }
                    let r = match slot {
                        MbSlot::Insert(off) => up.insert(key, off),
                        MbSlot::Delete(_) => up.delete(key).map(|_| ()),
                    };
                    if let Err(e) = r {
                        err = Some(e);
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            }
            Ok(())
        })?;
        Ok(Overlay::new(fb))
    }

    /// Point lookup through every layer.
    pub fn lookup(&self, key: &[u8], extra: Option<&Mbtree>) -> Result<Option<Offset>> {
        if let Some(mb) = extra {
            match mb.get(key) {
                Some(MbSlot::Insert(off)) => return Ok(Some(off)),
                Some(MbSlot::Delete(_)) => return Ok(None),
                None => {}
            }
        }
        for layer in self.layers.iter().rev() {
            match layer.get(key) {
                Some(MbSlot::Insert(off)) => return Ok(Some(off)),
                Some(MbSlot::Delete(_)) => return Ok(None),
                None => {}
            }
        }
        self.fb.lookup(key)
    }

    /// The neighboring *visible* entry: tombstones are skipped, and an
    /// insert in a newer layer shadows same-key entries below it.
    pub fn seek(
        &self,
        key: &[u8],
        mode: Seek,
        extra: Option<&Mbtree>,
    ) -> Result<Option<(Vec<u8>, Offset)>> {
        let forward = matches!(mode, Seek::Gt | Seek::Ge);
        let mut key = key.to_vec();
        let mut mode = mode;
        loop {
            let mut best: Option<(Vec<u8>, MbSlot)> = None;
            let mut consider = |k: &[u8], slot: MbSlot| {
                let better = match &best {
                    None => true,
                    // ties go to the newer source: sources are visited
                    // oldest to newest, so >= / <= replaces on equality
                    Some((bk, _)) => {
                        if forward {
                            k <= bk.as_slice()
                        } else {
                            k >= bk.as_slice()
                        }
                    }
                };
                if better {
                    best = Some((k.to_vec(), slot));
                }
            };
            if let Some((k, off)) = self.fb.seek(&key, mode)? {
                consider(&k, MbSlot::Insert(off));
            }
            for layer in self.layers.iter() {
                if let Some((k, slot)) = layer.seek(&key, mode) {
                    consider(k, slot);
                }
            }
            if let Some(mb) = extra {
                if let Some((k, slot)) = mb.seek(&key, mode) {
                    consider(k, slot);
                }
            }
            match best {
                None => return Ok(None),
                Some((k, MbSlot::Insert(off))) => return Ok(Some((k, off))),
                Some((k, MbSlot::Delete(_))) => {
                    // skip the tombstoned key and continue strictly past it
                    key = k;
                    mode = if forward { Seek::Gt } else { Seek::Lt };
                }
            }
        }
    }

    /// Whether any visible entry falls in `[org, end)`.
    pub fn range_occupied(
        &self,
        org: &[u8],
        end: &[u8],
        extra: Option<&Mbtree>,
    ) -> Result<bool> {
        match self.seek(org, Seek::Ge, extra)? {
            Some((k, _)) => Ok(k.as_slice() < end),
            None => Ok(false),
        }
    }
}

/// Bidirectional cursor over an overlay, restricted to `[org, end)`.
/// After either direction runs off the range, the cursor parks at eof
/// until `rewind` — the operators above drive reversal-at-eof by
/// rewinding explicitly.
pub struct OverlayIter {
    ov: Overlay,
    extra: Option<Arc<Mbtree>>,
    org: Vec<u8>,
    end: Vec<u8>,
    pos: Pos,
}

enum Pos {
    Rewound,
    At(Vec<u8>),
    Eof,
}

impl OverlayIter {
    pub fn new(ov: Overlay, extra: Option<Arc<Mbtree>>) -> OverlayIter {
        OverlayIter {
            ov,
            extra,
            org: crate::encoding::ixkey::MIN.to_vec(),
            end: crate::encoding::ixkey::max(),
            pos: Pos::Rewound,
        }
    }

    pub fn set_range(&mut self, org: Vec<u8>, end: Vec<u8>) {
        self.org = org;
        self.end = end;
        self.pos = Pos::Rewound;
    }

    pub fn rewind(&mut self) {
        self.pos = Pos::Rewound;
    }

    fn extra(&self) -> Option<&Mbtree> {
        self.extra.as_deref()
    }

    fn settle(&mut self, found: Option<(Vec<u8>, Offset)>, forward: bool) -> Option<(Vec<u8>, Offset)> {
        let in_range = |k: &[u8]| {
            if forward {
                k < self.end.as_slice()
            } else {
                k >= self.org.as_slice()
            }
        };
        match found {
            Some((k, off)) if in_range(&k) => {
                self.pos = Pos::At(k.clone());
                Some((k, off))
            }
            _ => {
                self.pos = Pos::Eof;
                None
            }
        }
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Offset)>> {
        let found = match &self.pos {
            Pos::Rewound => self.ov.seek(&self.org, Seek::Ge, self.extra())?,
            Pos::At(cur) => self.ov.seek(cur, Seek::Gt, self.extra())?,
            Pos::Eof => None,
        };
        Ok(self.settle(found, true))
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Offset)>> {
        let found = match &self.pos {
            Pos::Rewound => self.ov.seek(&self.end, Seek::Lt, self.extra())?,
            Pos::At(cur) => self.ov.seek(cur, Seek::Lt, self.extra())?,
            Pos::Eof => None,
        };
        Ok(self.settle(found, false))
    }

    /// Positions at and returns the first visible entry >= `key` within
    /// the range.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Offset)>> {
        let key = if key < self.org.as_slice() {
            self.org.clone()
        } else {
            key.to_vec()
        };
        let found = self.ov.seek(&key, Seek::Ge, self.extra())?;
        Ok(self.settle(found, true))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fbbuilder::FbBuilder;
    use super::*;
    use crate::storage::Store;

    fn base(keys: &[(&[u8], u64)]) -> Fbtree {
        let store = Arc::new(Store::heap(64 * 1024));
        let mut b = FbBuilder::new(Arc::clone(&store));
        for (k, off) in keys {
            b.add(k, *off).unwrap();
        }
        b.finish().unwrap()
    }

    #[test]
    fn tombstone_hides_and_insert_shadows() {
        let fb = base(&[(b"aa", 1), (b"bb", 2), (b"cc", 3)]);
        let mut mb = Mbtree::new();
        mb.delete(b"bb", 2);
        mb.insert(b"cc", 33); // shadows the frozen entry
        mb.insert(b"dd", 4);
        let ov = Overlay::new(fb).with_layer(Arc::new(mb));

        assert_eq!(ov.lookup(b"aa", None).unwrap(), Some(1));
        assert_eq!(ov.lookup(b"bb", None).unwrap(), None);
        assert_eq!(ov.lookup(b"cc", None).unwrap(), Some(33));

        let mut it = OverlayIter::new(ov, None);
        let mut got = Vec::new();
        while let Some((k, off)) = it.next().unwrap() {
            got.push((k, off));
        }
        assert_eq!(
            got,
            vec![
                (b"aa".to_vec(), 1),
                (b"cc".to_vec(), 33),
                (b"dd".to_vec(), 4)
            ]
        );
    }

    #[test]
    fn newer_layer_beats_older() {
        let fb = base(&[(b"k", 1)]);
        let mut older = Mbtree::new();
        older.insert(b"k", 2);
        let mut newer = Mbtree::new();
        newer.delete(b"k", 2);
        let ov = Overlay::new(fb)
            .with_layer(Arc::new(older))
            .with_layer(Arc::new(newer));
        assert_eq!(ov.lookup(b"k", None).unwrap(), None);
        assert_eq!(ov.seek(b"", Seek::Ge, None).unwrap(), None);
    }

    #[test]
    fn iterate_matches_model() {
        // overlay semantics: iter(overlay(F, D)) == iter(apply(F, D))
        use std::collections::BTreeMap;
        let keys: Vec<(Vec<u8>, u64)> =
            (0..300u64).map(|i| (format!("k{:04}", i * 2).into_bytes(), i + 1)).collect();
        let store = Arc::new(Store::heap(256 * 1024));
        let mut b = FbBuilder::new(Arc::clone(&store));
        let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for (k, off) in &keys {
            b.add(k, *off).unwrap();
            model.insert(k.clone(), *off);
        }
        let fb = b.finish().unwrap();

        let mut mb = Mbtree::new();
        for i in 0..300u64 {
            match i % 3 {
                0 => {
                    // delete an existing key
                    let k = format!("k{:04}", i * 2).into_bytes();
                    mb.delete(&k, 0);
                    model.remove(&k);
                }
                1 => {
                    // insert a new odd key
                    let k = format!("k{:04}", i * 2 + 1).into_bytes();
                    mb.insert(&k, 1000 + i);
                    model.insert(k, 1000 + i);
                }
                _ => {}
            }
        }
        let ov = Overlay::new(fb).with_layer(Arc::new(mb));
        let mut it = OverlayIter::new(ov, None);
        let mut got = Vec::new();
        while let Some(e) = it.next().unwrap() {
            got.push(e);
        }
        let want: Vec<(Vec<u8>, u64)> = model.into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn direction_reversal_skips_exactly_one() {
        let fb = base(&[(b"a", 1), (b"b", 2), (b"c", 3), (b"d", 4)]);
        let mut it = OverlayIter::new(Overlay::new(fb), None);
        assert_eq!(it.next().unwrap().unwrap().0, b"a");
        assert_eq!(it.next().unwrap().unwrap().0, b"b");
        // reverse: must return "a", not "b" again
        assert_eq!(it.prev().unwrap().unwrap().0, b"a");
        assert_eq!(it.prev().unwrap(), None);
        // eof is sticky until rewind
        assert_eq!(it.next().unwrap(), None);
        it.rewind();
        assert_eq!(it.next().unwrap().unwrap().0, b"a");
    }

    #[test]
    fn range_bounds() {
        let fb = base(&[(b"a", 1), (b"b", 2), (b"c", 3), (b"d", 4)]);
        let mut it = OverlayIter::new(Overlay::new(fb), None);
        it.set_range(b"b".to_vec(), b"d".to_vec());
        assert_eq!(it.next().unwrap().unwrap().0, b"b");
        assert_eq!(it.next().unwrap().unwrap().0, b"c");
        assert_eq!(it.next().unwrap(), None);
        it.rewind();
        assert_eq!(it.prev().unwrap().unwrap().0, b"c");
        assert_eq!(it.prev().unwrap().unwrap().0, b"b");
        assert_eq!(it.prev().unwrap(), None);
    }

    #[test]
    fn flatten_equals_layered_view() {
        let fb = base(&[(b"a", 1), (b"b", 2)]);
        let mut mb = Mbtree::new();
        mb.delete(b"a", 1);
        mb.insert(b"c", 3);
        let ov = Overlay::new(fb).with_layer(Arc::new(mb));
        let flat = ov.flatten().unwrap();
        assert!(flat.layers.is_empty());
        let collect = |ov: Overlay| {
            let mut it = OverlayIter::new(ov, None);
            let mut v = Vec::new();
            while let Some(e) = it.next().unwrap() {
                v.push(e);
            }
            v
        };
        assert_eq!(collect(flat), collect(ov));
    }
}
