//! # In-Memory Delta Tree
//!
//! Holds the recent inserts and deletes for one index: the private layer
//! of an update transaction, and the shared staging layer the background
//! merger folds committed transactions into. One slot per key — an
//! insert marker carrying the record offset, or a delete tombstone —
//! with the later write winning, so folding layer B onto layer A is just
//! replaying B's slots.
//!
//! The structure is two-level: sorted buckets of bounded size under a
//! sparse index of bucket-first keys. Point operations binary-search the
//! bucket list then the bucket, and a full bucket splits in half, so
//! both stay O(log n) with good constants for the few-thousand-entry
//! deltas that transactions actually produce.
//!
//! Size is capped at [`MAP_LIMIT`](crate::config::MAP_LIMIT); the owning
//! transaction turns an overflow into a fatal error rather than letting
//! a runaway transaction exhaust memory.

use crate::storage::Offset;

use super::fbtree::Seek;

const BUCKET_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbSlot {
    Insert(Offset),
    /// Tombstone hiding any underlying entry; keeps the dead record's
    /// offset for size accounting.
    Delete(Offset),
}

#[derive(Debug, Clone, Default)]
pub struct Mbtree {
    buckets: Vec<Vec<(Vec<u8>, MbSlot)>>,
    count: usize,
}

impl Mbtree {
    pub fn new() -> Mbtree {
        Mbtree {
            buckets: vec![Vec::new()],
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn bucket_for(&self, key: &[u8]) -> usize {
        let i = self
            .buckets
            .partition_point(|b| b.first().is_some_and(|(k, _)| k.as_slice() <= key));
        i.saturating_sub(1)
    }

    pub fn insert(&mut self, key: &[u8], off: Offset) {
        self.set(key, MbSlot::Insert(off));
    }

    pub fn delete(&mut self, key: &[u8], off: Offset) {
        self.set(key, MbSlot::Delete(off));
    }

    pub fn set(&mut self, key: &[u8], slot: MbSlot) {
        let b = self.bucket_for(key);
        let bucket = &mut self.buckets[b];
        match bucket.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => bucket[i].1 = slot,
            Err(i) => {
                bucket.insert(i, (key.to_vec(), slot));
                self.count += 1;
                if bucket.len() > BUCKET_LIMIT {
                    let upper = bucket.split_off(bucket.len() / 2);
                    self.buckets.insert(b + 1, upper);
                }
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<MbSlot> {
        let bucket = &self.buckets[self.bucket_for(key)];
        bucket
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| bucket[i].1)
    }

    /// Neighboring entry in the given direction, mirroring
    /// [`Fbtree::seek`](super::fbtree::Fbtree::seek).
    pub fn seek(&self, key: &[u8], mode: Seek) -> Option<(&[u8], MbSlot)> {
        let b = self.bucket_for(key);
        let bucket = &self.buckets[b];
        let pos = bucket.binary_search_by(|(k, _)| k.as_slice().cmp(key));
        let i: isize = match (pos, mode) {
            (Ok(i), Seek::Ge) | (Err(i), Seek::Ge) | (Err(i), Seek::Gt) => i as isize,
            (Ok(i), Seek::Gt) => i as isize + 1,
            (Ok(i), Seek::Le) => i as isize,
            (Err(i), Seek::Le) | (Ok(i), Seek::Lt) | (Err(i), Seek::Lt) => i as isize - 1,
        };
        match mode {
            Seek::Gt | Seek::Ge => {
                if (i as usize) < bucket.len() {
                    let (k, s) = &bucket[i as usize];
                    return Some((k, *s));
                }
                self.buckets[b + 1..]
                    .iter()
                    .find_map(|bk| bk.first())
                    .map(|(k, s)| (k.as_slice(), *s))
            }
            Seek::Lt | Seek::Le => {
                if i >= 0 {
                    let (k, s) = &bucket[i as usize];
                    return Some((k, *s));
                }
                self.buckets[..b]
                    .iter()
                    .rev()
                    .find_map(|bk| bk.last())
                    .map(|(k, s)| (k.as_slice(), *s))
            }
        }
    }

    pub fn edge(&self, first: bool) -> Option<(&[u8], MbSlot)> {
        if first {
            self.buckets.iter().find_map(|b| b.first())
        } else {
            self.buckets.iter().rev().find_map(|b| b.last())
        }
        .map(|(k, s)| (k.as_slice(), *s))
    }

    /// Visits every slot in key order.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], MbSlot)) {
        for bucket in &self.buckets {
            for (k, s) in bucket {
                f(k, *s);
            }
        }
    }

    /// Replays `newer`'s slots onto this tree (newer slots win).
    pub fn fold_in(&mut self, newer: &Mbtree) {
        newer.for_each(|k, s| self.set(k, s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> Vec<u8> {
        format!("k{:06}", i).into_bytes()
    }

    #[test]
    fn set_get_overwrite() {
        let mut mb = Mbtree::new();
        mb.insert(b"b", 2);
        mb.insert(b"a", 1);
        assert_eq!(mb.get(b"a"), Some(MbSlot::Insert(1)));
        mb.delete(b"a", 1);
        assert_eq!(mb.get(b"a"), Some(MbSlot::Delete(1)));
        assert_eq!(mb.len(), 2); // delete replaced the slot, no new entry
        assert_eq!(mb.get(b"zz"), None);
    }

    #[test]
    fn stays_ordered_across_splits() {
        let mut mb = Mbtree::new();
        for i in 0..2000u32 {
            mb.insert(&key((i * 7919) % 2000), i as u64);
        }
        assert_eq!(mb.len(), 2000);
        let mut prev: Option<Vec<u8>> = None;
        let mut n = 0;
        mb.for_each(|k, _| {
            if let Some(p) = &prev {
                assert!(p.as_slice() < k);
            }
            prev = Some(k.to_vec());
            n += 1;
        });
        assert_eq!(n, 2000);
    }

    #[test]
    fn seek_modes() {
        let mut mb = Mbtree::new();
        for i in [10u32, 20, 30] {
            mb.insert(&key(i), i as u64);
        }
        assert_eq!(mb.seek(&key(15), Seek::Gt).unwrap().0, key(20));
        assert_eq!(mb.seek(&key(20), Seek::Gt).unwrap().0, key(30));
        assert_eq!(mb.seek(&key(20), Seek::Ge).unwrap().0, key(20));
        assert_eq!(mb.seek(&key(20), Seek::Lt).unwrap().0, key(10));
        assert_eq!(mb.seek(&key(30), Seek::Gt), None);
        assert_eq!(mb.seek(&key(10), Seek::Lt), None);
        assert_eq!(mb.edge(true).unwrap().0, key(10));
        assert_eq!(mb.edge(false).unwrap().0, key(30));
    }

    #[test]
    fn fold_in_newer_wins() {
        let mut old = Mbtree::new();
        old.insert(b"a", 1);
        old.insert(b"b", 2);
        let mut newer = Mbtree::new();
        newer.delete(b"a", 1);
        newer.insert(b"c", 3);
        old.fold_in(&newer);
        assert_eq!(old.get(b"a"), Some(MbSlot::Delete(1)));
        assert_eq!(old.get(b"b"), Some(MbSlot::Insert(2)));
        assert_eq!(old.get(b"c"), Some(MbSlot::Insert(3)));
    }
}
