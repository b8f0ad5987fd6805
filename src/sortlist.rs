//! # External Sort of Record Offsets
//!
//! Temp indexes sort arbitrary query output by buffering record
//! offsets (or side-heap offsets) and sorting them with a caller
//! comparator that reads the underlying rows.
//!
//! Offsets accumulate in fixed-size blocks. Each full block is handed to
//! a background sorter thread over a channel — the producer keeps
//! pulling rows while earlier blocks sort — and `finish` closes the
//! channel, collects the sorted blocks, and k-way merges them into the
//! final sequence. The result serves a bidirectional, seekable iterator.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::SORT_BLOCK;
use crate::storage::Offset;

type Less = dyn Fn(Offset, Offset) -> bool + Send + Sync;

pub struct Sorting {
    less: std::sync::Arc<Less>,
    cur: Vec<Offset>,
    tx: Option<Sender<Vec<Offset>>>,
    rx: Receiver<Vec<Offset>>,
    worker: Option<JoinHandle<()>>,
}

impl Sorting {
    pub fn new(less: impl Fn(Offset, Offset) -> bool + Send + Sync + 'static) -> Sorting {
        let less: std::sync::Arc<Less> = std::sync::Arc::new(less);
        let (tx, work_rx) = unbounded::<Vec<Offset>>();
        let (sorted_tx, rx) = unbounded::<Vec<Offset>>();
        let sorter_less = std::sync::Arc::clone(&less);
        let worker = std::thread::Builder::new()
            .name("sortlist".into())
            .spawn(move || {
                for mut block in work_rx {
                    block.sort_by(|&a, &b| {
                        if sorter_less(a, b) {
                            std::cmp::Ordering::Less
                        } else if sorter_less(b, a) {
                            std::cmp::Ordering::Greater
                        } else {
                            std::cmp::Ordering::Equal
                        }
                    });
                    if sorted_tx.send(block).is_err() {
                        return;
                    }
                }
            })
            .expect("spawn sortlist worker");
        Sorting {
            less,
            cur: Vec::with_capacity(SORT_BLOCK),
            tx: Some(tx),
            rx,
            worker: Some(worker),
        }
    }

    pub fn add(&mut self, off: Offset) {
        self.cur.push(off);
        if self.cur.len() >= SORT_BLOCK {
            let block = std::mem::replace(&mut self.cur, Vec::with_capacity(SORT_BLOCK));
            if let Some(tx) = &self.tx {
                let _ = tx.send(block);
            }
        }
    }

    pub fn finish(mut self) -> SortedList {
        if !self.cur.is_empty() {
            let block = std::mem::take(&mut self.cur);
            if let Some(tx) = &self.tx {
                let _ = tx.send(block);
            }
        }
        self.tx.take(); // close: worker drains and exits
        let blocks: Vec<Vec<Offset>> = self.rx.iter().collect();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
        // k-way merge
        let total: usize = blocks.iter().map(Vec::len).sum();
        let mut merged = Vec::with_capacity(total);
        let mut pos = vec![0usize; blocks.len()];
        loop {
            let mut best: Option<usize> = None;
            for (b, p) in pos.iter().enumerate() {
                if *p >= blocks[b].len() {
                    continue;
                }
                best = match best {
                    None => Some(b),
                    Some(cur) if (self.less)(blocks[b][*p], blocks[cur][pos[cur]]) => Some(b),
                    keep => keep,
                };
            }
            match best {
                None => break,
                Some(b) => {
                    merged.push(blocks[b][pos[b]]);
                    pos[b] += 1;
                }
            }
        }
        SortedList { items: merged }
    }
}

pub struct SortedList {
    items: Vec<Offset>,
}

impl SortedList {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, i: usize) -> Offset {
        self.items[i]
    }

    /// Index of the first element for which `reached` is true
    /// (`reached` must be monotone over the sorted order).
    pub fn lower_bound(&self, reached: impl Fn(Offset) -> bool) -> usize {
        self.items.partition_point(|&off| !reached(off))
    }

    pub fn iter(&self) -> SortIter<'_> {
        SortIter {
            list: self,
            pos: IterPos::Rewound,
        }
    }
}

enum IterPos {
    Rewound,
    At(usize),
    Eof,
}

/// Bidirectional cursor over the merged sequence. Like the index
/// cursors, eof is sticky until `rewind`.
pub struct SortIter<'a> {
    list: &'a SortedList,
    pos: IterPos,
}

impl SortIter<'_> {
    pub fn rewind(&mut self) {
        self.pos = IterPos::Rewound;
    }

    pub fn next(&mut self) -> Option<Offset> {
        let i = match self.pos {
            IterPos::Rewound => 0,
            IterPos::At(i) => i + 1,
            IterPos::Eof => return None,
        };
        if i < self.list.items.len() {
            self.pos = IterPos::At(i);
            Some(self.list.items[i])
        } else {
            self.pos = IterPos::Eof;
            None
        }
    }

    pub fn prev(&mut self) -> Option<Offset> {
        let i = match self.pos {
            IterPos::Rewound => self.list.items.len().checked_sub(1),
            IterPos::At(i) => i.checked_sub(1),
            IterPos::Eof => None,
        };
        match i {
            Some(i) => {
                self.pos = IterPos::At(i);
                Some(self.list.items[i])
            }
            None => {
                self.pos = IterPos::Eof;
                None
            }
        }
    }

    /// Positions at the first element for which `reached` is true
    /// (elements are ordered, so `reached` must be monotone) and returns
    /// it.
    pub fn seek(&mut self, reached: impl Fn(Offset) -> bool) -> Option<Offset> {
        let i = self.list.items.partition_point(|&off| !reached(off));
        if i < self.list.items.len() {
            self.pos = IterPos::At(i);
            Some(self.list.items[i])
        } else {
            self.pos = IterPos::Eof;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(vals: &[u64]) -> SortedList {
        let mut s = Sorting::new(|a, b| a < b);
        for &v in vals {
            s.add(v);
        }
        s.finish()
    }

    #[test]
    fn sorts_across_blocks() {
        let vals: Vec<u64> = (0..20_000).map(|i| (i * 7919) % 20_000).collect();
        let list = build(&vals);
        assert_eq!(list.len(), 20_000);
        let mut it = list.iter();
        for want in 0..20_000u64 {
            assert_eq!(it.next(), Some(want));
        }
        assert_eq!(it.next(), None);
        assert_eq!(it.next(), None); // sticky eof
    }

    #[test]
    fn bidirectional_and_seek() {
        let list = build(&[30, 10, 20]);
        let mut it = list.iter();
        assert_eq!(it.next(), Some(10));
        assert_eq!(it.next(), Some(20));
        assert_eq!(it.prev(), Some(10));
        assert_eq!(it.seek(|off| off >= 15), Some(20));
        assert_eq!(it.next(), Some(30));
        assert_eq!(it.prev(), Some(20));
        it.rewind();
        assert_eq!(it.prev(), Some(30)); // prev from rewound starts at the end
    }

    #[test]
    fn custom_comparator() {
        let mut s = Sorting::new(|a, b| b < a); // descending
        for v in [1u64, 3, 2] {
            s.add(v);
        }
        let list = s.finish();
        let mut it = list.iter();
        assert_eq!(it.next(), Some(3));
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.next(), Some(1));
    }
}
