//! Temp index: materialized ordering over arbitrary query output,
//! inserted by the planner wherever a parent needs an order its child
//! cannot natively deliver.
//!
//! All input rows are drained once and their addresses pushed through
//! the external [`sortlist`](crate::sortlist) keyed by the requested
//! columns. Single-table sources store bare record offsets; rows with
//! multiple parts or derived records go through a side heap with a
//! compact encoding per part — a record offset, or `MULTI_MASK | size`
//! followed by the derived record's bytes. The sorted sequence then
//! serves `get` in either direction, `seek`, and point `lookup`s.

use std::sync::Arc;

use eyre::Result;

use crate::config::{DERIVED_MAX_SIZE, HEAP_CHUNK_SIZE};
use crate::errors::runtime;
use crate::record::Record;
use crate::sortlist::{SortedList, Sorting};
use crate::storage::{self, Offset, Store};
use crate::tran::QueryTran;

use super::{Approach, Cost, DbRec, Dir, Header, Mode, Query, Row, Thread};

/// Distinguishes heap-stored derived records from record offsets.
pub const MULTI_MASK: u64 = 0xffff000000;

pub struct TempIndex {
    source: Box<dyn Query>,
    pub order: Vec<String>,
    hdr: Header,
    single: bool,
    store: Option<Arc<Store>>,
    built: Option<Built>,
    sel: Option<Vec<Vec<u8>>>,
}

struct Built {
    list: SortedList,
    heap: Option<Arc<Store>>,
    nrecs: usize,
    pos: Pos,
}

enum Pos {
    Rewound,
    At(usize),
    Eof,
}

impl TempIndex {
    pub fn new(source: Box<dyn Query>, order: Vec<String>) -> TempIndex {
        let hdr = source.header();
        let single = source.single_table();
        TempIndex {
            source,
            order,
            hdr,
            single,
            store: None,
            built: None,
            sel: None,
        }
    }

    /// Captures the store handle the sort comparator reads records
    /// through.
    pub fn bind(&mut self, tran: &dyn QueryTran) {
        self.store = Some(Arc::clone(tran.store()));
    }

    fn build(&mut self, th: &Thread) -> Result<Built> {
        let store = Arc::clone(self.store.as_ref().expect("TempIndex not bound"));
        let hdr = self.hdr.clone();
        let order = self.order.clone();
        self.source.rewind();
        if self.single {
            let cmp_store = Arc::clone(&store);
            let cmp_hdr = hdr.clone();
            let cmp_order = order.clone();
            let mut sorting = Sorting::new(move |x, y| {
                let rx = single_row(&cmp_store, x);
                let ry = single_row(&cmp_store, y);
                row_less(&cmp_hdr, &cmp_order, &rx, &ry)
            });
            while let Some(row) = self.source.get(th, Dir::Next)? {
                th.check_interrupt()?;
                sorting.add(row.0[0].off);
            }
            return Ok(Built {
                list: sorting.finish(),
                heap: None,
                nrecs: 1,
                pos: Pos::Rewound,
            });
        }
        // multi: rows go through a side heap
        let heap = Arc::new(Store::heap(HEAP_CHUNK_SIZE));
        heap.alloc(1); // keep offset 0 unused
        let nrecs = hdr.fields.len();
        let cmp_store = Arc::clone(&store);
        let cmp_heap = Arc::clone(&heap);
        let cmp_hdr = hdr.clone();
        let cmp_order = order.clone();
        let mut sorting = Sorting::new(move |x, y| {
            let rx = multi_row(&cmp_store, &cmp_heap, x, nrecs);
            let ry = multi_row(&cmp_store, &cmp_heap, y, nrecs);
            row_less(&cmp_hdr, &cmp_order, &rx, &ry)
        });
        while let Some(row) = self.source.get(th, Dir::Next)? {
            th.check_interrupt()?;
            debug_assert_eq!(row.0.len(), nrecs);
            let mut n = nrecs * storage::SMALL_OFFSET_LEN;
            for dbrec in &row.0 {
                if dbrec.off == 0 {
                    n += dbrec.rec.len();
                }
            }
            if n > DERIVED_MAX_SIZE {
                return Err(runtime(format!(
                    "temp index: derived row too large ({} > {})",
                    n, DERIVED_MAX_SIZE
                )));
            }
            let (off, buf) = heap.alloc(n);
            let mut at = 0;
            for dbrec in &row.0 {
                if dbrec.off > 0 {
                    storage::write_small_offset(&mut buf[at..], dbrec.off);
                    at += storage::SMALL_OFFSET_LEN;
                } else {
                    let size = dbrec.rec.len() as u64;
                    storage::write_small_offset(&mut buf[at..], MULTI_MASK | size);
                    at += storage::SMALL_OFFSET_LEN;
                    buf[at..at + size as usize].copy_from_slice(dbrec.rec.bytes());
                    at += size as usize;
                }
            }
            sorting.add(off);
        }
        Ok(Built {
            list: sorting.finish(),
            heap: Some(heap),
            nrecs,
            pos: Pos::Rewound,
        })
    }

    fn row_at(&self, off: Offset) -> Row {
        let built = self.built.as_ref().unwrap();
        let store = self.store.as_ref().unwrap();
        match &built.heap {
            None => single_row(store, off),
            Some(heap) => multi_row(store, heap, off, built.nrecs),
        }
    }

    fn order_key(&self, row: &Row) -> Vec<Vec<u8>> {
        self.order
            .iter()
            .map(|c| row.get_raw(&self.hdr, c))
            .collect()
    }

    /// row-key >= vals (prefix comparison on the order columns)
    fn reached(&self, off: Offset, vals: &[Vec<u8>]) -> bool {
        let row = self.row_at(off);
        let key = self.order_key(&row);
        for (k, v) in key.iter().zip(vals) {
            match k.cmp(v) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Greater => return true,
                std::cmp::Ordering::Equal => {}
            }
        }
        true
    }

    /// row-key > vals strictly (first row past an equality selection)
    fn reached_past(&self, off: Offset, vals: &[Vec<u8>]) -> bool {
        let row = self.row_at(off);
        let key = self.order_key(&row);
        for (k, v) in key.iter().zip(vals) {
            match k.cmp(v) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Greater => return true,
                std::cmp::Ordering::Equal => {}
            }
        }
        false
    }

    fn selected(&self, row: &Row) -> bool {
        match &self.sel {
            None => true,
            Some(vals) => self
                .order
                .iter()
                .zip(vals)
                .all(|(c, v)| row.get_raw(&self.hdr, c) == *v),
        }
    }

    fn ensure_built(&mut self, th: &Thread) -> Result<()> {
        if self.built.is_none() {
            self.built = Some(self.build(th)?);
        }
        Ok(())
    }
}

fn single_row(store: &Store, off: Offset) -> Row {
    let rec = Record::read(store, off).unwrap_or_else(|_| Record::empty());
    Row::single(rec, off)
}

fn multi_row(store: &Store, heap: &Store, off: Offset, nrecs: usize) -> Row {
    let mut parts = Vec::with_capacity(nrecs);
    let mut buf = heap.data(off);
    for _ in 0..nrecs {
        let tag = storage::read_small_offset(buf);
        buf = &buf[storage::SMALL_OFFSET_LEN..];
        if tag < MULTI_MASK {
            let rec = Record::read(store, tag).unwrap_or_else(|_| Record::empty());
            parts.push(DbRec::stored(rec, tag));
        } else {
            let size = (tag & !MULTI_MASK) as usize;
            parts.push(DbRec::derived(Record::from_vec(buf[..size].to_vec())));
            buf = &buf[size..];
        }
    }
    Row(parts)
}

fn row_less(hdr: &Header, order: &[String], a: &Row, b: &Row) -> bool {
    for col in order {
        let x = a.get_raw(hdr, col);
        let y = b.get_raw(hdr, col);
        match x.cmp(&y) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }
    }
    false
}

impl Query for TempIndex {
    fn columns(&self) -> Vec<String> {
        self.source.columns()
    }

    fn header(&self) -> Header {
        self.source.header()
    }

    fn keys(&self) -> Vec<Vec<String>> {
        self.source.keys()
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        vec![self.order.clone()]
    }

    fn nrows(&self) -> (i64, i64) {
        self.source.nrows()
    }

    fn row_size(&self) -> i64 {
        self.source.row_size()
    }

    fn transform(self: Box<Self>) -> Box<dyn Query> {
        self
    }

    fn optimize(&mut self, _mode: Mode, _index: Option<&[String]>, _frac: f64)
        -> (Cost, Cost, Approach) {
        unreachable!("TempIndex is inserted after optimization")
    }

    fn set_approach(
        &mut self,
        _mode: Mode,
        _index: Option<&[String]>,
        _frac: f64,
        _approach: Approach,
        _tran: &dyn QueryTran,
    ) {
        unreachable!("TempIndex is inserted after optimization")
    }

    fn rewind(&mut self) {
        if let Some(built) = &mut self.built {
            built.pos = Pos::Rewound;
        }
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        th.check_interrupt()?;
        self.ensure_built(th)?;
        let len = self.built.as_ref().unwrap().list.len();
        let i = match (&self.built.as_ref().unwrap().pos, dir) {
            // with a selection installed, a rewound forward read seeks
            // to the selection start instead of scanning from the top
            (Pos::Rewound, Dir::Next) => match &self.sel {
                Some(vals) => {
                    let vals = vals.clone();
                    let built = self.built.as_ref().unwrap();
                    let i = built.list.lower_bound(|off| self.reached(off, &vals));
                    if i < len {
                        Some(i)
                    } else {
                        None
                    }
                }
                None if len > 0 => Some(0),
                None => None,
            },
            (Pos::Rewound, Dir::Prev) => match &self.sel {
                Some(vals) => {
                    // last row inside the selection: one before the
                    // first row strictly past it
                    let vals = vals.clone();
                    let built = self.built.as_ref().unwrap();
                    let i = built.list.lower_bound(|off| self.reached_past(off, &vals));
                    i.checked_sub(1)
                }
                None => len.checked_sub(1),
            },
            (Pos::At(i), Dir::Next) => {
                if i + 1 < len {
                    Some(i + 1)
                } else {
                    None
                }
            }
            (Pos::At(i), Dir::Prev) => i.checked_sub(1),
            (Pos::Eof, _) => None,
        };
        match i {
            Some(i) => {
                let off = {
                    let built = self.built.as_mut().unwrap();
                    built.pos = Pos::At(i);
                    built.list.get(i)
                };
                let row = self.row_at(off);
                Ok(if self.selected(&row) { Some(row) } else { None })
            }
            None => {
                self.built.as_mut().unwrap().pos = Pos::Eof;
                Ok(None)
            }
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.rewind();
        if cols.is_empty() {
            self.sel = None;
            return;
        }
        // restriction values in order-column order, as far as they go
        let mut sel = Vec::new();
        for col in &self.order {
            match cols.iter().position(|c| c == col) {
                Some(i) => sel.push(vals[i].clone()),
                None => break,
            }
        }
        self.sel = if sel.is_empty() { None } else { Some(sel) };
    }

    fn lookup(&mut self, th: &Thread, cols: &[String], vals: &[Vec<u8>]) -> Result<Option<Row>> {
        self.ensure_built(th)?;
        let mut key = Vec::new();
        for col in &self.order {
            match cols.iter().position(|c| c == col) {
                Some(i) => key.push(vals[i].clone()),
                None => break,
            }
        }
        let built = self.built.as_ref().unwrap();
        let i = built.list.lower_bound(|off| self.reached(off, &key));
        if i >= built.list.len() {
            return Ok(None);
        }
        let row = self.row_at(built.list.get(i));
        let matches = self
            .order
            .iter()
            .zip(&key)
            .all(|(c, v)| row.get_raw(&self.hdr, c) == *v);
        Ok(if matches { Some(row) } else { None })
    }

    fn single_table(&self) -> bool {
        self.single
    }

    fn describe(&self) -> String {
        format!(
            "{} TEMPINDEX({})",
            self.source.describe(),
            self.order.join(",")
        )
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

