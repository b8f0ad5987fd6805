//! The leaf operator: reads one stored table through an index overlay.
//!
//! `optimize` offers every index whose columns start with the requested
//! order; `set_approach` opens a cursor over the chosen overlay
//! (including the update transaction's private layer). `select` narrows
//! the cursor to an encoded key range when the restricted columns form
//! a prefix of the chosen index, and falls back to row filtering when
//! they don't — the restriction is always enforced either way.
//!
//! Reads register their covered range with the transaction on first
//! access after a rewind, which is what commit-time conflict detection
//! checks against.

use std::sync::Arc;

use eyre::Result;

use crate::encoding::ixkey::IndexMode;
use crate::errors::query_error;
use crate::index::OverlayIter;
use crate::meta::TableMeta;
use crate::tran::QueryTran;

use super::{Approach, Cost, Dir, Header, Mode, Query, Row, Thread, IMPOSSIBLE};

pub struct Table {
    pub name: String,
    tm: Arc<TableMeta>,
    iix: usize,
    iter: Option<OverlayIter>,
    sel: Option<Sel>,
    tracked: bool,
}

struct Sel {
    org: Vec<u8>,
    end: Vec<u8>,
    /// residual equality filters (field position, packed value) for
    /// restricted columns that are not a prefix of the chosen index
    filters: Vec<(usize, Vec<u8>)>,
}

impl Table {
    pub fn new(name: &str, tran: &dyn QueryTran) -> Result<Table> {
        let tm = tran
            .state()
            .meta
            .must_get(name)
            .map_err(|_| query_error(format!("nonexistent table: {}", name)))?
            .clone();
        Ok(Table {
            name: name.to_string(),
            tm,
            iix: 0,
            iter: None,
            sel: None,
            tracked: false,
        })
    }

    fn index_matching(&self, index: &[String]) -> Option<usize> {
        self.tm
            .schema
            .indexes
            .iter()
            .position(|ix| ix.columns.starts_with(index))
    }

    fn scan_cost(&self, frac: f64) -> Cost {
        let (nrows, _) = self.nrows();
        let size = self.tm.info.size.max(nrows as u64) as f64;
        (size * frac) as Cost + 1
    }

    fn apply_sel(&mut self) {
        if let Some(iter) = &mut self.iter {
            match &self.sel {
                Some(sel) => iter.set_range(sel.org.clone(), sel.end.clone()),
                None => iter.set_range(
                    crate::encoding::ixkey::MIN.to_vec(),
                    crate::encoding::ixkey::max(),
                ),
            }
        }
        self.tracked = false;
    }

    fn track(&mut self, th: &Thread) {
        if !self.tracked {
            let (org, end) = match &self.sel {
                Some(sel) => (sel.org.clone(), sel.end.clone()),
                None => (
                    crate::encoding::ixkey::MIN.to_vec(),
                    crate::encoding::ixkey::max(),
                ),
            };
            th.tran.track_read(&self.name, self.iix, &org, &end);
            self.tracked = true;
        }
    }
}

impl Query for Table {
    fn columns(&self) -> Vec<String> {
        self.tm.schema.columns.clone()
    }

    fn header(&self) -> Header {
        Header::single(self.tm.schema.columns.clone())
    }

    fn keys(&self) -> Vec<Vec<String>> {
        self.tm.schema.keys()
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.tm
            .schema
            .indexes
            .iter()
            .map(|ix| ix.columns.clone())
            .collect()
    }

    fn nrows(&self) -> (i64, i64) {
        let n = self.tm.info.nrows as i64;
        (n, n)
    }

    fn row_size(&self) -> i64 {
        let (n, _) = self.nrows();
        if n == 0 {
            16
        } else {
            (self.tm.info.size / n as u64).max(1) as i64
        }
    }

    fn transform(self: Box<Self>) -> Box<dyn Query> {
        self
    }

    fn optimize(&mut self, _mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        match index {
            None => (0, self.scan_cost(frac), Approach::TableIndex(0)),
            Some(index) => match self.index_matching(index) {
                Some(iix) => {
                    // secondary indexes pay an extra dereference per row
                    let penalty = if iix == 0 { 1.0 } else { 1.5 };
                    (
                        0,
                        (self.scan_cost(frac) as f64 * penalty) as Cost,
                        Approach::TableIndex(iix),
                    )
                }
                None => (IMPOSSIBLE, IMPOSSIBLE, Approach::None),
            },
        }
    }

    fn set_approach(
        &mut self,
        _mode: Mode,
        _index: Option<&[String]>,
        _frac: f64,
        approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let Approach::TableIndex(iix) = approach else {
            panic!("Table: unexpected approach");
        };
        self.iix = iix;
        let ov = self.tm.indexes[iix].clone();
        let extra = tran.extra_layer(&self.name, iix);
        self.iter = Some(OverlayIter::new(ov, extra));
        self.apply_sel();
    }

    fn rewind(&mut self) {
        if let Some(iter) = &mut self.iter {
            iter.rewind();
        }
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        self.track(th);
        loop {
            th.check_interrupt()?;
            let entry = {
                let iter = self.iter.as_mut().expect("Table: get before set_approach");
                match dir {
                    Dir::Next => iter.next()?,
                    Dir::Prev => iter.prev()?,
                }
            };
            let Some((_key, off)) = entry else {
                return Ok(None);
            };
            let rec = th.tran.get_record(off)?;
            if let Some(sel) = &self.sel {
                if !sel.filters.iter().all(|(fld, val)| rec.field(*fld) == val) {
                    continue;
                }
            }
            return Ok(Some(Row::single(rec, off)));
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        if cols.is_empty() {
            self.sel = None;
            self.apply_sel();
            return;
        }
        let ix = &self.tm.schema.indexes[self.iix];
        // leading index columns restricted by the select become the range
        let mut prefix: Vec<Vec<u8>> = Vec::new();
        for ixcol in &ix.columns {
            match cols.iter().position(|c| c == ixcol) {
                Some(i) => prefix.push(vals[i].clone()),
                None => break,
            }
        }
        let (org, end) = if prefix.is_empty() {
            (
                crate::encoding::ixkey::MIN.to_vec(),
                crate::encoding::ixkey::max(),
            )
        } else if prefix.len() == ix.spec.fields.len() && ix.spec.mode == IndexMode::Key {
            let k = ix.spec.prefix(&prefix);
            let mut end = k.clone();
            end.push(0x00);
            (k, end)
        } else {
            ix.spec.prefix_range(&ix.spec.prefix(&prefix))
        };
        // everything else is enforced by row filtering
        let filters = cols
            .iter()
            .zip(vals)
            .filter(|(c, _)| !ix.columns.iter().take(prefix.len()).any(|ic| ic == *c))
            .filter_map(|(c, v)| self.tm.schema.col(c).map(|fld| (fld, v.clone())))
            .collect();
        self.sel = Some(Sel { org, end, filters });
        self.apply_sel();
    }

    fn single_table(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        let mut s = self.name.clone();
        if self.iter.is_some() {
            s.push_str(&format!(
                "^({})",
                self.tm.schema.indexes[self.iix].columns.join(",")
            ));
        }
        s
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
