//! `join`, `leftjoin`, `times`: combine two sources row-wise.
//!
//! Execution is a lookup join: source1 drives, and for each of its rows
//! source2 is restricted (via `select`) to the matching join-column
//! values and drained. When the join columns cover a key of source2
//! each left row matches at most once. `leftjoin` emits the left row
//! padded with an empty part when no match exists; `times` is the
//! degenerate case of no join columns at all.

use eyre::Result;

use crate::tran::QueryTran;

use super::compatible::{all_cols, common_cols};
use super::{
    contains_key, join_rows, set_approach, Approach, Cost, DbRec, Dir, Header, Mode, Query, Row,
    Thread, IMPOSSIBLE, OUT_OF_ORDER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Times,
}

#[derive(Debug, Clone, Default)]
pub struct JoinApproach {
    index: Option<Vec<String>>,
}

pub struct Join {
    source1: Box<dyn Query>,
    source2: Box<dyn Query>,
    pub kind: JoinKind,
    by: Vec<String>,
    // execution
    hdr1: Option<Header>,
    empty2: usize,
    row1: Option<Row>,
    matched: bool,
    filters: Vec<(String, Vec<u8>)>,
}

impl Join {
    pub fn new(
        source1: Box<dyn Query>,
        source2: Box<dyn Query>,
        kind: JoinKind,
        by: Option<Vec<String>>,
    ) -> Result<Join> {
        let common = common_cols(source1.as_ref(), source2.as_ref());
        let by = match by {
            Some(by) => {
                if by.iter().any(|c| !common.contains(c)) {
                    return Err(crate::errors::query_error(
                        "join by columns must be common to both sources",
                    ));
                }
                by
            }
            None => common,
        };
        if kind == JoinKind::Times && !by.is_empty() {
            return Err(crate::errors::query_error(
                "times requires disjoint columns",
            ));
        }
        Ok(Join {
            source1,
            source2,
            kind,
            by,
            hdr1: None,
            empty2: 0,
            row1: None,
            matched: false,
            filters: Vec::new(),
        })
    }

    fn restrict2(&mut self, row1: &Row) {
        if self.kind == JoinKind::Times {
            self.source2.select(&[], &[]);
            self.source2.rewind();
            return;
        }
        let hdr1 = self.hdr1.as_ref().unwrap();
        let vals: Vec<Vec<u8>> = self.by.iter().map(|c| row1.get_raw(hdr1, c)).collect();
        let cols = self.by.clone();
        self.source2.select(&cols, &vals);
    }
}

impl Query for Join {
    fn columns(&self) -> Vec<String> {
        all_cols(self.source1.as_ref(), self.source2.as_ref())
    }

    fn header(&self) -> Header {
        self.source1.header().concat(&self.source2.header())
    }

    fn keys(&self) -> Vec<Vec<String>> {
        // when the join columns cover a key of source2, each left row
        // joins at most one right row, so source1's keys still hold
        if self.kind != JoinKind::Times && contains_key(&self.by, &self.source2.keys()) {
            return self.source1.keys();
        }
        vec![self.columns()]
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.source1.indexes()
    }

    fn nrows(&self) -> (i64, i64) {
        let (n1, p1) = self.source1.nrows();
        let (n2, p2) = self.source2.nrows();
        match self.kind {
            JoinKind::Times => (n1.saturating_mul(n2), p1.saturating_mul(p2)),
            JoinKind::Left => (n1.max(1), p1),
            JoinKind::Inner => {
                if contains_key(&self.by, &self.source2.keys()) {
                    (n1.min(n2 * 2), p1)
                } else {
                    ((n1.saturating_mul(n2) / 10).max(n1), p1.saturating_mul(p2))
                }
            }
        }
    }

    fn row_size(&self) -> i64 {
        self.source1.row_size() + self.source2.row_size()
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source1 = self.source1.transform();
        self.source2 = self.source2.transform();
        let nothing1 = self.source1.as_any().is::<super::nothing::Nothing>();
        let nothing2 = self.source2.as_any().is::<super::nothing::Nothing>();
        if nothing1 || (nothing2 && self.kind != JoinKind::Left) {
            return Box::new(super::nothing::Nothing::new(self.columns()));
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        if let Some(index) = index {
            // join preserves source1's order; source2-only columns in
            // the required order cannot be delivered
            let cols1 = self.source1.columns();
            if index.iter().any(|c| !cols1.contains(c)) {
                return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
            }
        }
        let (fix1, var1) = super::optimize_cost(self.source1.as_mut(), mode, index, frac);
        if fix1 + var1 >= IMPOSSIBLE {
            return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
        }
        let (n1, _) = self.source1.nrows();
        let (fix2, var2) = super::optimize_cost(self.source2.as_mut(), mode, None, 0.0);
        let probes = ((n1.max(1) as f64) * frac) as Cost * OUT_OF_ORDER;
        (
            fix1 + fix2,
            var1 + var2 + probes,
            Approach::Join(JoinApproach {
                index: index.map(|ix| ix.to_vec()),
            }),
        )
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        _index: Option<&[String]>,
        frac: f64,
        approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let Approach::Join(app) = approach else {
            panic!("Join: unexpected approach");
        };
        let s1 = std::mem::replace(
            &mut self.source1,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source1 = set_approach(s1, mode, app.index.as_deref(), frac, tran);
        let s2 = std::mem::replace(
            &mut self.source2,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source2 = set_approach(s2, mode, None, 0.0, tran);
        self.hdr1 = Some(self.source1.header());
        self.empty2 = self.source2.header().fields.len();
        self.row1 = None;
    }

    fn rewind(&mut self) {
        self.source1.rewind();
        self.row1 = None;
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        let hdr = self.header();
        'outer: loop {
            th.check_interrupt()?;
            if self.row1.is_none() {
                let Some(r1) = self.source1.get(th, dir)? else {
                    return Ok(None);
                };
                self.restrict2(&r1);
                self.row1 = Some(r1);
                self.matched = false;
            }
            while let Some(r2) = self.source2.get(th, dir)? {
                self.matched = true;
                let row1 = self.row1.as_ref().unwrap();
                let out = join_rows(row1, &r2);
                for (col, val) in &self.filters {
                    if out.get_raw(&hdr, col) != *val {
                        continue 'outer;
                    }
                }
                return Ok(Some(out));
            }
            let row1 = self.row1.take().unwrap();
            if self.kind == JoinKind::Left && !self.matched {
                let out = join_rows(&row1, &Row(vec![DbRec::missing(); self.empty2]));
                let keep = self
                    .filters
                    .iter()
                    .all(|(col, val)| out.get_raw(&hdr, col) == *val);
                if keep {
                    return Ok(Some(out));
                }
            }
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.row1 = None;
        if cols.is_empty() {
            self.filters.clear();
            self.source1.select(&[], &[]);
            return;
        }
        let cols1 = self.source1.columns();
        let mut c1 = Vec::new();
        let mut v1 = Vec::new();
        self.filters.clear();
        for (c, v) in cols.iter().zip(vals) {
            if cols1.contains(c) {
                c1.push(c.clone());
                v1.push(v.clone());
            } else {
                self.filters.push((c.clone(), v.clone()));
            }
        }
        self.source1.select(&c1, &v1);
    }

    fn describe(&self) -> String {
        let op = match self.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFTJOIN",
            JoinKind::Times => "TIMES",
        };
        format!(
            "({}) {}({}) ({})",
            self.source1.describe(),
            op,
            self.by.join(","),
            self.source2.describe()
        )
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
