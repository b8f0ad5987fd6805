//! `extend col = expr, …`: appends computed columns. Each output row
//! carries an extra derived record part holding the evaluated values;
//! expressions may reference columns added earlier in the same extend.
//! Adjacent extends combine during transform.

use eyre::Result;

use crate::encoding::pack;
use crate::record::RecordBuilder;
use crate::tran::QueryTran;

use super::expr::Expr;
use super::{
    join_rows, set_approach, Approach, Cost, DbRec, Dir, Fixed, Header, Mode, Query, Row, Thread,
    IMPOSSIBLE,
};

pub struct Extend {
    source: Box<dyn Query>,
    pub cols: Vec<String>,
    pub exprs: Vec<Expr>,
    /// restrictions on extended columns, enforced locally
    filters: Vec<(String, Vec<u8>)>,
}

impl Extend {
    pub fn new(source: Box<dyn Query>, cols: Vec<String>, exprs: Vec<Expr>) -> Extend {
        debug_assert_eq!(cols.len(), exprs.len());
        Extend {
            source,
            cols,
            exprs,
            filters: Vec::new(),
        }
    }

    pub fn source(self) -> Box<dyn Query> {
        self.source
    }

    fn extended_header(&self) -> Header {
        let mut hdr = self.source.header();
        hdr.fields.push(self.cols.clone());
        for c in &self.cols {
            if !hdr.columns.contains(c) {
                hdr.columns.push(c.clone());
            }
        }
        hdr
    }
}

impl Query for Extend {
    fn columns(&self) -> Vec<String> {
        let mut cols = self.source.columns();
        for c in &self.cols {
            if !cols.contains(c) {
                cols.push(c.clone());
            }
        }
        cols
    }

    fn header(&self) -> Header {
        self.extended_header()
    }

    fn keys(&self) -> Vec<Vec<String>> {
        self.source.keys()
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.source.indexes()
    }

    fn fixed(&self) -> Vec<Fixed> {
        let mut fixed = self.source.fixed();
        for (col, e) in self.cols.iter().zip(&self.exprs) {
            if let Expr::Constant(v) = e {
                fixed.push(Fixed {
                    col: col.clone(),
                    vals: vec![pack::packed(v)],
                });
            }
        }
        fixed
    }

    fn nrows(&self) -> (i64, i64) {
        self.source.nrows()
    }

    fn row_size(&self) -> i64 {
        self.source.row_size() + self.cols.len() as i64 * 8
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source = self.source.transform();
        if self.source.as_any().is::<super::nothing::Nothing>() {
            return Box::new(super::nothing::Nothing::new(self.columns()));
        }
        // combine adjacent extends into one
        if self.source.as_any().is::<Extend>() {
            let inner = self
                .source
                .into_any()
                .downcast::<Extend>()
                .expect("checked");
            let mut cols = inner.cols;
            let mut exprs = inner.exprs;
            cols.extend(self.cols);
            exprs.extend(self.exprs);
            return Box::new(Extend::new(inner.source, cols, exprs));
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        if let Some(index) = index {
            // cannot deliver an order over computed columns
            if index.iter().any(|c| self.cols.contains(c)) {
                return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
            }
        }
        let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, index, frac);
        let (n, _) = self.source.nrows();
        (fix, var + n, Approach::None)
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        index: Option<&[String]>,
        frac: f64,
        _approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, index, frac, tran);
    }

    fn rewind(&mut self) {
        self.source.rewind();
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        let hdr = self.extended_header();
        'rows: loop {
            let Some(row) = self.source.get(th, dir)? else {
                return Ok(None);
            };
            // evaluate in order, rebuilding the derived part as we go so
            // later exprs can reference earlier extended columns
            let mut out = join_rows(
                &row,
                &Row(vec![DbRec::derived(crate::record::Record::empty())]),
            );
            let part = out.0.len() - 1;
            let mut vals = Vec::with_capacity(self.exprs.len());
            for e in &self.exprs {
                let v = e.eval(&hdr, &out, th)?;
                vals.push(v);
                let mut rb = RecordBuilder::new();
                for v in &vals {
                    rb.add(v);
                }
                out.0[part] = DbRec::derived(rb.build());
            }
            for (col, val) in &self.filters {
                if out.get_raw(&hdr, col) != *val {
                    continue 'rows;
                }
            }
            return Ok(Some(out));
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        if cols.is_empty() {
            self.filters.clear();
            self.source.select(&[], &[]);
            return;
        }
        let mut src_cols = Vec::new();
        let mut src_vals = Vec::new();
        self.filters.clear();
        for (c, v) in cols.iter().zip(vals) {
            if self.cols.contains(c) {
                self.filters.push((c.clone(), v.clone()));
            } else {
                src_cols.push(c.clone());
                src_vals.push(v.clone());
            }
        }
        self.source.select(&src_cols, &src_vals);
    }

    fn describe(&self) -> String {
        format!("{} EXTEND {}", self.source.describe(), self.cols.join(", "))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
