//! Shared machinery for the set operators (`union`, `intersect`,
//! `minus`): the combined column set, disjointness detection from
//! [`Fixed`] propagation, and the probe-side lookup that `intersect`
//! and `minus` are built from (read source1, test membership in
//! source2 by its key).

use eyre::Result;

use crate::tran::QueryTran;

use super::{
    set_approach, Approach, Cost, Dir, Fixed, Header, Mode, Query, Row, Thread, OUT_OF_ORDER,
};

/// The union of both sources' columns, source1's order first.
pub fn all_cols(s1: &dyn Query, s2: &dyn Query) -> Vec<String> {
    let mut cols = s1.columns();
    for c in s2.columns() {
        if !cols.contains(&c) {
            cols.push(c);
        }
    }
    cols
}

pub fn common_cols(s1: &dyn Query, s2: &dyn Query) -> Vec<String> {
    let cols2 = s2.columns();
    s1.columns().into_iter().filter(|c| cols2.contains(c)).collect()
}

/// A column fixed in both sources with no shared value proves the
/// sources disjoint (no row can appear in both).
pub fn disjoint(s1: &dyn Query, s2: &dyn Query) -> Option<String> {
    let fixed2 = s2.fixed();
    for f1 in s1.fixed() {
        if let Some(f2) = fixed2.iter().find(|f2| f2.col == f1.col) {
            if !f1.vals.iter().any(|v| f2.vals.contains(v)) {
                return Some(f1.col);
            }
        }
    }
    None
}

pub fn fixed_union(s1: &dyn Query, s2: &dyn Query) -> Vec<Fixed> {
    let fixed2 = s2.fixed();
    let mut out = Vec::new();
    for f1 in s1.fixed() {
        if let Some(f2) = fixed2.iter().find(|f2| f2.col == f1.col) {
            let mut vals = f1.vals.clone();
            for v in &f2.vals {
                if !vals.contains(v) {
                    vals.push(v.clone());
                }
            }
            out.push(Fixed { col: f1.col, vals });
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct CompatApproach;

/// `intersect` and `minus` share everything but the keep-test.
pub struct Compatible {
    pub source1: Box<dyn Query>,
    pub source2: Box<dyn Query>,
    keep_found: bool, // intersect keeps matches, minus keeps misses
    disjoint: Option<String>,
    common: Vec<String>,
    hdr1: Option<Header>,
}

impl Compatible {
    pub fn intersect(source1: Box<dyn Query>, source2: Box<dyn Query>) -> Compatible {
        Compatible::new(source1, source2, true)
    }

    pub fn minus(source1: Box<dyn Query>, source2: Box<dyn Query>) -> Compatible {
        Compatible::new(source1, source2, false)
    }

    fn new(source1: Box<dyn Query>, source2: Box<dyn Query>, keep_found: bool) -> Compatible {
        let disjoint = disjoint(source1.as_ref(), source2.as_ref());
        let common = common_cols(source1.as_ref(), source2.as_ref());
        Compatible {
            source1,
            source2,
            keep_found,
            disjoint,
            common,
            hdr1: None,
        }
    }

    fn source2_has(&mut self, th: &Thread, row: &Row) -> Result<bool> {
        if self.disjoint.is_some() {
            return Ok(false);
        }
        if self.hdr1.is_none() {
            self.hdr1 = Some(self.source1.header());
        }
        let hdr1 = self.hdr1.as_ref().unwrap();
        let vals: Vec<Vec<u8>> = self.common.iter().map(|c| row.get_raw(hdr1, c)).collect();
        let common = self.common.clone();
        Ok(self.source2.lookup(th, &common, &vals)?.is_some())
    }
}

impl Query for Compatible {
    fn columns(&self) -> Vec<String> {
        self.source1.columns()
    }

    fn header(&self) -> Header {
        self.source1.header()
    }

    fn keys(&self) -> Vec<Vec<String>> {
        self.source1.keys()
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.source1.indexes()
    }

    fn fixed(&self) -> Vec<Fixed> {
        self.source1.fixed()
    }

    fn nrows(&self) -> (i64, i64) {
        let (n1, p1) = self.source1.nrows();
        let (n2, _) = self.source2.nrows();
        if self.keep_found {
            (n1.min(n2) / 2, p1)
        } else {
            (n1 - n1.min(n2) / 2, p1)
        }
    }

    fn row_size(&self) -> i64 {
        self.source1.row_size()
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source1 = self.source1.transform();
        self.source2 = self.source2.transform();
        let nothing1 = self.source1.as_any().is::<super::nothing::Nothing>();
        let nothing2 = self.source2.as_any().is::<super::nothing::Nothing>();
        self.disjoint = disjoint(self.source1.as_ref(), self.source2.as_ref());
        if self.keep_found {
            if nothing1 || nothing2 || self.disjoint.is_some() {
                return Box::new(super::nothing::Nothing::new(self.columns()));
            }
        } else {
            if nothing1 {
                return Box::new(super::nothing::Nothing::new(self.columns()));
            }
            if nothing2 || self.disjoint.is_some() {
                return self.source1;
            }
        }
        self.common = common_cols(self.source1.as_ref(), self.source2.as_ref());
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        let (fix1, var1) = super::optimize_cost(self.source1.as_mut(), mode, index, frac);
        let (n1, _) = self.source1.nrows();
        // each source1 row costs one keyed probe into source2
        let (fix2, var2) = super::optimize_cost(self.source2.as_mut(), mode, None, 0.0);
        let probes = n1.max(1) * OUT_OF_ORDER;
        (
            fix1 + fix2,
            var1 + var2 + probes,
            Approach::Compatible(CompatApproach),
        )
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        index: Option<&[String]>,
        frac: f64,
        _approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let s1 = std::mem::replace(
            &mut self.source1,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source1 = set_approach(s1, mode, index, frac, tran);
        let s2 = std::mem::replace(
            &mut self.source2,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source2 = set_approach(s2, mode, None, 0.0, tran);
        self.hdr1 = None;
    }

    fn rewind(&mut self) {
        self.source1.rewind();
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        loop {
            th.check_interrupt()?;
            let Some(row) = self.source1.get(th, dir)? else {
                return Ok(None);
            };
            if self.source2_has(th, &row)? == self.keep_found {
                return Ok(Some(row));
            }
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.source1.select(cols, vals);
    }

    fn single_table(&self) -> bool {
        self.source1.single_table()
    }

    fn describe(&self) -> String {
        let op = if self.keep_found { "INTERSECT" } else { "MINUS" };
        format!(
            "({}) {} ({})",
            self.source1.describe(),
            op,
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
