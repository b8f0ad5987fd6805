//! `union`: duplicate-free combination of two compatible sources.
//!
//! Two strategies:
//!
//! - **merge**: both sources read in the same key order and merged like
//!   a two-way merge sort; equal rows emit once. Works bidirectionally,
//!   and a direction reversal mid-stream re-primes whichever side was
//!   exhausted by rewinding it — the merge then resumes exactly one row
//!   back, no duplicate, no gap.
//! - **lookup**: read source1 suppressing rows present in source2, then
//!   read source2 in full. Needs no common order; disjoint sources skip
//!   the suppression probes entirely.
//!
//! Output rows carry both sources' parts, the absent side padded with
//! empty records.

use eyre::Result;

use crate::tran::QueryTran;

use super::compatible::{all_cols, common_cols, disjoint, fixed_union};
use super::{
    join_rows, set_approach, Approach, Cost, DbRec, Dir, Fixed, Header, Mode, Query, Row, Thread,
    IMPOSSIBLE, OUT_OF_ORDER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionStrategy {
    Merge,
    Lookup,
}

#[derive(Debug, Clone)]
pub struct UnionApproach {
    strategy: UnionStrategy,
    key_index: Vec<String>,
    reverse: bool,
}

impl Default for UnionApproach {
    fn default() -> Self {
        UnionApproach {
            strategy: UnionStrategy::Lookup,
            key_index: Vec::new(),
            reverse: false,
        }
    }
}

pub struct Union {
    source1: Box<dyn Query>,
    source2: Box<dyn Query>,
    all_cols: Vec<String>,
    disjoint: Option<String>,
    strategy: UnionStrategy,
    key_index: Vec<String>,
    merge_cols: Vec<String>,
    // execution state
    rewound: bool,
    src1: bool,
    src2: bool,
    row1: Option<Row>,
    row2: Option<Row>,
    prev_dir: Dir,
    hdr1: Option<Header>,
    hdr2: Option<Header>,
    empty1: usize,
    empty2: usize,
    common: Vec<String>,
}

impl Union {
    pub fn new(source1: Box<dyn Query>, source2: Box<dyn Query>) -> Union {
        let all = all_cols(source1.as_ref(), source2.as_ref());
        let disjoint = disjoint(source1.as_ref(), source2.as_ref());
        let common = common_cols(source1.as_ref(), source2.as_ref());
        Union {
            source1,
            source2,
            all_cols: all,
            disjoint,
            common,
            strategy: UnionStrategy::Lookup,
            key_index: Vec::new(),
            merge_cols: Vec::new(),
            rewound: true,
            src1: false,
            src2: false,
            row1: None,
            row2: None,
            prev_dir: Dir::Next,
            hdr1: None,
            hdr2: None,
            empty1: 0,
            empty2: 0,
        }
    }

    fn nrows_calc(&self, n1: i64, n2: i64) -> i64 {
        if self.disjoint.is_some() {
            n1 + n2
        } else {
            let min = n1.max(n2); // the smaller side could be all duplicates
            let max = n1 + n2; // or none
            (min + max) / 2
        }
    }

    fn pad1(&self, row: &Row) -> Row {
        join_rows(row, &Row(vec![DbRec::missing(); self.empty2]))
    }

    fn pad2(&self, row: &Row) -> Row {
        let empty = Row(vec![DbRec::missing(); self.empty1]);
        join_rows(&empty, row)
    }

    fn compare(&self, row1: &Row, row2: &Row) -> std::cmp::Ordering {
        let (hdr1, hdr2) = (self.hdr1.as_ref().unwrap(), self.hdr2.as_ref().unwrap());
        for col in &self.merge_cols {
            let x1 = row1.get_raw(hdr1, col);
            let x2 = row2.get_raw(hdr2, col);
            let c = x1.cmp(&x2);
            if c != std::cmp::Ordering::Equal {
                return c;
            }
        }
        std::cmp::Ordering::Equal
    }

    fn get_lookup(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        if self.rewound {
            self.src1 = dir == Dir::Next;
        }
        loop {
            th.check_interrupt()?;
            if self.src1 {
                while let Some(row) = self.source1.get(th, dir)? {
                    if self.disjoint.is_some() || !self.source2_has(th, &row)? {
                        return Ok(Some(self.pad1(&row)));
                    }
                }
                if dir == Dir::Prev {
                    return Ok(None);
                }
                self.src1 = false;
                self.source2.rewind();
            } else {
                if let Some(row) = self.source2.get(th, dir)? {
                    return Ok(Some(self.pad2(&row)));
                }
                if dir == Dir::Next {
                    return Ok(None);
                }
                self.src1 = true;
            }
        }
    }

    fn source2_has(&mut self, th: &Thread, row: &Row) -> Result<bool> {
        let hdr1 = self.hdr1.as_ref().unwrap();
        let vals: Vec<Vec<u8>> = self.common.iter().map(|c| row.get_raw(hdr1, c)).collect();
        let cols = self.common.clone();
        Ok(self.source2.lookup(th, &cols, &vals)?.is_some())
    }

    fn get_merge(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        // each side's row holds the last row fetched from it, with the
        // source cursor sitting on it; refill the side that was emitted,
        // and on a direction change refetch both so the cursors step
        // across the emitted row exactly once
        let dir_changed = dir != self.prev_dir;
        let fetch1 = self.rewound || self.src1 || dir_changed;
        let fetch2 = self.rewound || self.src2 || dir_changed;
        if fetch1 {
            if dir_changed && self.row1.is_none() {
                self.source1.rewind(); // come back from sticky eof
            }
            self.row1 = self.source1.get(th, dir)?;
        }
        if fetch2 {
            if dir_changed && self.row2.is_none() {
                self.source2.rewind();
            }
            self.row2 = self.source2.get(th, dir)?;
        }

        self.prev_dir = dir;
        self.src1 = false;
        self.src2 = false;
        match (self.row1.clone(), self.row2.clone()) {
            (None, None) => {
                self.src1 = true;
                self.src2 = true;
                Ok(None)
            }
            (Some(r1), None) => {
                self.src1 = true;
                Ok(Some(self.pad1(&r1)))
            }
            (None, Some(r2)) => {
                self.src2 = true;
                Ok(Some(self.pad2(&r2)))
            }
            (Some(r1), Some(r2)) => {
                let mut cmp = self.compare(&r1, &r2);
                if cmp == std::cmp::Ordering::Equal {
                    // identical rows: emit once, consume both
                    self.src1 = true;
                    self.src2 = true;
                    return Ok(Some(self.pad1(&r1)));
                }
                if dir == Dir::Prev {
                    cmp = cmp.reverse();
                }
                if cmp == std::cmp::Ordering::Less {
                    self.src1 = true;
                    Ok(Some(self.pad1(&r1)))
                } else {
                    self.src2 = true;
                    Ok(Some(self.pad2(&r2)))
                }
            }
        }
    }
}

impl Query for Union {
    fn columns(&self) -> Vec<String> {
        self.all_cols.clone()
    }

    fn header(&self) -> Header {
        self.source1.header().concat(&self.source2.header())
    }

    fn keys(&self) -> Vec<Vec<String>> {
        // without disjointness nothing smaller than the whole row is
        // guaranteed unique
        vec![self.all_cols.clone()]
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        let mut ixs = self.source1.indexes();
        for ix in self.source2.indexes() {
            if !ixs.contains(&ix) {
                ixs.push(ix);
            }
        }
        ixs
    }

    fn fixed(&self) -> Vec<Fixed> {
        fixed_union(self.source1.as_ref(), self.source2.as_ref())
    }

    fn nrows(&self) -> (i64, i64) {
        let (n1, p1) = self.source1.nrows();
        let (n2, p2) = self.source2.nrows();
        (self.nrows_calc(n1, n2), self.nrows_calc(p1, p2))
    }

    fn row_size(&self) -> i64 {
        (self.source1.row_size() + self.source2.row_size()) / 2
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source1 = self.source1.transform();
        self.source2 = self.source2.transform();
        if self.source1.as_any().is::<super::nothing::Nothing>() {
            return self.source2;
        }
        if self.source2.as_any().is::<super::nothing::Nothing>() {
            return self.source1;
        }
        self.disjoint = disjoint(self.source1.as_ref(), self.source2.as_ref());
        self.common = common_cols(self.source1.as_ref(), self.source2.as_ref());
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        if let Some(index) = index {
            // a required order forces merge, which needs the index to be
            // a key of both sides (to eliminate duplicates)
            if self.disjoint.is_none()
                && (!handles_index(&self.source1.keys(), index)
                    || !handles_index(&self.source2.keys(), index))
            {
                return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
            }
            let (fix1, var1) =
                super::optimize_cost(self.source1.as_mut(), mode, Some(index), frac);
            let (fix2, var2) =
                super::optimize_cost(self.source2.as_mut(), mode, Some(index), frac);
            if fix1 + var1 >= IMPOSSIBLE || fix2 + var2 >= IMPOSSIBLE {
                return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
            }
            return (
                fix1 + fix2,
                var1 + var2,
                Approach::Union(UnionApproach {
                    strategy: UnionStrategy::Merge,
                    key_index: index.to_vec(),
                    reverse: false,
                }),
            );
        }
        if self.disjoint.is_some() {
            let (fix1, var1) = super::optimize_cost(self.source1.as_mut(), mode, None, frac);
            let (fix2, var2) = super::optimize_cost(self.source2.as_mut(), mode, None, frac);
            return (
                fix1 + fix2,
                var1 + var2,
                Approach::Union(UnionApproach::default()),
            );
        }
        // no required order: merge on a shared key vs lookup each way
        let merge = self.opt_merge(mode, frac);
        let lookup = self.opt_lookup(mode, frac, false);
        let lookup_rev = self.opt_lookup(mode, frac, true);
        let best = super::optimize::min3(
            merge.0, merge.1, merge.2, lookup.0, lookup.1, lookup.2, lookup_rev.0, lookup_rev.1,
            lookup_rev.2,
        );
        if best.0 + best.1 >= IMPOSSIBLE {
            return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
        }
        best
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        _index: Option<&[String]>,
        frac: f64,
        approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let Approach::Union(app) = approach else {
            panic!("Union: unexpected approach");
        };
        self.strategy = app.strategy;
        self.key_index = app.key_index.clone();
        if app.reverse {
            std::mem::swap(&mut self.source1, &mut self.source2);
        }
        let index = if self.strategy == UnionStrategy::Merge {
            Some(self.key_index.clone())
        } else {
            None
        };
        let s1 = std::mem::replace(
            &mut self.source1,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source1 = set_approach(s1, mode, index.as_deref(), frac, tran);
        let frac2 = if self.strategy == UnionStrategy::Lookup {
            0.0
        } else {
            frac
        };
        let s2 = std::mem::replace(
            &mut self.source2,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source2 = set_approach(s2, mode, index.as_deref(), frac2, tran);

        self.hdr1 = Some(self.source1.header());
        self.hdr2 = Some(self.source2.header());
        self.empty1 = self.hdr1.as_ref().unwrap().fields.len();
        self.empty2 = self.hdr2.as_ref().unwrap().fields.len();
        self.common = common_cols(self.source1.as_ref(), self.source2.as_ref());
        // compare the merge key first, then the rest for a total order
        self.merge_cols = self.key_index.clone();
        for c in &self.all_cols {
            if !self.merge_cols.contains(c) {
                self.merge_cols.push(c.clone());
            }
        }
        self.rewound = true;
    }

    fn rewind(&mut self) {
        self.source1.rewind();
        self.source2.rewind();
        self.rewound = true;
        self.row1 = None;
        self.row2 = None;
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        let result = match self.strategy {
            UnionStrategy::Lookup => self.get_lookup(th, dir),
            UnionStrategy::Merge => self.get_merge(th, dir),
        };
        self.rewound = false;
        result
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.source1.select(cols, vals);
        self.source2.select(cols, vals);
        self.rewound = true;
        self.row1 = None;
        self.row2 = None;
    }

    fn describe(&self) -> String {
        let strategy = match self.strategy {
            UnionStrategy::Merge => format!("MERGE({})", self.key_index.join(",")),
            UnionStrategy::Lookup if self.disjoint.is_some() => "DISJOINT".to_string(),
            UnionStrategy::Lookup => "LOOKUP".to_string(),
        };
        format!(
            "({}) UNION-{} ({})",
            self.source1.describe(),
            strategy,
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

impl Union {
    fn opt_merge(&mut self, mode: Mode, frac: f64) -> (Cost, Cost, Approach) {
        // need a key common to both sides to eliminate duplicates
        let keys1 = self.source1.keys();
        let keys2 = self.source2.keys();
        let mut best: Option<(Cost, Cost, Vec<String>)> = None;
        for key in keys1.iter().filter(|k| keys2.contains(k)) {
            if key.is_empty() {
                continue;
            }
            let (fix1, var1) = super::optimize_cost(self.source1.as_mut(), mode, Some(key), frac);
            let (fix2, var2) = super::optimize_cost(self.source2.as_mut(), mode, Some(key), frac);
            let total = fix1 + var1 + fix2 + var2;
            if total < IMPOSSIBLE
                && best.as_ref().map_or(true, |(bf, bv, _)| total < bf + bv)
            {
                best = Some((fix1 + fix2, var1 + var2, key.clone()));
            }
        }
        match best {
            Some((fix, var, key)) => (
                fix,
                var,
                Approach::Union(UnionApproach {
                    strategy: UnionStrategy::Merge,
                    key_index: key,
                    reverse: false,
                }),
            ),
            None => (IMPOSSIBLE, IMPOSSIBLE, Approach::None),
        }
    }

    fn opt_lookup(&mut self, mode: Mode, frac: f64, reverse: bool) -> (Cost, Cost, Approach) {
        let (src1, src2): (&mut Box<dyn Query>, &mut Box<dyn Query>) = if reverse {
            (&mut self.source2, &mut self.source1)
        } else {
            (&mut self.source1, &mut self.source2)
        };
        let (fix1, var1) = super::optimize_cost(src1.as_mut(), mode, None, frac);
        let (n1, _) = src1.nrows();
        let (fix2, var2) = super::optimize_cost(src2.as_mut(), mode, None, 0.0);
        let probes = ((n1.max(1) as f64) * frac) as Cost * OUT_OF_ORDER;
        let mut fix = fix1 + fix2 + probes;
        if reverse {
            fix += OUT_OF_ORDER;
        }
        (
            fix,
            var1 + var2,
            Approach::Union(UnionApproach {
                strategy: UnionStrategy::Lookup,
                key_index: Vec::new(),
                reverse,
            }),
        )
    }
}

fn handles_index(keys: &[Vec<String>], index: &[String]) -> bool {
    if keys.len() == 1 && keys[0].is_empty() {
        return true; // singleton
    }
    keys.iter()
        .any(|key| key.iter().all(|k| index.contains(k)))
}
