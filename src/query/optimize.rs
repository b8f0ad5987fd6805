//! Plan binding: the global `Optimize`/`SetApproach` pair. An operator
//! asked for an order it cannot natively produce competes against the
//! alternative of reading it unordered and sorting through a
//! [`TempIndex`](super::tempindex::TempIndex); whichever is cheaper is
//! what `set_approach` actually builds.

use eyre::Result;

use crate::errors::query_error;
use crate::tran::QueryTran;

use super::sort::Sort;
use super::tempindex::TempIndex;
use super::{Approach, Cost, Query, IMPOSSIBLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Update,
}

/// Transform, cost, and bind a query for execution. The returned tree
/// is ready for `get`.
pub fn setup(
    q: Box<dyn Query>,
    mode: Mode,
    tran: &dyn QueryTran,
) -> Result<Box<dyn Query>> {
    let mut q = q.transform();
    let (fix, var, approach) = q.optimize(mode, None, 1.0);
    if fix + var >= IMPOSSIBLE {
        return Err(query_error("query cannot be executed"));
    }
    q.set_approach(mode, None, 1.0, approach, tran);
    Ok(q)
}

/// Convenience for tests and tools: parse, transform, bind.
pub fn setup_query(
    text: &str,
    mode: Mode,
    tran: &dyn QueryTran,
) -> Result<Box<dyn Query>> {
    let q = super::parse::parse_query(text, tran)?;
    setup(q, mode, tran)
}

/// Cost of reading `q` in `index` order: the cheaper of delivering it
/// natively and reading unordered into a temp index.
pub fn optimize_cost(
    q: &mut dyn Query,
    mode: Mode,
    index: Option<&[String]>,
    frac: f64,
) -> (Cost, Cost) {
    let (fix1, var1, _) = q.optimize(mode, index, frac);
    let Some(index) = index else {
        return (fix1, var1);
    };
    let (tfix, tvar) = tempindex_cost(q, mode, index, frac);
    if fix1 + var1 <= tfix + tvar {
        (fix1, var1)
    } else {
        (tfix, tvar)
    }
}

fn tempindex_cost(q: &mut dyn Query, mode: Mode, index: &[String], frac: f64) -> (Cost, Cost) {
    if !index.iter().all(|c| q.columns().contains(c)) {
        return (IMPOSSIBLE, IMPOSSIBLE);
    }
    let (sfix, svar, _) = q.optimize(mode, None, 1.0);
    if sfix + svar >= IMPOSSIBLE {
        return (IMPOSSIBLE, IMPOSSIBLE);
    }
    let (nr, _) = q.nrows();
    let nr = nr.max(1);
    // build: read everything + sort; read: frac of the sorted list
    let build = sfix + svar + nr * 2;
    let read = ((nr as f64) * frac) as Cost;
    (build, read)
}

/// Binds `q` to deliver `index` order, inserting a temp index when the
/// cost model picked one. Consumes and returns the (possibly wrapped)
/// operator.
pub fn set_approach(
    mut q: Box<dyn Query>,
    mode: Mode,
    index: Option<&[String]>,
    frac: f64,
    tran: &dyn QueryTran,
) -> Box<dyn Query> {
    let (fix1, var1, approach) = q.optimize(mode, index, frac);
    if let Some(index) = index {
        let (tfix, tvar) = tempindex_cost(q.as_mut(), mode, index, frac);
        if tfix + tvar < fix1 + var1 {
            let (_, _, src_app) = q.optimize(mode, None, 1.0);
            q.set_approach(mode, None, 1.0, src_app, tran);
            let mut ti = Box::new(TempIndex::new(q, index.to_vec()));
            ti.bind(tran);
            return ti;
        }
    }
    q.set_approach(mode, index, frac, approach, tran);
    q
}

/// Chooses the minimum-cost strategy of three.
#[allow(clippy::too_many_arguments)]
pub fn min3(
    fix1: Cost,
    var1: Cost,
    app1: Approach,
    fix2: Cost,
    var2: Cost,
    app2: Approach,
    fix3: Cost,
    var3: Cost,
    app3: Approach,
) -> (Cost, Cost, Approach) {
    let mut best = (fix1, var1, app1);
    if fix2 + var2 < best.0 + best.1 {
        best = (fix2, var2, app2);
    }
    if fix3 + var3 < best.0 + best.1 {
        best = (fix3, var3, app3);
    }
    best
}

/// Tracks the cheapest index alternative while exploring.
pub struct BestIndex {
    pub index: Option<Vec<String>>,
    pub fixcost: Cost,
    pub varcost: Cost,
}

impl BestIndex {
    pub fn new() -> BestIndex {
        BestIndex {
            index: None,
            fixcost: IMPOSSIBLE,
            varcost: IMPOSSIBLE,
        }
    }

    pub fn update(&mut self, index: &[String], fixcost: Cost, varcost: Cost) {
        if fixcost + varcost < self.fixcost + self.varcost {
            self.index = Some(index.to_vec());
            self.fixcost = fixcost;
            self.varcost = varcost;
        }
    }
}

impl Default for BestIndex {
    fn default() -> Self {
        BestIndex::new()
    }
}

/// Top-level wrapper for `SORT [REVERSE] cols`.
pub fn with_sort(q: Box<dyn Query>, cols: Vec<String>, reverse: bool) -> Box<dyn Query> {
    Box::new(Sort::new(q, cols, reverse))
}
