//! `where expr`: row restriction. Every row is checked against the
//! expression, but the planner also mines the conjunction for
//! `col = constant` terms and pushes them into the source as a select,
//! which a table turns into an index key range — the difference between
//! scanning and seeking.
//!
//! Transform pushes `where` below `project`, `rename` (translating
//! column names), and `extend` (when the expression doesn't touch
//! computed columns), and merges adjacent `where`s into one
//! conjunction.

use eyre::Result;

use crate::tran::QueryTran;

use super::expr::{truthy, Expr};
use super::extend::Extend;
use super::project::Project;
use super::rename::Rename;
use super::{
    set_approach, Approach, BestIndex, Cost, Dir, Fixed, Header, Mode, Query, Row, Thread,
};

#[derive(Debug, Clone, Default)]
pub struct WhereApproach {
    index: Option<Vec<String>>,
}

pub struct Where {
    source: Box<dyn Query>,
    pub expr: Expr,
    /// equality restrictions mined from the conjunction
    eq: Vec<(String, Vec<u8>)>,
    /// restriction installed from above, merged with `eq`
    sel: Option<(Vec<String>, Vec<Vec<u8>>)>,
    conflict: bool,
}

impl Where {
    pub fn new(source: Box<dyn Query>, expr: Expr) -> Where {
        let eq = expr
            .conjuncts()
            .iter()
            .filter_map(|e| e.col_eq_const())
            .collect();
        Where {
            source,
            expr,
            eq,
            sel: None,
            conflict: false,
        }
    }

    fn push_select(&mut self) {
        let mut cols: Vec<String> = Vec::new();
        let mut vals: Vec<Vec<u8>> = Vec::new();
        self.conflict = false;
        for (c, v) in &self.eq {
            cols.push(c.clone());
            vals.push(v.clone());
        }
        if let Some((scols, svals)) = &self.sel {
            for (c, v) in scols.iter().zip(svals) {
                match cols.iter().position(|x| x == c) {
                    Some(i) if &vals[i] != v => {
                        self.conflict = true;
                        return;
                    }
                    Some(_) => {}
                    None => {
                        cols.push(c.clone());
                        vals.push(v.clone());
                    }
                }
            }
        }
        self.source.select(&cols, &vals);
    }

    /// Selectivity estimate: each equality on a leading index column
    /// narrows by about an order of magnitude.
    fn estimate(&self, index: &[String]) -> f64 {
        let mut matched = 0;
        for col in index {
            if self.eq.iter().any(|(c, _)| c == col) {
                matched += 1;
            } else {
                break;
            }
        }
        0.1f64.powi(matched)
    }
}

impl Query for Where {
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
        self.source.indexes()
    }

    fn fixed(&self) -> Vec<Fixed> {
        let mut fixed = self.source.fixed();
        for (col, val) in &self.eq {
            if !fixed.iter().any(|f| &f.col == col) {
                fixed.push(Fixed {
                    col: col.clone(),
                    vals: vec![val.clone()],
                });
            }
        }
        fixed
    }

    fn nrows(&self) -> (i64, i64) {
        let (n, pop) = self.source.nrows();
        let est = if self.eq.is_empty() { n / 2 } else { n / 10 };
        (est.max(0), pop)
    }

    fn row_size(&self) -> i64 {
        self.source.row_size()
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source = self.source.transform();
        if self.source.as_any().is::<super::nothing::Nothing>() {
            return Box::new(super::nothing::Nothing::new(self.columns()));
        }
        // where of where: one conjunction
        if self.source.as_any().is::<Where>() {
            let inner = self.source.into_any().downcast::<Where>().expect("checked");
            let mut conj: Vec<Expr> = inner.expr.conjuncts().into_iter().cloned().collect();
            conj.extend(self.expr.conjuncts().into_iter().cloned());
            return Box::new(Where::new(inner.source, Expr::And(conj))).transform();
        }
        // where below project
        if self.source.as_any().is::<Project>() {
            let p = self.source.into_any().downcast::<Project>().expect("checked");
            let cols = p.cols.clone();
            let inner = Box::new(Where::new(p.source(), self.expr)).transform();
            return Box::new(Project::new(inner, cols));
        }
        // where below rename: translate the expression's columns
        if self.source.as_any().is::<Rename>() {
            let r = self.source.into_any().downcast::<Rename>().expect("checked");
            let expr = unrename_expr(&self.expr, &r);
            let (src, from, to) = r.source_parts();
            let inner = Box::new(Where::new(src, expr)).transform();
            return Box::new(Rename::new(inner, from, to));
        }
        // where below extend when the expression skips computed columns
        if let Some(ext) = self.source.as_any().downcast_ref::<Extend>() {
            let touches = self
                .expr
                .columns()
                .iter()
                .any(|c| ext.cols.contains(c));
            if !touches {
                let e = self.source.into_any().downcast::<Extend>().expect("checked");
                let (cols, exprs) = (e.cols.clone(), e.exprs.clone());
                let inner = Box::new(Where::new(e.source(), self.expr)).transform();
                return Box::new(Extend::new(inner, cols, exprs));
            }
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        match index {
            Some(index) => {
                let est = self.estimate(index);
                let (fix, var) =
                    super::optimize_cost(self.source.as_mut(), mode, Some(index), frac * est);
                (fix, var, Approach::Where(WhereApproach {
                    index: Some(index.to_vec()),
                }))
            }
            None => {
                // free to pick the index that best matches the equalities
                let mut best = BestIndex::new();
                for ix in self.source.indexes() {
                    let est = self.estimate(&ix);
                    let (fix, var) =
                        super::optimize_cost(self.source.as_mut(), mode, Some(&ix), frac * est);
                    best.update(&ix, fix, var);
                }
                let (fix0, var0) = super::optimize_cost(self.source.as_mut(), mode, None, frac);
                if best.index.is_none() || fix0 + var0 <= best.fixcost + best.varcost {
                    (fix0, var0, Approach::Where(WhereApproach { index: None }))
                } else {
                    (
                        best.fixcost,
                        best.varcost,
                        Approach::Where(WhereApproach { index: best.index }),
                    )
                }
            }
        }
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        _index: Option<&[String]>,
        frac: f64,
        approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let Approach::Where(app) = approach else {
            panic!("Where: unexpected approach");
        };
        let est = app.index.as_deref().map_or(1.0, |ix| self.estimate(ix));
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, app.index.as_deref(), frac * est, tran);
        self.push_select();
    }

    fn rewind(&mut self) {
        self.source.rewind();
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        if self.conflict {
            return Ok(None);
        }
        let hdr = self.source.header();
        loop {
            th.check_interrupt()?;
            let Some(row) = self.source.get(th, dir)? else {
                return Ok(None);
            };
            if truthy(&self.expr.eval(&hdr, &row, th)?) {
                return Ok(Some(row));
            }
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.sel = if cols.is_empty() {
            None
        } else {
            Some((cols.to_vec(), vals.to_vec()))
        };
        self.push_select();
    }

    fn single_table(&self) -> bool {
        self.source.single_table()
    }

    fn describe(&self) -> String {
        format!("{} WHERE", self.source.describe())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

fn unrename_expr(e: &Expr, r: &Rename) -> Expr {
    match e {
        Expr::Constant(v) => Expr::Constant(v.clone()),
        Expr::Field(name) => Expr::Field(r.unrename_col(name)),
        Expr::Unary(op, e) => Expr::Unary(*op, Box::new(unrename_expr(e, r))),
        Expr::Binary(op, l, r2) => Expr::Binary(
            *op,
            Box::new(unrename_expr(l, r)),
            Box::new(unrename_expr(r2, r)),
        ),
        Expr::And(es) => Expr::And(es.iter().map(|e| unrename_expr(e, r)).collect()),
        Expr::Or(es) => Expr::Or(es.iter().map(|e| unrename_expr(e, r)).collect()),
    }
}
