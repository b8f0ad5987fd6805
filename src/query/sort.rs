//! Trailing `sort [reverse] cols`: asks the tree below for the order,
//! letting the global planner choose between a native index path and a
//! temp index. `reverse` just flips the direction of every `get`.

use eyre::Result;

use crate::tran::QueryTran;

use super::{set_approach, Approach, Cost, Dir, Header, Mode, Query, Row, Thread};

#[derive(Debug, Clone, Default)]
pub struct SortApproach;

pub struct Sort {
    source: Box<dyn Query>,
    pub cols: Vec<String>,
    pub reverse: bool,
}

impl Sort {
    pub fn new(source: Box<dyn Query>, cols: Vec<String>, reverse: bool) -> Sort {
        Sort {
            source,
            cols,
            reverse,
        }
    }
}

impl Query for Sort {
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
        vec![self.cols.clone()]
    }

    fn fixed(&self) -> Vec<super::Fixed> {
        self.source.fixed()
    }

    fn nrows(&self) -> (i64, i64) {
        self.source.nrows()
    }

    fn row_size(&self) -> i64 {
        self.source.row_size()
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source = self.source.transform();
        if self.source.as_any().is::<super::nothing::Nothing>() {
            return self.source;
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        if let Some(index) = index {
            // sort delivers exactly its own column order
            if !self.cols.starts_with(index) {
                return (super::IMPOSSIBLE, super::IMPOSSIBLE, Approach::None);
            }
        }
        let cols = self.cols.clone();
        let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, Some(&cols), frac);
        (fix, var, Approach::Sort(SortApproach))
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        _index: Option<&[String]>,
        frac: f64,
        _approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let cols = self.cols.clone();
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, Some(&cols), frac, tran);
    }

    fn rewind(&mut self) {
        self.source.rewind();
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        let dir = if self.reverse { dir.reverse() } else { dir };
        self.source.get(th, dir)
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.source.select(cols, vals);
    }

    fn single_table(&self) -> bool {
        self.source.single_table()
    }

    fn describe(&self) -> String {
        format!(
            "{} SORT{} {}",
            self.source.describe(),
            if self.reverse { " REVERSE" } else { "" },
            self.cols.join(",")
        )
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
