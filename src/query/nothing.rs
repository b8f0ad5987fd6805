//! The empty relation: what `where false` and unions of nothing fold
//! into. Carries its column list so headers stay well-formed.

use eyre::Result;

use crate::tran::QueryTran;

use super::{Approach, Cost, Dir, Header, Mode, Query, Row, Thread};

pub struct Nothing {
    columns: Vec<String>,
}

impl Nothing {
    pub fn new(columns: Vec<String>) -> Nothing {
        Nothing { columns }
    }
}

impl Query for Nothing {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn header(&self) -> Header {
        Header::single(self.columns.clone())
    }

    fn keys(&self) -> Vec<Vec<String>> {
        vec![Vec::new()] // singleton (zero rows): the empty key
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        vec![Vec::new()]
    }

    fn nrows(&self) -> (i64, i64) {
        (0, 0)
    }

    fn row_size(&self) -> i64 {
        0
    }

    fn transform(self: Box<Self>) -> Box<dyn Query> {
        self
    }

    fn optimize(&mut self, _mode: Mode, _index: Option<&[String]>, _frac: f64)
        -> (Cost, Cost, Approach) {
        (0, 0, Approach::None)
    }

    fn set_approach(
        &mut self,
        _mode: Mode,
        _index: Option<&[String]>,
        _frac: f64,
        _approach: Approach,
        _tran: &dyn QueryTran,
    ) {
    }

    fn rewind(&mut self) {}

    fn get(&mut self, _th: &Thread, _dir: Dir) -> Result<Option<Row>> {
        Ok(None)
    }

    fn select(&mut self, _cols: &[String], _vals: &[Vec<u8>]) {}

    fn describe(&self) -> String {
        "NOTHING".to_string()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
