//! `rename from to new`: relabels columns. Rows pass through unchanged;
//! only the header and the planning metadata are mapped, and selects
//! from above are translated back to the source names.

use eyre::Result;

use crate::tran::QueryTran;

use super::{set_approach, Approach, Cost, Dir, Header, Mode, Query, Row, Thread};

pub struct Rename {
    source: Box<dyn Query>,
    pub from: Vec<String>,
    pub to: Vec<String>,
}

impl Rename {
    pub fn new(source: Box<dyn Query>, from: Vec<String>, to: Vec<String>) -> Rename {
        debug_assert_eq!(from.len(), to.len());
        Rename { source, from, to }
    }

    fn rename_col(&self, col: &str) -> String {
        match self.from.iter().position(|f| f == col) {
            Some(i) => self.to[i].clone(),
            None => col.to_string(),
        }
    }

    /// Maps a renamed column back to its source name.
    pub fn unrename_col(&self, col: &str) -> String {
        match self.to.iter().position(|t| t == col) {
            Some(i) => self.from[i].clone(),
            None => col.to_string(),
        }
    }

    fn rename_list(&self, cols: &[String]) -> Vec<String> {
        cols.iter().map(|c| self.rename_col(c)).collect()
    }

    pub fn unrename_list(&self, cols: &[String]) -> Vec<String> {
        cols.iter().map(|c| self.unrename_col(c)).collect()
    }

    pub fn source_parts(self) -> (Box<dyn Query>, Vec<String>, Vec<String>) {
        (self.source, self.from, self.to)
    }
}

impl Query for Rename {
    fn columns(&self) -> Vec<String> {
        self.rename_list(&self.source.columns())
    }

    fn header(&self) -> Header {
        let src = self.source.header();
        Header::new(
            src.fields.iter().map(|f| self.rename_list(f)).collect(),
            self.rename_list(&src.columns),
        )
    }

    fn keys(&self) -> Vec<Vec<String>> {
        self.source
            .keys()
            .iter()
            .map(|k| self.rename_list(k))
            .collect()
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.source
            .indexes()
            .iter()
            .map(|ix| self.rename_list(ix))
            .collect()
    }

    fn fixed(&self) -> Vec<super::Fixed> {
        self.source
            .fixed()
            .into_iter()
            .map(|f| super::Fixed {
                col: self.rename_col(&f.col),
                vals: f.vals,
            })
            .collect()
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
            return Box::new(super::nothing::Nothing::new(self.columns()));
        }
        // drop renames of columns that no longer exist
        let src_cols = self.source.columns();
        let keep: Vec<usize> = (0..self.from.len())
            .filter(|&i| src_cols.contains(&self.from[i]))
            .collect();
        if keep.len() != self.from.len() {
            self.from = keep.iter().map(|&i| self.from[i].clone()).collect();
            self.to = keep.iter().map(|&i| self.to[i].clone()).collect();
        }
        if self.from.is_empty() {
            return self.source;
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        let src_index = index.map(|ix| self.unrename_list(ix));
        let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, src_index.as_deref(), frac);
        (fix, var, Approach::None)
    }

    fn set_approach(
        &mut self,
        mode: Mode,
        index: Option<&[String]>,
        frac: f64,
        _approach: Approach,
        tran: &dyn QueryTran,
    ) {
        let src_index = index.map(|ix| self.unrename_list(ix));
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, src_index.as_deref(), frac, tran);
    }

    fn rewind(&mut self) {
        self.source.rewind();
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        self.source.get(th, dir)
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        let src_cols = self.unrename_list(cols);
        self.source.select(&src_cols, vals);
    }

    fn single_table(&self) -> bool {
        self.source.single_table()
    }

    fn describe(&self) -> String {
        let pairs: Vec<String> = self
            .from
            .iter()
            .zip(&self.to)
            .map(|(f, t)| format!("{} to {}", f, t))
            .collect();
        format!("{} RENAME {}", self.source.describe(), pairs.join(", "))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}
