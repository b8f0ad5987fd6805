//! # Query Algebra
//!
//! Queries are trees of relational operators — table, project, rename,
//! extend, where, summarize, join, leftjoin, times, union, intersect,
//! minus, sort — all implementing one contract ([`Query`]):
//!
//! - **planning**: `columns`, `keys`, `indexes`, `fixed`, `nrows`,
//!   `row_size`, plus the three-phase pipeline `transform` (algebraic
//!   rewrites) → `optimize` (cost exploration returning an opaque
//!   [`Approach`]) → `set_approach` (bind the chosen strategy and the
//!   transaction)
//! - **execution**: bidirectional, rewindable row cursors: `rewind`,
//!   `get(thread, dir)`, `select(cols, vals)` to install an equality
//!   restriction, and `lookup` for point probes
//!
//! Costs are split into `(fixcost, varcost)`: the fixed part is paid
//! regardless (e.g. building a temp index), the variable part scales
//! with the fraction of output actually read. `frac` flows down the
//! tree so an operator that will only read 1% of its source charges 1%
//! of the source's variable cost.
//!
//! The transaction is passed on every call through [`Thread`], never
//! owned by operators, so plans and transactions have independent
//! lifetimes. The thread also carries the interrupt flag checked at row
//! boundaries.

pub mod compatible;
pub mod expr;
pub mod extend;
pub mod filter;
pub mod join;
pub mod nothing;
pub mod optimize;
pub mod parse;
pub mod project;
pub mod rename;
pub mod sort;
pub mod summarize;
pub mod table;
pub mod tempindex;
pub mod union;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;

use crate::errors::Error;
use crate::record::Record;
use crate::storage::Offset;
use crate::tran::QueryTran;

pub use optimize::{optimize_cost, set_approach, setup, setup_query, BestIndex, Mode};

pub type Cost = i64;
pub const IMPOSSIBLE: Cost = 1 << 40;
/// Penalty for reading a source in the "wrong" order (lookup strategies
/// that must drain one side before the other).
pub const OUT_OF_ORDER: Cost = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Next,
    Prev,
}

impl Dir {
    pub fn reverse(self) -> Dir {
        match self {
            Dir::Next => Dir::Prev,
            Dir::Prev => Dir::Next,
        }
    }
}

/// Per-execution context: the transaction and the cooperative
/// interrupt flag, checked at each operator's row boundary.
pub struct Thread<'t> {
    pub tran: &'t dyn QueryTran,
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl<'t> Thread<'t> {
    pub fn new(tran: &'t dyn QueryTran) -> Thread<'t> {
        Thread {
            tran,
            interrupt: None,
        }
    }

    pub fn check_interrupt(&self) -> Result<()> {
        if let Some(flag) = &self.interrupt {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled.into());
            }
        }
        Ok(())
    }
}

/// One stored or derived record within a row. `off == 0` marks derived
/// records (extend, summarize output) that live nowhere in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRec {
    pub rec: Record,
    pub off: Offset,
}

impl DbRec {
    pub fn stored(rec: Record, off: Offset) -> DbRec {
        DbRec { rec, off }
    }

    pub fn derived(rec: Record) -> DbRec {
        DbRec { rec, off: 0 }
    }

    pub fn missing() -> DbRec {
        DbRec {
            rec: Record::empty(),
            off: 0,
        }
    }
}

/// A row is a list of record parts, one per source that contributed to
/// it (joins concatenate, unions pad the absent side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(pub Vec<DbRec>);

impl Row {
    pub fn single(rec: Record, off: Offset) -> Row {
        Row(vec![DbRec::stored(rec, off)])
    }

    /// The packed bytes of a column, or empty if absent. Searches the
    /// parts in order and skips parts with no data, so a union row finds
    /// its populated side and an extend's derived part supplies the
    /// extended columns.
    pub fn get_raw(&self, hdr: &Header, col: &str) -> Vec<u8> {
        for (part, fields) in hdr.fields.iter().enumerate() {
            if let Some(fld) = fields.iter().position(|f| f == col) {
                if let Some(dbrec) = self.0.get(part) {
                    if dbrec.rec.count() > 0 {
                        return dbrec.rec.field(fld).to_vec();
                    }
                }
            }
        }
        Vec::new()
    }

    pub fn get_val(&self, hdr: &Header, col: &str) -> Result<crate::value::Value> {
        crate::encoding::pack::unpack(&self.get_raw(hdr, col))
    }
}

/// Concatenates two rows part-wise (join, union padding).
pub fn join_rows(a: &Row, b: &Row) -> Row {
    let mut parts = a.0.clone();
    parts.extend(b.0.iter().cloned());
    Row(parts)
}

/// Physical layout of rows: per part, the column names of that part's
/// record; plus the logical visible columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub fields: Vec<Vec<String>>,
    pub columns: Vec<String>,
}

impl Header {
    pub fn new(fields: Vec<Vec<String>>, columns: Vec<String>) -> Header {
        Header { fields, columns }
    }

    pub fn single(columns: Vec<String>) -> Header {
        Header {
            fields: vec![columns.clone()],
            columns,
        }
    }

    pub fn has_column(&self, col: &str) -> bool {
        self.columns.iter().any(|c| c == col)
    }

    /// Header of rows produced by concatenating rows of `self` and
    /// `other`.
    pub fn concat(&self, other: &Header) -> Header {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        let mut columns = self.columns.clone();
        for c in &other.columns {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
        Header { fields, columns }
    }
}

/// A column known to hold one of a fixed set of packed values,
/// propagated through the plan for disjoint-union detection and
/// select satisfaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixed {
    pub col: String,
    pub vals: Vec<Vec<u8>>,
}

/// The opaque strategy token produced by `optimize` and consumed by
/// `set_approach`.
#[derive(Debug, Clone, Default)]
pub enum Approach {
    #[default]
    None,
    TableIndex(usize),
    Where(filter::WhereApproach),
    Project(project::ProjectApproach),
    Summarize(summarize::SumApproach),
    Union(union::UnionApproach),
    Compatible(compatible::CompatApproach),
    Join(join::JoinApproach),
    Sort(sort::SortApproach),
}

pub trait Query {
    fn columns(&self) -> Vec<String>;
    fn header(&self) -> Header;
    /// Column sets whose values are unique across rows.
    fn keys(&self) -> Vec<Vec<String>>;
    /// Orders this operator can natively deliver.
    fn indexes(&self) -> Vec<Vec<String>>;
    fn fixed(&self) -> Vec<Fixed> {
        Vec::new()
    }
    /// (estimated rows, population rows)
    fn nrows(&self) -> (i64, i64);
    fn row_size(&self) -> i64;

    /// Idempotent algebraic rewrite of this subtree.
    fn transform(self: Box<Self>) -> Box<dyn Query>;
    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach);
    fn set_approach(
        &mut self,
        mode: Mode,
        index: Option<&[String]>,
        frac: f64,
        approach: Approach,
        tran: &dyn QueryTran,
    );

    fn rewind(&mut self);
    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>>;
    /// Installs (or with empty slices clears) an equality restriction;
    /// always rewinds.
    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]);
    fn lookup(&mut self, th: &Thread, cols: &[String], vals: &[Vec<u8>]) -> Result<Option<Row>> {
        self.select(cols, vals);
        let row = self.get(th, Dir::Next)?;
        self.select(&[], &[]);
        Ok(row)
    }

    /// True when rows come from exactly one stored table (temp index
    /// can then sort bare record offsets).
    fn single_table(&self) -> bool {
        false
    }

    /// Strategy display, e.g. "UNION-MERGE".
    fn describe(&self) -> String;

    /// Downcast hooks for the transform rewrites (pushing `where`
    /// below `project`/`rename`/`extend`, combining extends, …).
    fn as_any(&self) -> &dyn std::any::Any;
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

/// Whether one of `keys` is contained in `cols` (the columns then
/// determine rows uniquely).
pub fn contains_key(cols: &[String], keys: &[Vec<String>]) -> bool {
    keys.iter().any(|key| key.iter().all(|k| cols.contains(k)))
}

/// Keys of a projection: source keys fully inside `cols`, else the
/// whole column set (projection output is de-duplicated).
pub fn project_keys(keys: &[Vec<String>], cols: &[String]) -> Vec<Vec<String>> {
    let kept: Vec<Vec<String>> = keys
        .iter()
        .filter(|key| key.iter().all(|k| cols.contains(k)))
        .cloned()
        .collect();
    if kept.is_empty() {
        vec![cols.to_vec()]
    } else {
        kept
    }
}
