//! `summarize [by,] col = op [on], …`: grouped aggregation with four
//! strategies picked by cost:
//!
//! - `TBL`: `count` over a bare table is answered from the row count,
//!   one row, no reads
//! - `IDX`: `min`/`max` with no grouping reads a single row from the
//!   edge of the aggregated column's index (`min` reads forward, `max`
//!   reads backward)
//! - `SEQ`: when the source arrives ordered by the `by` columns (or
//!   they contain a key) groups are consecutive and aggregation is
//!   incremental, fully bidirectional
//! - `MAP`: hash aggregation, read-only mode, bounded by
//!   [`MAP_LIMIT`](crate::config::MAP_LIMIT); must drain the source
//!   before producing anything
//!
//! Failures inside `total`/`average` combiners skip that row's
//! contribution; everything else propagates.

use eyre::Result;
use hashbrown::HashMap;

use crate::config::{MAP_LIMIT, SUM_LIST_LIMIT};
use crate::encoding::pack;
use crate::errors::{query_error, runtime};
use crate::record::RecordBuilder;
use crate::tran::QueryTran;

use super::expr::{arith, BinOp};
use super::table::Table;
use super::{
    contains_key, project_keys, set_approach, Approach, Cost, DbRec, Dir, Header, Mode, Query,
    Row, Thread, IMPOSSIBLE,
};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    Count,
    Total,
    Average,
    Min,
    Max,
    List,
}

impl Agg {
    pub fn parse(s: &str) -> Option<Agg> {
        Some(match s {
            "count" => Agg::Count,
            "total" => Agg::Total,
            "average" => Agg::Average,
            "min" => Agg::Min,
            "max" => Agg::Max,
            "list" => Agg::List,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Agg::Count => "count",
            Agg::Total => "total",
            Agg::Average => "average",
            Agg::Min => "min",
            Agg::Max => "max",
            Agg::List => "list",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Tbl,
    Idx,
    Seq,
    Map,
}

#[derive(Debug, Clone)]
pub struct SumApproach {
    strategy: Strategy,
    index: Option<Vec<String>>,
    frac: f64,
}

impl Default for SumApproach {
    fn default() -> Self {
        SumApproach {
            strategy: Strategy::Seq,
            index: None,
            frac: 1.0,
        }
    }
}

pub struct Summarize {
    source: Box<dyn Query>,
    pub by: Vec<String>,
    pub cols: Vec<String>,
    pub aggs: Vec<Agg>,
    pub ons: Vec<String>,
    strategy: Strategy,
    rewound: bool,
    src_hdr: Option<Header>,
    seq: SeqState,
    map: MapState,
}

#[derive(Default)]
struct SeqState {
    cur_dir: Option<Dir>,
    cur_row: Option<Row>,
    next_row: Option<Row>,
}

#[derive(Default)]
struct MapState {
    list: Option<Vec<(Row, Vec<SumState>)>>,
    pos: isize,
}

impl Summarize {
    pub fn new(
        source: Box<dyn Query>,
        by: Vec<String>,
        mut cols: Vec<String>,
        aggs: Vec<Agg>,
        ons: Vec<String>,
    ) -> Result<Summarize> {
        let src_cols = source.columns();
        for c in by.iter().chain(ons.iter().filter(|c| !c.is_empty())) {
            if !src_cols.contains(c) {
                return Err(query_error(format!("summarize: nonexistent column: {}", c)));
            }
        }
        for (i, col) in cols.iter_mut().enumerate() {
            if col.is_empty() {
                *col = if ons[i].is_empty() {
                    "count".to_string()
                } else {
                    format!("{}_{}", aggs[i].name(), ons[i])
                };
            }
        }
        Ok(Summarize {
            source,
            by,
            cols,
            aggs,
            ons,
            strategy: Strategy::Seq,
            rewound: true,
            src_hdr: None,
            seq: SeqState::default(),
            map: MapState::default(),
        })
    }

    fn minmax1(&self) -> bool {
        self.by.is_empty()
            && self.aggs.len() == 1
            && matches!(self.aggs[0], Agg::Min | Agg::Max)
    }

    fn new_sums(&self) -> Vec<SumState> {
        self.aggs.iter().map(|a| SumState::new(*a)).collect()
    }

    fn add_to_sums(&self, sums: &mut [SumState], row: &Row, th: &Thread) -> Result<()> {
        let hdr = self.src_hdr.as_ref().unwrap();
        for (i, sum) in sums.iter_mut().enumerate() {
            let raw = if self.ons[i].is_empty() {
                Vec::new()
            } else {
                row.get_raw(hdr, &self.ons[i])
            };
            sum.add(&raw, th)?;
        }
        Ok(())
    }

    fn same_by(&self, a: &Row, b: &Row) -> bool {
        let hdr = self.src_hdr.as_ref().unwrap();
        self.by
            .iter()
            .all(|c| a.get_raw(hdr, c) == b.get_raw(hdr, c))
    }

    fn out_row(&self, group: Option<&Row>, sums: &[SumState]) -> Result<Row> {
        let hdr = self.src_hdr.as_ref();
        let mut rb = RecordBuilder::new();
        if let Some(row) = group {
            for c in &self.by {
                rb.add_raw(&row.get_raw(hdr.unwrap(), c));
            }
        }
        for sum in sums {
            rb.add(&sum.result()?);
        }
        Ok(Row(vec![DbRec::derived(rb.build())]))
    }

    // ----- strategies ------------------------------------------------

    fn get_tbl(&mut self) -> Result<Option<Row>> {
        if !self.rewound {
            return Ok(None);
        }
        self.rewound = false;
        let (n, _) = self.source.nrows();
        let mut rb = RecordBuilder::new();
        rb.add(&Value::Int(n));
        Ok(Some(Row(vec![DbRec::derived(rb.build())])))
    }

    fn get_idx(&mut self, th: &Thread) -> Result<Option<Row>> {
        if !self.rewound {
            return Ok(None);
        }
        self.rewound = false;
        // min reads the first index entry, max the last
        let dir = if self.aggs[0] == Agg::Min {
            Dir::Next
        } else {
            Dir::Prev
        };
        let Some(row) = self.source.get(th, dir)? else {
            return Ok(None);
        };
        let hdr = self.src_hdr.as_ref().unwrap();
        let mut rb = RecordBuilder::new();
        rb.add_raw(&row.get_raw(hdr, &self.ons[0]));
        Ok(Some(Row(vec![DbRec::derived(rb.build())])))
    }

    fn get_seq(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        if self.rewound {
            self.rewound = false;
            self.seq.cur_dir = Some(dir);
            self.seq.cur_row = None;
            self.seq.next_row = self.source.get(th, dir)?;
        }
        // a direction change must skip over the group just produced
        if Some(dir) != self.seq.cur_dir {
            if self.seq.next_row.is_none() {
                self.source.rewind();
            }
            loop {
                self.seq.next_row = self.source.get(th, dir)?;
                match (&self.seq.next_row, &self.seq.cur_row) {
                    (Some(next), Some(cur)) if self.same_by(cur, next) => continue,
                    _ => break,
                }
            }
            self.seq.cur_dir = Some(dir);
        }
        if self.seq.next_row.is_none() {
            return Ok(None);
        }
        self.seq.cur_row = self.seq.next_row.clone();
        let mut sums = self.new_sums();
        loop {
            let row = self.seq.next_row.clone().unwrap();
            self.add_to_sums(&mut sums, &row, th)?;
            self.seq.next_row = self.source.get(th, dir)?;
            match &self.seq.next_row {
                Some(next) if self.same_by(self.seq.cur_row.as_ref().unwrap(), next) => {}
                _ => break,
            }
        }
        let cur = self.seq.cur_row.clone();
        self.out_row(cur.as_ref(), &sums).map(Some)
    }

    fn get_map(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        if self.rewound {
            self.rewound = false;
            let list = self.build_map(th)?;
            self.map.pos = if dir == Dir::Next {
                -1
            } else {
                list.len() as isize
            };
            self.map.list = Some(list);
        }
        match dir {
            Dir::Next => self.map.pos += 1,
            Dir::Prev => self.map.pos -= 1,
        }
        let list = self.map.list.as_ref().unwrap();
        if self.map.pos < 0 || self.map.pos >= list.len() as isize {
            return Ok(None);
        }
        let (row, sums) = &list[self.map.pos as usize];
        let row = row.clone();
        self.out_row(Some(&row), sums).map(Some)
    }

    fn build_map(&mut self, th: &Thread) -> Result<Vec<(Row, Vec<SumState>)>> {
        let hdr = self.src_hdr.clone().unwrap();
        let mut groups: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut list: Vec<(Row, Vec<SumState>)> = Vec::new();
        self.source.rewind();
        while let Some(row) = self.source.get(th, Dir::Next)? {
            th.check_interrupt()?;
            let mut key = Vec::new();
            for c in &self.by {
                pack::escape_into(&row.get_raw(&hdr, c), &mut key);
                key.extend_from_slice(&[0x00, 0x00]);
            }
            let idx = match groups.get(&key) {
                Some(&i) => i,
                None => {
                    if groups.len() >= MAP_LIMIT {
                        return Err(runtime(format!("summarize-map too large (> {})", MAP_LIMIT)));
                    }
                    let i = list.len();
                    groups.insert(key, i);
                    list.push((row.clone(), self.new_sums()));
                    i
                }
            };
            let (_, sums) = &mut list[idx];
            let mut tmp = std::mem::take(sums);
            self.add_to_sums(&mut tmp, &row, th)?;
            list[idx].1 = tmp;
        }
        Ok(list)
    }
}

impl Query for Summarize {
    fn columns(&self) -> Vec<String> {
        let mut cols = self.by.clone();
        cols.extend(self.cols.iter().cloned());
        cols
    }

    fn header(&self) -> Header {
        Header::single(self.columns())
    }

    fn keys(&self) -> Vec<Vec<String>> {
        if self.by.is_empty() {
            return vec![Vec::new()]; // singleton
        }
        project_keys(&self.source.keys(), &self.by)
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        if self.by.is_empty() || contains_key(&self.by, &self.source.keys()) {
            return self.source.indexes();
        }
        self.source
            .indexes()
            .into_iter()
            .filter(|ix| starts_with_set(ix, &self.by))
            .collect()
    }

    fn nrows(&self) -> (i64, i64) {
        let (mut n, pop) = self.source.nrows();
        if self.by.is_empty() {
            n = 1;
        } else if !contains_key(&self.by, &self.source.keys()) {
            n /= 2;
        }
        (n, pop)
    }

    fn row_size(&self) -> i64 {
        self.by.len() as i64 * 8 + self.cols.len() as i64 * 8
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        // strip a project-copy: it passes rows through unchanged
        if let Some(p) = self.source.as_any().downcast_ref::<super::project::Project>() {
            if p.unique {
                let p = self
                    .source
                    .into_any()
                    .downcast::<super::project::Project>()
                    .expect("checked");
                self.source = p.source();
            }
        }
        self.source = self.source.transform();
        if self.source.as_any().is::<super::nothing::Nothing>() {
            return Box::new(super::nothing::Nothing::new(self.columns()));
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        // <table> summarize count: answered from the info row count
        if self.source.as_any().is::<Table>()
            && self.by.is_empty()
            && self.aggs.len() == 1
            && self.aggs[0] == Agg::Count
            && index.is_none()
        {
            return (
                0,
                1,
                Approach::Summarize(SumApproach {
                    strategy: Strategy::Tbl,
                    index: None,
                    frac: 0.0,
                }),
            );
        }
        let seq = self.seq_cost(mode, index, frac);
        let idx = self.idx_cost(mode, index);
        let map = self.map_cost(mode, index);
        let best = super::optimize::min3(
            seq.0, seq.1, seq.2, idx.0, idx.1, idx.2, map.0, map.1, map.2,
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
        let Approach::Summarize(app) = approach else {
            panic!("Summarize: unexpected approach");
        };
        self.strategy = app.strategy;
        let _ = frac; // the approach's frac reflects the chosen strategy
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, app.index.as_deref(), app.frac, tran);
        self.src_hdr = Some(self.source.header());
        self.rewound = true;
    }

    fn rewind(&mut self) {
        self.source.rewind();
        self.rewound = true;
        self.map.list = None;
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        th.check_interrupt()?;
        match self.strategy {
            Strategy::Tbl => self.get_tbl(),
            Strategy::Idx => self.get_idx(th),
            Strategy::Seq => self.get_seq(th, dir),
            Strategy::Map => self.get_map(th, dir),
        }
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.source.select(cols, vals);
        self.rewound = true;
        self.map.list = None;
    }

    fn describe(&self) -> String {
        let strategy = match self.strategy {
            Strategy::Tbl => "TBL",
            Strategy::Idx => "IDX",
            Strategy::Seq => "SEQ",
            Strategy::Map => "MAP",
        };
        let items: Vec<String> = self
            .cols
            .iter()
            .zip(&self.aggs)
            .zip(&self.ons)
            .map(|((c, a), on)| {
                if on.is_empty() {
                    format!("{} = {}", c, a.name())
                } else {
                    format!("{} = {} {}", c, a.name(), on)
                }
            })
            .collect();
        format!(
            "{} SUMMARIZE-{} {}{}",
            self.source.describe(),
            strategy,
            if self.by.is_empty() {
                String::new()
            } else {
                format!("{}, ", self.by.join(", "))
            },
            items.join(", ")
        )
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
        self
    }
}

impl Summarize {
    fn seq_cost(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        let frac = if self.by.is_empty() { frac.min(1.0) } else { frac };
        if self.by.is_empty() || contains_key(&self.by, &self.source.keys()) {
            let src_index = if self.by.is_empty() { None } else { index };
            let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, src_index, frac);
            return (
                fix,
                var,
                Approach::Summarize(SumApproach {
                    strategy: Strategy::Seq,
                    index: src_index.map(|ix| ix.to_vec()),
                    frac,
                }),
            );
        }
        // need the source grouped by the by columns
        let mut best: Option<(Cost, Cost, Vec<String>)> = None;
        for ix in self.source.indexes() {
            if !starts_with_set(&ix, &self.by) {
                continue;
            }
            if let Some(required) = index {
                if !ix.starts_with(required) {
                    continue;
                }
            }
            let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, Some(&ix), frac);
            if best
                .as_ref()
                .map_or(true, |(bf, bv, _)| fix + var < bf + bv)
            {
                best = Some((fix, var, ix));
            }
        }
        match best {
            Some((fix, var, ix)) if fix + var < IMPOSSIBLE => (
                fix,
                var,
                Approach::Summarize(SumApproach {
                    strategy: Strategy::Seq,
                    index: Some(ix),
                    frac,
                }),
            ),
            _ => (IMPOSSIBLE, IMPOSSIBLE, Approach::None),
        }
    }

    fn idx_cost(&mut self, mode: Mode, index: Option<&[String]>) -> (Cost, Cost, Approach) {
        if !self.minmax1() || self.ons[0].is_empty() || index.is_some() {
            return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
        }
        let (nrows, _) = self.source.nrows();
        let frac = if nrows > 0 { 1.0 / nrows as f64 } else { 1.0 };
        let ons = vec![self.ons[0].clone()];
        let (fix, var, _) = self.source.optimize(mode, Some(&ons), frac);
        if fix + var >= IMPOSSIBLE {
            return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
        }
        (
            fix,
            var,
            Approach::Summarize(SumApproach {
                strategy: Strategy::Idx,
                index: Some(ons),
                frac,
            }),
        )
    }

    fn map_cost(&mut self, mode: Mode, index: Option<&[String]>) -> (Cost, Cost, Approach) {
        // map accumulates everything before emitting, in hash order:
        // no required order can be satisfied, and it is read-mode only
        let (nrows, _) = self.nrows();
        if index.is_some() || mode != Mode::Read || nrows > (MAP_LIMIT - MAP_LIMIT / 3) as i64 {
            return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
        }
        let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, None, 1.0);
        let fix = fix + nrows.max(0) * 20;
        (
            fix + var,
            0,
            Approach::Summarize(SumApproach {
                strategy: Strategy::Map,
                index: None,
                frac: 1.0,
            }),
        )
    }
}

/// Whether the first `set.len()` columns of `ix` are a permutation of
/// `set` (grouping needs the by columns leading, in any order).
fn starts_with_set(ix: &[String], set: &[String]) -> bool {
    ix.len() >= set.len() && ix[..set.len()].iter().all(|c| set.contains(c))
}

// ---------------------------------------------------------------------

#[derive(Debug)]
enum SumState {
    Count(i64),
    Total(Value),
    Average { count: i64, total: Value },
    Min(Option<Vec<u8>>),
    Max(Option<Vec<u8>>),
    List(Vec<Vec<u8>>),
}

impl Default for SumState {
    fn default() -> Self {
        SumState::Count(0)
    }
}

impl SumState {
    fn new(agg: Agg) -> SumState {
        match agg {
            Agg::Count => SumState::Count(0),
            Agg::Total => SumState::Total(Value::Int(0)),
            Agg::Average => SumState::Average {
                count: 0,
                total: Value::Int(0),
            },
            Agg::Min => SumState::Min(None),
            Agg::Max => SumState::Max(None),
            Agg::List => SumState::List(Vec::new()),
        }
    }

    fn add(&mut self, raw: &[u8], th: &Thread) -> Result<()> {
        th.check_interrupt()?;
        match self {
            SumState::Count(n) => *n += 1,
            SumState::Total(total) => {
                // combiner failures skip the row's contribution
                if let Ok(v) = pack::unpack(raw) {
                    if let Ok(sum) = arith(BinOp::Add, total.clone(), v) {
                        *total = sum;
                    }
                }
            }
            SumState::Average { count, total } => {
                *count += 1;
                if let Ok(v) = pack::unpack(raw) {
                    if let Ok(sum) = arith(BinOp::Add, total.clone(), v) {
                        *total = sum;
                    }
                }
            }
            SumState::Min(best) => {
                if best.as_deref().map_or(true, |b| raw < b) {
                    *best = Some(raw.to_vec());
                }
            }
            SumState::Max(best) => {
                if best.as_deref().map_or(true, |b| raw > b) {
                    *best = Some(raw.to_vec());
                }
            }
            SumState::List(vals) => {
                if !vals.iter().any(|v| v == raw) {
                    vals.push(raw.to_vec());
                    if vals.len() > SUM_LIST_LIMIT {
                        return Err(runtime(format!(
                            "summarize list too large (> {})",
                            SUM_LIST_LIMIT
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn result(&self) -> Result<Value> {
        Ok(match self {
            SumState::Count(n) => Value::Int(*n),
            SumState::Total(total) => total.clone(),
            SumState::Average { count, total } => {
                if *count == 0 {
                    Value::Int(0)
                } else {
                    arith(BinOp::Div, total.clone(), Value::Int(*count))?
                }
            }
            SumState::Min(best) | SumState::Max(best) => match best {
                Some(raw) => pack::unpack(raw)?,
                None => Value::str(""),
            },
            SumState::List(vals) => {
                let mut items = vals
                    .iter()
                    .map(|raw| pack::unpack(raw))
                    .collect::<Result<Vec<_>>>()?;
                items.sort();
                Value::List(items)
            }
        })
    }
}
