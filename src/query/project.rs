//! `project` / `remove`: restrict the visible columns. When the kept
//! columns contain a key of the source, every projected row is already
//! unique and rows pass straight through ("project-copy") — the shape
//! summarize strips away during transform. Otherwise the output must be
//! de-duplicated, which materializes the distinct projected records
//! through a bounded hash map.

use eyre::Result;
use hashbrown::HashSet;

use crate::config::MAP_LIMIT;
use crate::errors::runtime;
use crate::record::RecordBuilder;
use crate::tran::QueryTran;

use super::{
    contains_key, project_keys, set_approach, Approach, Cost, DbRec, Dir, Header, Mode, Query,
    Row, Thread, IMPOSSIBLE,
};

#[derive(Debug, Clone, Default)]
pub struct ProjectApproach {
    index: Option<Vec<String>>,
}

pub struct Project {
    source: Box<dyn Query>,
    pub cols: Vec<String>,
    pub unique: bool,
    // map-strategy state
    distinct: Option<Vec<Row>>,
    pos: isize,
    rewound: bool,
}

impl Project {
    pub fn new(source: Box<dyn Query>, cols: Vec<String>) -> Project {
        let unique = contains_key(&cols, &source.keys());
        Project {
            source,
            cols,
            unique,
            distinct: None,
            pos: -1,
            rewound: true,
        }
    }

    /// `remove cols`: project onto the complement.
    pub fn remove(source: Box<dyn Query>, cols: &[String]) -> Project {
        let kept: Vec<String> = source
            .columns()
            .into_iter()
            .filter(|c| !cols.contains(c))
            .collect();
        Project::new(source, kept)
    }

    pub fn source(self) -> Box<dyn Query> {
        self.source
    }

    fn project_row(&self, hdr: &Header, row: &Row) -> Row {
        let mut rb = RecordBuilder::new();
        for col in &self.cols {
            rb.add_raw(&row.get_raw(hdr, col));
        }
        Row(vec![DbRec::derived(rb.build())])
    }

    fn build_distinct(&mut self, th: &Thread) -> Result<Vec<Row>> {
        let hdr = self.source.header();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut rows = Vec::new();
        self.source.rewind();
        while let Some(row) = self.source.get(th, Dir::Next)? {
            let projected = self.project_row(&hdr, &row);
            if seen.insert(projected.0[0].rec.bytes().to_vec()) {
                if seen.len() > MAP_LIMIT {
                    return Err(runtime(format!("project too large (> {})", MAP_LIMIT)));
                }
                rows.push(projected);
            }
        }
        Ok(rows)
    }
}

impl Query for Project {
    fn columns(&self) -> Vec<String> {
        self.cols.clone()
    }

    fn header(&self) -> Header {
        if self.unique {
            let src = self.source.header();
            Header::new(src.fields, self.cols.clone())
        } else {
            Header::single(self.cols.clone())
        }
    }

    fn keys(&self) -> Vec<Vec<String>> {
        project_keys(&self.source.keys(), &self.cols)
    }

    fn indexes(&self) -> Vec<Vec<String>> {
        self.source
            .indexes()
            .into_iter()
            .filter(|ix| ix.iter().all(|c| self.cols.contains(c)))
            .collect()
    }

    fn fixed(&self) -> Vec<super::Fixed> {
        self.source
            .fixed()
            .into_iter()
            .filter(|f| self.cols.contains(&f.col))
            .collect()
    }

    fn nrows(&self) -> (i64, i64) {
        let (n, pop) = self.source.nrows();
        if self.unique {
            (n, pop)
        } else {
            (n / 2, pop) // estimate half distinct
        }
    }

    fn row_size(&self) -> i64 {
        let src_cols = self.source.columns().len().max(1);
        self.source.row_size() * self.cols.len() as i64 / src_cols as i64
    }

    fn transform(mut self: Box<Self>) -> Box<dyn Query> {
        self.source = self.source.transform();
        if self.source.as_any().is::<super::nothing::Nothing>() {
            return Box::new(super::nothing::Nothing::new(self.cols));
        }
        // project of project: keep the outer columns
        if self.source.as_any().is::<Project>() {
            let inner = self
                .source
                .into_any()
                .downcast::<Project>()
                .expect("checked");
            return Box::new(Project::new(inner.source, self.cols)).transform();
        }
        self
    }

    fn optimize(&mut self, mode: Mode, index: Option<&[String]>, frac: f64)
        -> (Cost, Cost, Approach) {
        if let Some(index) = index {
            // the de-duplicating form materializes in source order and
            // cannot deliver any ordering itself
            if !self.unique || !index.iter().all(|c| self.cols.contains(c)) {
                return (IMPOSSIBLE, IMPOSSIBLE, Approach::None);
            }
        }
        let (fix, var) = super::optimize_cost(self.source.as_mut(), mode, index, frac);
        if self.unique {
            (fix, var, Approach::Project(ProjectApproach {
                index: index.map(|i| i.to_vec()),
            }))
        } else {
            // materialize + dedup: everything is fixed cost
            let (n, _) = self.source.nrows();
            (fix + var + n.max(1) * 10, 0, Approach::Project(ProjectApproach {
                index: index.map(|i| i.to_vec()),
            }))
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
        let Approach::Project(app) = approach else {
            panic!("Project: unexpected approach");
        };
        let src = std::mem::replace(
            &mut self.source,
            Box::new(super::nothing::Nothing::new(Vec::new())),
        );
        self.source = set_approach(src, mode, app.index.as_deref(), frac, tran);
        self.rewound = true;
    }

    fn rewind(&mut self) {
        self.source.rewind();
        self.rewound = true;
    }

    fn get(&mut self, th: &Thread, dir: Dir) -> Result<Option<Row>> {
        if self.unique {
            self.rewound = false;
            return self.source.get(th, dir);
        }
        if self.rewound {
            let rows = self.build_distinct(th)?;
            self.pos = if dir == Dir::Next {
                -1
            } else {
                rows.len() as isize
            };
            self.distinct = Some(rows);
            self.rewound = false;
        }
        match dir {
            Dir::Next => self.pos += 1,
            Dir::Prev => self.pos -= 1,
        }
        let rows = self.distinct.as_ref().unwrap();
        if self.pos < 0 || self.pos >= rows.len() as isize {
            return Ok(None);
        }
        Ok(Some(rows[self.pos as usize].clone()))
    }

    fn select(&mut self, cols: &[String], vals: &[Vec<u8>]) {
        self.source.select(cols, vals);
        self.distinct = None;
        self.rewound = true;
    }

    fn single_table(&self) -> bool {
        self.unique && self.source.single_table()
    }

    fn describe(&self) -> String {
        let strategy = if self.unique { "COPY" } else { "MAP" };
        format!(
            "{} PROJECT-{} {}",
            self.source.describe(),
            strategy,
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
