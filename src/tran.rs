//! # Transactions
//!
//! Snapshot-isolation MVCC over the state holder. A read transaction is
//! just a pinned snapshot: one atomic load at begin, no locks, no
//! validation at end, and it never blocks anyone. An update transaction
//! adds a private delta tree per touched index, a read-set of covered
//! key ranges, and commit-time validation.
//!
//! ## Commit
//!
//! Commits are totally ordered by a serial commit mutex. Under it, the
//! committing transaction is checked against every transaction that
//! committed after its snapshot was taken:
//!
//! - a key written by both is a write/write conflict (this also catches
//!   duplicate unique keys, which encode to identical tree keys)
//! - a committed write landing inside this transaction's read ranges is
//!   a read/write conflict
//!
//! A conflict aborts with [`Error::Conflict`](crate::errors::Error) and
//! leaves no trace; otherwise the private deltas are pushed as new
//! overlay layers in one state swap and the commit counter advances.
//! Record bytes were already appended to the store at insert time —
//! append-only storage means an abort simply strands them until the
//! next compaction.
//!
//! Committed write-sets are retained only while a live transaction might
//! still need them for validation; they are garbage collected as the
//! oldest live snapshot advances.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::MAP_LIMIT;
use crate::database::Database;
use crate::errors::{conflict, constraint, query_error, runtime};
use crate::index::Mbtree;
use crate::meta::TableMeta;
use crate::record::Record;
use crate::state::DbState;
use crate::storage::{Offset, Store};
use crate::value::Value;

/// What the query layer needs from a transaction. Operators receive it
/// on every call rather than owning it, so plans hold no transaction
/// pointers.
pub trait QueryTran {
    fn state(&self) -> &Arc<DbState>;
    fn store(&self) -> &Arc<Store>;
    /// The private delta layer for an index, when this is an update
    /// transaction that has written to it.
    fn extra_layer(&self, table: &str, iix: usize) -> Option<Arc<Mbtree>>;
    /// Records that this transaction's result depends on `[org, end)` of
    /// the given index. No-op for read transactions.
    fn track_read(&self, table: &str, iix: usize, org: &[u8], end: &[u8]);

    fn table_meta(&self, table: &str) -> Result<Arc<TableMeta>> {
        self.state().meta.must_get(table).cloned()
    }

    fn get_record(&self, off: Offset) -> Result<Record> {
        Record::read(self.store(), off)
    }
}

type IndexId = (String, usize);
type Range = (Vec<u8>, Vec<u8>);

/// Transaction bookkeeping owned by the database.
pub struct Trans {
    pub(crate) inner: Mutex<TransInner>,
    pub(crate) commit_lock: Mutex<()>,
}

#[derive(Default)]
pub(crate) struct TransInner {
    next_num: u64,
    commit_count: u64,
    /// live transaction number -> the commit count its snapshot saw
    live: HashMap<u64, u64>,
    committed: Vec<Committed>,
}

pub(crate) struct Committed {
    commit_num: u64,
    writes: Vec<(IndexId, Arc<Mbtree>)>,
}

impl Trans {
    pub fn new() -> Trans {
        Trans {
            inner: Mutex::new(TransInner::default()),
            commit_lock: Mutex::new(()),
        }
    }

    fn begin(&self) -> (u64, u64) {
        let mut inner = self.inner.lock();
        inner.next_num += 1;
        let num = inner.next_num;
        let asof = inner.commit_count;
        inner.live.insert(num, asof);
        (num, asof)
    }

    fn end(&self, num: u64) {
        let mut inner = self.inner.lock();
        inner.live.remove(&num);
        let oldest = inner.oldest_asof();
        inner.committed.retain(|ct| ct.commit_num > oldest);
    }

    /// The commit count seen by the oldest live snapshot.
    pub fn oldest_asof(&self) -> u64 {
        self.inner.lock().oldest_asof()
    }
}

impl Default for Trans {
    fn default() -> Self {
        Trans::new()
    }
}

impl TransInner {
    fn oldest_asof(&self) -> u64 {
        self.live.values().copied().min().unwrap_or(self.commit_count)
    }
}

// --------------------------------------------------------------------

pub struct ReadTran<'db> {
    db: &'db Database,
    num: u64,
    state: Arc<DbState>,
}

impl<'db> ReadTran<'db> {
    pub(crate) fn new(db: &'db Database) -> ReadTran<'db> {
        let (num, _) = db.trans.begin();
        ReadTran {
            db,
            num,
            state: db.get_state(),
        }
    }
}

impl QueryTran for ReadTran<'_> {
    fn state(&self) -> &Arc<DbState> {
        &self.state
    }

    fn store(&self) -> &Arc<Store> {
        &self.db.store
    }

    fn extra_layer(&self, _table: &str, _iix: usize) -> Option<Arc<Mbtree>> {
        None
    }

    fn track_read(&self, _table: &str, _iix: usize, _org: &[u8], _end: &[u8]) {}
}

impl Drop for ReadTran<'_> {
    fn drop(&mut self) {
        self.db.trans.end(self.num);
    }
}

// --------------------------------------------------------------------

pub struct UpdateTran<'db> {
    db: &'db Database,
    num: u64,
    asof: u64,
    state: Arc<DbState>,
    ut: Mutex<UtInner>,
}

#[derive(Default)]
struct UtInner {
    writes: HashMap<IndexId, Arc<Mbtree>>,
    reads: HashMap<IndexId, Vec<Range>>,
    /// per-table (row delta, byte delta)
    deltas: HashMap<String, (i64, i64)>,
    ended: bool,
}

impl<'db> UpdateTran<'db> {
    pub(crate) fn new(db: &'db Database) -> UpdateTran<'db> {
        let (num, asof) = db.trans.begin();
        UpdateTran {
            db,
            num,
            asof,
            state: db.get_state(),
            ut: Mutex::new(UtInner::default()),
        }
    }

    /// Builds a record from `vals` in schema column order and inserts it.
    pub fn insert_row(&self, table: &str, vals: &[Value]) -> Result<Offset> {
        let tm = self.table_meta(table)?;
        if vals.len() > tm.schema.columns.len() {
            return Err(query_error(format!(
                "too many values for {} ({} > {})",
                table,
                vals.len(),
                tm.schema.columns.len()
            )));
        }
        let mut rb = crate::record::RecordBuilder::new();
        for v in vals {
            rb.add(v);
        }
        let rec = rb.build();
        self.insert_record(table, &rec)
    }

    /// Appends the record to the store and stages it into every index.
    pub fn insert_record(&self, table: &str, rec: &Record) -> Result<Offset> {
        let tm = self.table_meta(table)?;
        let off = rec.write_to(self.store());
        let mut ut = self.ut.lock();
        for (iix, ix) in tm.schema.indexes.iter().enumerate() {
            let (key, all_empty) = ix.spec.key_with_flag(rec, off);
            if ix.spec.unique_enforced(all_empty) {
                let id = (table.to_string(), iix);
                let extra = ut.writes.get(&id).map(Arc::as_ref);
                if tm.indexes[iix].lookup(&key, extra)?.is_some() {
                    return Err(constraint(format!(
                        "duplicate key: {} in {}",
                        ix.columns.join(","),
                        table
                    )));
                }
            }
            let mb = ut
                .writes
                .entry((table.to_string(), iix))
                .or_insert_with(|| Arc::new(Mbtree::new()));
            let mb = Arc::make_mut(mb);
            mb.insert(&key, off);
            if mb.len() > MAP_LIMIT {
                return Err(runtime(format!("transaction too large (> {})", MAP_LIMIT)));
            }
        }
        let delta = ut.deltas.entry(table.to_string()).or_insert((0, 0));
        delta.0 += 1;
        delta.1 += rec.len() as i64;
        Ok(off)
    }

    /// Stages a delete of the record at `off` from every index.
    pub fn delete_record(&self, table: &str, off: Offset) -> Result<()> {
        let tm = self.table_meta(table)?;
        let rec = self.get_record(off)?;
        let mut ut = self.ut.lock();
        for (iix, ix) in tm.schema.indexes.iter().enumerate() {
            let key = ix.spec.key(&rec, off);
            let mb = ut
                .writes
                .entry((table.to_string(), iix))
                .or_insert_with(|| Arc::new(Mbtree::new()));
            Arc::make_mut(mb).delete(&key, off);
        }
        let delta = ut.deltas.entry(table.to_string()).or_insert((0, 0));
        delta.0 -= 1;
        delta.1 -= rec.len() as i64;
        Ok(())
    }

    /// Replaces the record at `off` with `rec`.
    pub fn update_record(&self, table: &str, off: Offset, rec: &Record) -> Result<Offset> {
        self.delete_record(table, off)?;
        self.insert_record(table, rec)
    }

    /// Validates against concurrently committed transactions and, if
    /// clean, publishes this transaction's deltas in one state swap.
    pub fn commit(self) -> Result<()> {
        let _serial = self.db.trans.commit_lock.lock();
        let (writes, deltas) = {
            let mut ut = self.ut.lock();
            ut.ended = true;
            {
                let inner = self.db.trans.inner.lock();
                for ct in inner.committed.iter().filter(|ct| ct.commit_num > self.asof) {
                    self.validate_against(&ut, ct)?;
                }
            }
            (std::mem::take(&mut ut.writes), std::mem::take(&mut ut.deltas))
        };

        // group the staged layers per table for one TableMeta swap each
        let mut by_table: HashMap<String, SmallVec<[(usize, Arc<Mbtree>); 4]>> = HashMap::new();
        for ((table, iix), mb) in &writes {
            by_table
                .entry(table.clone())
                .or_default()
                .push((*iix, Arc::clone(mb)));
        }

        self.db.update_state(|st| {
            let mut meta = (*st.meta).clone();
            for (table, layers) in &by_table {
                let Some(tm) = meta.get(table) else { continue };
                let mut tm = (**tm).clone();
                for (iix, mb) in layers {
                    tm.indexes[*iix] = tm.indexes[*iix].with_layer(Arc::clone(mb));
                }
                if let Some((dn, dsize)) = deltas.get(table) {
                    tm.info.nrows = (tm.info.nrows as i64 + dn).max(0) as usize;
                    tm.info.size = (tm.info.size as i64 + dsize).max(0) as u64;
                }
                meta.put(tm);
            }
            st.meta = Arc::new(meta);
        });

        {
            let mut inner = self.db.trans.inner.lock();
            inner.commit_count += 1;
            let commit_num = inner.commit_count;
            inner.committed.push(Committed {
                commit_num,
                writes: writes.into_iter().collect(),
            });
        }
        self.db.notify_commit();
        Ok(())
    }

    fn validate_against(&self, ut: &UtInner, ct: &Committed) -> Result<()> {
        for (id, their_mb) in &ct.writes {
            if let Some(my_mb) = ut.writes.get(id) {
                let (small, large): (&Mbtree, &Mbtree) = if my_mb.len() <= their_mb.len() {
                    (my_mb, their_mb)
                } else {
                    (their_mb, my_mb)
                };
                let mut hit = false;
                small.for_each(|k, _| hit = hit || large.get(k).is_some());
                if hit {
                    return Err(conflict(format!("write in {}.{}", id.0, id.1)));
                }
            }
            if let Some(ranges) = ut.reads.get(id) {
                let mut hit = false;
                their_mb.for_each(|k, _| {
                    hit = hit
                        || ranges
                            .iter()
                            .any(|(org, end)| org.as_slice() <= k && k < end.as_slice());
                });
                if hit {
                    return Err(conflict(format!("read of {}.{}", id.0, id.1)));
                }
            }
        }
        Ok(())
    }

    pub fn abort(self) {
        self.ut.lock().ended = true;
        // Drop releases the live entry; staged layers just evaporate
    }
}

impl QueryTran for UpdateTran<'_> {
    fn state(&self) -> &Arc<DbState> {
        &self.state
    }

    fn store(&self) -> &Arc<Store> {
        &self.db.store
    }

    fn extra_layer(&self, table: &str, iix: usize) -> Option<Arc<Mbtree>> {
        self.ut
            .lock()
            .writes
            .get(&(table.to_string(), iix))
            .cloned()
    }

    fn track_read(&self, table: &str, iix: usize, org: &[u8], end: &[u8]) {
        self.ut
            .lock()
            .reads
            .entry((table.to_string(), iix))
            .or_default()
            .push((org.to_vec(), end.to_vec()));
    }
}

impl Drop for UpdateTran<'_> {
    fn drop(&mut self) {
        self.db.trans.end(self.num);
    }
}
