//! # Database
//!
//! The top-level handle tying the subsystems together: the chunked
//! store, the state holder, transaction bookkeeping, and the background
//! merge/persist machinery.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Database                     │
//! ├──────────────┬───────────────┬───────────────┤
//! │ Query layer  │ Transactions  │ Admin (DDL)   │
//! ├──────────────┴───────────────┴───────────────┤
//! │        DbState (Meta → index Overlays)       │
//! ├───────────────────────┬──────────────────────┤
//! │  fbtree / mbtree      │  background merger   │
//! │  overlays             │  and persister       │
//! ├───────────────────────┴──────────────────────┤
//! │        chunked append-only store (mmap)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A commit pushes delta layers onto overlays; the background merger
//! squashes accumulated layers; the persister folds them into new frozen
//! trees and appends a state root. Opening a database reads the header's
//! size slot, finds the last state root right below it, and loads meta —
//! if any of that fails, [`crate::repair`] scans backward for the last
//! intact state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::concur::Background;
use crate::config::CHUNK_SIZE;
use crate::errors::corrupt;
use crate::index::Overlay;
use crate::meta::{Meta, Schema};
use crate::state::{self, DbState, StateHolder, STATE_LEN};
use crate::storage::{self, MmapSource, Store, HEADER_SIZE, MAGIC};
use crate::tran::{ReadTran, Trans, UpdateTran};

pub struct Database {
    pub store: Arc<Store>,
    state: StateHolder,
    pub(crate) trans: Trans,
    /// serializes merge/persist cycles against explicit persist calls
    maint_lock: Mutex<()>,
    background: Mutex<Option<Background>>,
}

impl Database {
    /// Creates a new database file (fails if it already has content).
    pub fn create(path: impl AsRef<Path>) -> Result<Arc<Database>> {
        let store = Arc::new(MmapSource::open(path.as_ref(), CHUNK_SIZE, true)?);
        if store.size() != 0 {
            return Err(corrupt(format!(
                "create: {} already exists",
                path.as_ref().display()
            )));
        }
        let (off, buf) = store.alloc(HEADER_SIZE as usize);
        debug_assert_eq!(off, 0);
        buf[..MAGIC.len()].copy_from_slice(MAGIC);
        let db = Database::with_store(store, Meta::default());
        db.persist()?; // an empty but valid state root
        info!(path = %path.as_ref().display(), "created database");
        Ok(db)
    }

    /// Opens an existing database. A torn or missing state root surfaces
    /// as `Corrupt`; run [`crate::repair::repair`] to recover.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Database>> {
        let store = Arc::new(MmapSource::open(path.as_ref(), CHUNK_SIZE, false)?);
        let meta = Database::read_meta(&store)
            .wrap_err_with(|| format!("opening '{}'", path.as_ref().display()))?;
        let db = Database::with_store(store, meta);
        db.start_background();
        Ok(db)
    }

    fn read_meta(store: &Arc<Store>) -> Result<Meta> {
        let file_size = store.size();
        if file_size < HEADER_SIZE {
            return Err(corrupt("file too small for header"));
        }
        let header = &store.data(0)[..HEADER_SIZE as usize];
        if &header[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad database magic"));
        }
        let size = storage::read_small_offset(&header[MAGIC.len()..]);
        if size < HEADER_SIZE + STATE_LEN as u64 || size > file_size {
            return Err(corrupt("bad size in header"));
        }
        store.set_size(size);
        let (offsets, _time) = state::read_state(store, size - STATE_LEN as u64)?;
        Meta::read(store, offsets)
    }

    /// An in-memory database, used by tests.
    pub fn heap() -> Arc<Database> {
        let store = Arc::new(Store::heap(1024 * 1024));
        store.alloc(HEADER_SIZE as usize);
        Database::with_store(store, Meta::default())
    }

    fn with_store(store: Arc<Store>, meta: Meta) -> Arc<Database> {
        Arc::new(Database {
            store,
            state: StateHolder::new(DbState {
                meta: Arc::new(meta),
            }),
            trans: Trans::new(),
            maint_lock: Mutex::new(()),
            background: Mutex::new(None),
        })
    }

    pub fn start_background(self: &Arc<Self>) {
        let mut bg = self.background.lock();
        if bg.is_none() {
            *bg = Some(Background::start(Arc::clone(self)));
        }
    }

    pub(crate) fn notify_commit(&self) {
        if let Some(bg) = self.background.lock().as_ref() {
            bg.committed();
        }
    }

    pub fn get_state(&self) -> Arc<DbState> {
        self.state.get()
    }

    /// See [`StateHolder::update`]: shallow-copy, mutate, atomic swap.
    pub fn update_state(&self, f: impl FnOnce(&mut DbState)) -> Arc<DbState> {
        self.state.update(f)
    }

    pub fn read_tran(&self) -> ReadTran<'_> {
        ReadTran::new(self)
    }

    pub fn update_tran(&self) -> UpdateTran<'_> {
        UpdateTran::new(self)
    }

    // ---------------------------------------------------------------
    // background maintenance

    /// Squashes each overlay's accumulated layers into one (the
    /// background merger's work item).
    pub fn merge(&self) {
        let _m = self.maint_lock.lock();
        let st = self.get_state();
        // compute outside the state mutex
        let mut squashed: Vec<(String, Vec<(usize, Overlay, usize)>)> = Vec::new();
        for (name, tm) in &st.meta.tables {
            let mut per_table = Vec::new();
            for (iix, ov) in tm.indexes.iter().enumerate() {
                if ov.layers.len() > 1 {
                    per_table.push((iix, ov.squash(ov.layers.len()), ov.layers.len()));
                }
            }
            if !per_table.is_empty() {
                squashed.push((name.clone(), per_table));
            }
        }
        if squashed.is_empty() {
            return;
        }
        debug!(tables = squashed.len(), "merging overlay layers");
        self.update_state(|st| {
            let mut meta = (*st.meta).clone();
            for (name, per_table) in &squashed {
                let Some(tm) = meta.get(name) else { continue };
                let mut tm = (**tm).clone();
                for (iix, merged, consumed) in per_table {
                    // commits may have appended layers since we computed
                    let newer = tm.indexes[*iix].layers[*consumed..].to_vec();
                    let mut ov = merged.clone();
                    ov.layers.extend(newer);
                    tm.indexes[*iix] = ov;
                }
                meta.put(tm);
            }
            st.meta = Arc::new(meta);
        });
    }

    /// Flattens every overlay into a new frozen tree, writes the meta
    /// tables and a state root, and records the new size in the header.
    /// Returns the state root offset.
    pub fn persist(&self) -> Result<u64> {
        let _m = self.maint_lock.lock();
        let st = self.get_state();
        // flatten the snapshot's overlays outside the state mutex; the
        // persisted image pairs these roots with the same snapshot's
        // info, so it is internally consistent even if commits land
        // while we work
        let mut persist_meta = (*st.meta).clone();
        let mut flattened: Vec<(String, Vec<(usize, Overlay, usize)>)> = Vec::new();
        for (name, tm) in &st.meta.tables {
            let mut per_table = Vec::new();
            for (iix, ov) in tm.indexes.iter().enumerate() {
                if !ov.layers.is_empty() {
                    per_table.push((iix, ov.flatten()?, ov.layers.len()));
                }
            }
            if !per_table.is_empty() {
                let mut tm2 = (**tm).clone();
                for (iix, flat, _) in &per_table {
                    tm2.indexes[*iix] = flat.clone();
                }
                persist_meta.put(tm2);
                flattened.push((name.clone(), per_table));
            }
        }
        // reconcile the live state: flattened layers are replaced by the
        // new roots, layers committed since stay stacked on top
        self.update_state(|cur| {
            let mut meta = (*cur.meta).clone();
            for (name, per_table) in &flattened {
                let Some(tm) = meta.get(name) else { continue };
                let mut tm = (**tm).clone();
                for (iix, flat, consumed) in per_table {
                    let newer = tm.indexes[*iix].layers[*consumed..].to_vec();
                    let mut ov = flat.clone();
                    ov.layers.extend(newer);
                    tm.indexes[*iix] = ov;
                }
                meta.put(tm);
            }
            cur.meta = Arc::new(meta);
        });
        let offsets = persist_meta.write(&self.store);
        let state_off = state::write_state(&self.store, offsets);
        // the header's size slot names this state: concurrent commits
        // may already have allocated past it
        let mut slot = [0u8; storage::SMALL_OFFSET_LEN];
        storage::write_small_offset(&mut slot, state_off + STATE_LEN as u64);
        self.store.write(MAGIC.len() as u64, &slot);
        debug!(state_off, "persisted state");
        Ok(state_off)
    }

    /// Stops background work, persists a final state, and closes the
    /// store. Further use of this database is a programming error.
    pub fn close(&self) -> Result<()> {
        if let Some(bg) = self.background.lock().take() {
            bg.stop();
        }
        self.persist()?;
        self.store.close();
        Ok(())
    }

    // ---------------------------------------------------------------
    // admin (DDL)

    pub fn add_table(&self, schema: Schema) -> Result<()> {
        let store = Arc::clone(&self.store);
        self.apply_meta(move |meta| meta.add_table(&store, schema))
    }

    pub fn ensure_table(&self, schema: Schema) -> Result<()> {
        let store = Arc::clone(&self.store);
        self.apply_meta(move |meta| {
            if meta.get(&schema.table).is_some() {
                Ok(())
            } else {
                meta.add_table(&store, schema)
            }
        })
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.apply_meta(|meta| {
            if meta.views.remove(table).is_some() {
                return Ok(());
            }
            meta.drop_table(table)
        })
    }

    pub fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.apply_meta(|meta| meta.rename_table(from, to))
    }

    pub fn add_view(&self, name: &str, definition: &str) -> Result<()> {
        self.apply_meta(|meta| meta.add_view(name, definition))
    }

    /// Adds an index to an existing table, populated from its current
    /// rows. Assumes no concurrent writers to the table (admin path).
    pub fn alter_create_index(&self, table: &str, ix: crate::meta::IndexSchema) -> Result<()> {
        use crate::index::{Fbtree, Mbtree, Overlay, OverlayIter};
        use crate::record::Record;
        let st = self.get_state();
        let tm = st.meta.must_get(table)?;
        if tm.schema.index_for(&ix.columns).is_some() {
            return Err(crate::errors::query_error(format!(
                "index ({}) already exists on {}",
                ix.columns.join(","),
                table
            )));
        }
        let ix = crate::meta::IndexSchema::from_code(
            ix.columns.clone(),
            ix.mode_code(),
            &tm.schema.columns,
        )?;
        let mut mb = Mbtree::new();
        let mut iter = OverlayIter::new(tm.indexes[0].clone(), None);
        while let Some((_key, off)) = iter.next()? {
            let rec = Record::read(&self.store, off)?;
            let (key, all_empty) = ix.spec.key_with_flag(&rec, off);
            if ix.spec.unique_enforced(all_empty) && mb.get(&key).is_some() {
                return Err(crate::errors::constraint(format!(
                    "duplicate key: cannot create index ({}) on {}",
                    ix.columns.join(","),
                    table
                )));
            }
            mb.insert(&key, off);
        }
        let overlay =
            Overlay::new(Fbtree::empty(Arc::clone(&self.store))).with_layer(Arc::new(mb));
        self.apply_meta(move |meta| {
            let tm = meta.must_get(table)?.clone();
            let mut tm = (*tm).clone();
            tm.schema.indexes.push(ix);
            tm.indexes.push(overlay);
            meta.put(tm);
            Ok(())
        })
    }

    pub fn alter_drop_index(&self, table: &str, cols: &[String]) -> Result<()> {
        self.apply_meta(|meta| {
            let tm = meta.must_get(table)?.clone();
            let mut tm = (*tm).clone();
            let iix = tm.schema.index_for(cols).ok_or_else(|| {
                crate::errors::query_error(format!(
                    "nonexistent index ({}) on {}",
                    cols.join(","),
                    table
                ))
            })?;
            if iix == 0 {
                return Err(crate::errors::query_error(format!(
                    "cannot drop the key of {}",
                    table
                )));
            }
            tm.schema.indexes.remove(iix);
            tm.indexes.remove(iix);
            meta.put(tm);
            Ok(())
        })
    }

    pub fn get_view(&self, name: &str) -> Option<String> {
        self.get_state().meta.get_view(name).map(str::to_string)
    }

    fn apply_meta(&self, f: impl FnOnce(&mut Meta) -> Result<()>) -> Result<()> {
        let mut result = Ok(());
        self.update_state(|st| {
            let mut meta = (*st.meta).clone();
            result = f(&mut meta);
            if result.is_ok() {
                st.meta = Arc::new(meta);
            }
        });
        result
    }

    /// Parses and applies an admin (DDL) request.
    pub fn admin(&self, request: &str) -> Result<()> {
        crate::query::parse::apply_admin(self, request)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(bg) = self.background.lock().take() {
            bg.stop();
        }
    }
}

/// Copies all live data into a fresh file, dropping dead records and
/// superseded tree nodes, then swaps it in place of the original
/// (original kept as `.bak`).
pub fn compact(path: impl AsRef<Path>) -> Result<(u64, u64)> {
    let path = path.as_ref();
    let db = Database::open(path)?;
    let old_size = db.store.size();
    let tmp: PathBuf = path.with_extension("tmp");
    let _ = std::fs::remove_file(&tmp);
    let dst = Database::create(&tmp)?;

    let st = db.get_state();
    let mut names: Vec<&String> = st.meta.tables.keys().collect();
    names.sort();
    for name in names {
        let tm = &st.meta.tables[name];
        dst.add_table(tm.schema.clone())?;
        copy_table(&db, &dst, name)?;
    }
    for (view, def) in &st.meta.views {
        dst.add_view(view, def)?;
    }
    dst.close()?;
    db.close()?;
    let new_size = std::fs::metadata(&tmp)?.len();

    let bak = path.with_extension("bak");
    let _ = std::fs::remove_file(&bak);
    std::fs::rename(path, &bak)?;
    std::fs::rename(&tmp, path)?;
    info!(old_size, new_size, "compacted database");
    Ok((old_size, new_size))
}

fn copy_table(src: &Arc<Database>, dst: &Arc<Database>, table: &str) -> Result<()> {
    use crate::index::OverlayIter;
    use crate::record::Record;
    let st = src.get_state();
    let tm = st.meta.must_get(table)?;
    let tran = dst.update_tran();
    let mut iter = OverlayIter::new(tm.indexes[0].clone(), None);
    while let Some((_key, off)) = iter.next()? {
        let rec = Record::read_ck(&src.store, off)?; // full check on the way through
        tran.insert_record(table, &rec)?;
    }
    tran.commit()
}
