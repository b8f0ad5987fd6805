//! # Meta: Schema and Info
//!
//! The catalog of the database: per-table [`Schema`] (name, columns,
//! index definitions) and [`Info`] (row count, data size, and the live
//! [`Overlay`] handle per index), plus named views.
//!
//! Meta is a copy-on-write value. A [`crate::state::DbState`] holds it
//! behind an `Arc`; every mutation path shallow-copies the maps, swaps
//! in replacement `Arc<TableMeta>` entries, and publishes the whole
//! thing atomically. Readers keep whatever snapshot they started with.
//!
//! ## Persistence
//!
//! Meta persists as two logical tables whose offsets go into the state
//! root: the tables blob (schema + info + frozen-tree roots per index)
//! and the views blob. Each blob is a count followed by ordinary
//! [`Record`]s — the catalog dogfoods the record codec — and ends with a
//! CRC-32. Only frozen-tree roots are persisted: the persister flattens
//! every overlay before asking meta to write itself.

mod schema;

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;

use crate::cksum;
use crate::encoding::varint;
use crate::errors::{corrupt, query_error};
use crate::index::{Fbtree, Overlay};
use crate::record::{Record, RecordBuilder};
use crate::storage::{Offset, Store};
use crate::value::Value;

pub use schema::{IndexSchema, Schema};

/// Number of persisted meta tables, fixed at build time: tables, views.
pub const NOFFSETS: usize = 2;

#[derive(Debug, Clone)]
pub struct Info {
    pub nrows: usize,
    pub size: u64,
}

#[derive(Clone)]
pub struct TableMeta {
    pub schema: Schema,
    pub info: Info,
    pub indexes: Vec<Overlay>,
}

#[derive(Clone, Default)]
pub struct Meta {
    pub tables: HashMap<String, Arc<TableMeta>>,
    pub views: HashMap<String, String>,
}

impl Meta {
    pub fn get(&self, table: &str) -> Option<&Arc<TableMeta>> {
        self.tables.get(table)
    }

    pub fn must_get(&self, table: &str) -> Result<&Arc<TableMeta>> {
        self.tables
            .get(table)
            .ok_or_else(|| query_error(format!("nonexistent table: {}", table)))
    }

    pub fn add_table(&mut self, store: &Arc<Store>, schema: Schema) -> Result<()> {
        if self.tables.contains_key(&schema.table) {
            return Err(query_error(format!("table already exists: {}", schema.table)));
        }
        let indexes = schema
            .indexes
            .iter()
            .map(|_| Overlay::new(Fbtree::empty(Arc::clone(store))))
            .collect();
        self.tables.insert(
            schema.table.clone(),
            Arc::new(TableMeta {
                schema,
                info: Info { nrows: 0, size: 0 },
                indexes,
            }),
        );
        Ok(())
    }

    pub fn drop_table(&mut self, table: &str) -> Result<()> {
        self.tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| query_error(format!("nonexistent table: {}", table)))
    }

    pub fn rename_table(&mut self, from: &str, to: &str) -> Result<()> {
        if self.tables.contains_key(to) {
            return Err(query_error(format!("table already exists: {}", to)));
        }
        let tm = self
            .tables
            .remove(from)
            .ok_or_else(|| query_error(format!("nonexistent table: {}", from)))?;
        let mut tm2 = (*tm).clone();
        tm2.schema.table = to.to_string();
        self.tables.insert(to.to_string(), Arc::new(tm2));
        Ok(())
    }

    /// Replaces a table's entry wholesale (commit, merge, persist).
    pub fn put(&mut self, tm: TableMeta) {
        self.tables.insert(tm.schema.table.clone(), Arc::new(tm));
    }

    pub fn add_view(&mut self, name: &str, definition: &str) -> Result<()> {
        if self.views.contains_key(name) {
            return Err(query_error(format!("view already exists: {}", name)));
        }
        self.views.insert(name.to_string(), definition.to_string());
        Ok(())
    }

    pub fn drop_view(&mut self, name: &str) -> Result<()> {
        self.views
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| query_error(format!("nonexistent view: {}", name)))
    }

    pub fn get_view(&self, name: &str) -> Option<&str> {
        self.views.get(name).map(String::as_str)
    }

    /// Writes the meta tables, returning the offsets for the state root.
    /// Indexes must already have been flattened to frozen trees; layered
    /// deltas are not persisted.
    pub fn write(&self, store: &Store) -> [Offset; NOFFSETS] {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        let mut tables_blob = Vec::new();
        varint::encode(names.len() as u64, &mut tables_blob);
        for name in names {
            let tm = &self.tables[name];
            append_record(&mut tables_blob, &encode_table(tm));
        }
        let tables_off = write_blob(store, &mut tables_blob);

        let mut names: Vec<&String> = self.views.keys().collect();
        names.sort();
        let mut views_blob = Vec::new();
        varint::encode(names.len() as u64, &mut views_blob);
        for name in names {
            let mut rb = RecordBuilder::new();
            rb.add(&Value::str(name)).add(&Value::str(&self.views[name]));
            append_record(&mut views_blob, &rb.build());
        }
        let views_off = write_blob(store, &mut views_blob);

        [tables_off, views_off]
    }

    pub fn read(store: &Arc<Store>, offsets: [Offset; NOFFSETS]) -> Result<Meta> {
        let mut meta = Meta::default();
        for rec in read_blob(store, offsets[0])? {
            let tm = decode_table(store, &rec)?;
            meta.tables.insert(tm.schema.table.clone(), Arc::new(tm));
        }
        for rec in read_blob(store, offsets[1])? {
            let name = rec.value(0)?;
            let def = rec.value(1)?;
            match (name.as_str(), def.as_str()) {
                (Some(n), Some(d)) => {
                    meta.views.insert(n.to_string(), d.to_string());
                }
                _ => return Err(corrupt("bad view record")),
            }
        }
        Ok(meta)
    }
}

fn append_record(blob: &mut Vec<u8>, rec: &Record) {
    varint::encode(rec.len() as u64, blob);
    blob.extend_from_slice(rec.bytes());
}

fn write_blob(store: &Store, blob: &mut Vec<u8>) -> Offset {
    blob.resize(blob.len() + cksum::LEN, 0);
    cksum::update(blob);
    let (off, buf) = store.alloc(blob.len());
    buf.copy_from_slice(blob);
    off
}

fn read_blob(store: &Store, off: Offset) -> Result<Vec<Record>> {
    let data = store.data(off);
    let (count, mut at) = varint::decode(data).ok_or_else(|| corrupt("bad meta blob"))?;
    let mut recs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, n) = varint::decode(&data[at..]).ok_or_else(|| corrupt("bad meta blob"))?;
        at += n;
        let len = len as usize;
        if at + len > data.len() {
            return Err(corrupt("meta blob overruns chunk"));
        }
        recs.push(Record::from_vec(data[at..at + len].to_vec()));
        at += len;
    }
    cksum::check(&data[..at + cksum::LEN])?;
    Ok(recs)
}

fn encode_table(tm: &TableMeta) -> Record {
    let mut rb = RecordBuilder::new();
    rb.add(&Value::str(&tm.schema.table));
    rb.add(&Value::List(
        tm.schema.columns.iter().map(Value::str).collect(),
    ));
    let indexes: Vec<Value> = tm
        .schema
        .indexes
        .iter()
        .zip(&tm.indexes)
        .map(|(ix, ov)| {
            Value::List(vec![
                Value::List(ix.columns.iter().map(Value::str).collect()),
                Value::Int(ix.mode_code()),
                Value::Int(ov.fb.root as i64),
                Value::Int(ov.fb.levels as i64),
            ])
        })
        .collect();
    rb.add(&Value::List(indexes));
    rb.add(&Value::Int(tm.info.nrows as i64));
    rb.add(&Value::Int(tm.info.size as i64));
    rb.build()
}

fn decode_table(store: &Arc<Store>, rec: &Record) -> Result<TableMeta> {
    let bad = || corrupt("bad meta table record");
    let table = rec.value(0)?.as_str().ok_or_else(bad)?.to_string();
    let columns = match rec.value(1)? {
        Value::List(cols) => cols
            .iter()
            .map(|c| c.as_str().map(str::to_string).ok_or_else(bad))
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(bad()),
    };
    let mut index_schemas = Vec::new();
    let mut overlays = Vec::new();
    match rec.value(2)? {
        Value::List(ixs) => {
            for ix in ixs {
                let Value::List(parts) = ix else { return Err(bad()) };
                let [cols, mode, root, levels] = parts.as_slice() else {
                    return Err(bad());
                };
                let Value::List(cols) = cols else { return Err(bad()) };
                let cols = cols
                    .iter()
                    .map(|c| c.as_str().map(str::to_string).ok_or_else(bad))
                    .collect::<Result<Vec<_>>>()?;
                let mode = mode.to_int().ok_or_else(bad)?;
                let root = root.to_int().ok_or_else(bad)? as u64;
                let levels = levels.to_int().ok_or_else(bad)? as usize;
                index_schemas.push(IndexSchema::from_code(cols, mode, &columns)?);
                overlays.push(Overlay::new(Fbtree::open(Arc::clone(store), root, levels)));
            }
        }
        _ => return Err(bad()),
    }
    let nrows = rec.value(3)?.to_int().ok_or_else(bad)? as usize;
    let size = rec.value(4)?.to_int().ok_or_else(bad)? as u64;
    Ok(TableMeta {
        schema: Schema {
            table,
            columns,
            indexes: index_schemas,
        },
        info: Info { nrows, size },
        indexes: overlays,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::ixkey::IndexMode;

    fn sample_schema() -> Schema {
        Schema::new(
            "inventory",
            vec!["part", "qty", "loc"],
            vec![
                IndexSchema::new(vec!["part"], IndexMode::Key),
                IndexSchema::new(vec!["loc"], IndexMode::Index),
            ],
        )
        .unwrap()
    }

    #[test]
    fn add_drop_rename() {
        let store = Arc::new(Store::heap(64 * 1024));
        let mut meta = Meta::default();
        meta.add_table(&store, sample_schema()).unwrap();
        assert!(meta.add_table(&store, sample_schema()).is_err());
        meta.rename_table("inventory", "stock").unwrap();
        assert!(meta.get("inventory").is_none());
        assert_eq!(meta.must_get("stock").unwrap().schema.columns.len(), 3);
        meta.drop_table("stock").unwrap();
        assert!(meta.drop_table("stock").is_err());
    }

    #[test]
    fn views() {
        let mut meta = Meta::default();
        meta.add_view("recent", "inventory where qty > 0").unwrap();
        assert!(meta.add_view("recent", "x").is_err());
        assert_eq!(meta.get_view("recent"), Some("inventory where qty > 0"));
        meta.drop_view("recent").unwrap();
        assert_eq!(meta.get_view("recent"), None);
    }

    #[test]
    fn persist_round_trip() {
        let store = Arc::new(Store::heap(64 * 1024));
        store.alloc(8); // keep offset 0 unused
        let mut meta = Meta::default();
        meta.add_table(&store, sample_schema()).unwrap();
        meta.add_view("v", "inventory project part").unwrap();

        let offsets = meta.write(&store);
        let back = Meta::read(&store, offsets).unwrap();
        let tm = back.must_get("inventory").unwrap();
        assert_eq!(tm.schema.columns, vec!["part", "qty", "loc"]);
        assert_eq!(tm.schema.indexes.len(), 2);
        assert_eq!(tm.schema.indexes[0].mode(), IndexMode::Key);
        assert_eq!(tm.info.nrows, 0);
        assert_eq!(back.get_view("v"), Some("inventory project part"));
    }

    #[test]
    fn corrupted_blob_is_refused() {
        let store = Arc::new(Store::heap(64 * 1024));
        store.alloc(8);
        let mut meta = Meta::default();
        meta.add_table(&store, sample_schema()).unwrap();
        let offsets = meta.write(&store);
        store.write(offsets[0] + 3, &[0x7E]);
        assert!(Meta::read(&store, offsets).is_err());
    }
}
