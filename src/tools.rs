//! Dump and load: portable per-table record streams, used for backups
//! and for moving data between databases. The format is line-oriented
//! headers plus length-prefixed raw records:
//!
//! ```text
//! ====== create <table> (<cols>) key(...) index(...)
//! <u32 len><record bytes> ...
//! <u32 0>
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::info;

use crate::database::Database;
use crate::encoding::ixkey::IndexMode;
use crate::errors::corrupt;
use crate::index::OverlayIter;
use crate::record::Record;

/// Writes `table` (or every table when None) to `out_path`. Returns the
/// number of records dumped.
pub fn dump(db: &Arc<Database>, out_path: impl AsRef<Path>, table: Option<&str>) -> Result<usize> {
    let out = File::create(out_path.as_ref()).wrap_err("cannot create dump file")?;
    let mut w = BufWriter::new(out);
    let st = db.get_state();
    let mut names: Vec<&String> = st.meta.tables.keys().collect();
    names.sort();
    let mut total = 0;
    for name in names {
        if let Some(only) = table {
            if name != only {
                continue;
            }
        }
        total += dump_table(db, &mut w, name)?;
    }
    w.flush()?;
    info!(records = total, "dump complete");
    Ok(total)
}

fn dump_table(db: &Arc<Database>, w: &mut impl Write, table: &str) -> Result<usize> {
    let st = db.get_state();
    let tm = st.meta.must_get(table)?;
    writeln!(w, "====== {}", schema_text(&tm.schema))?;
    let mut n = 0;
    let mut iter = OverlayIter::new(tm.indexes[0].clone(), None);
    while let Some((_key, off)) = iter.next()? {
        let rec = Record::read_ck(&db.store, off)?;
        w.write_all(&(rec.len() as u32).to_be_bytes())?;
        w.write_all(rec.bytes())?;
        n += 1;
    }
    w.write_all(&0u32.to_be_bytes())?;
    Ok(n)
}

fn schema_text(schema: &crate::meta::Schema) -> String {
    let mut s = format!("create {} ({})", schema.table, schema.columns.join(", "));
    for ix in &schema.indexes {
        let kind = match ix.mode() {
            IndexMode::Key => "key",
            IndexMode::Index => "index",
            IndexMode::Unique => "index unique",
        };
        s.push_str(&format!(" {}({})", kind, ix.columns.join(",")));
    }
    s
}

/// Loads tables from a dump file into `db`. Returns the number of
/// records loaded.
pub fn load(db: &Arc<Database>, in_path: impl AsRef<Path>, table: Option<&str>) -> Result<usize> {
    let input = File::open(in_path.as_ref()).wrap_err("cannot open dump file")?;
    let mut r = BufReader::new(input);
    let mut total = 0;
    loop {
        let mut line = String::new();
        {
            use std::io::BufRead;
            if r.read_line(&mut line)? == 0 {
                break;
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = line
            .strip_prefix("====== ")
            .ok_or_else(|| corrupt("bad dump header line"))?;
        let name = request
            .strip_prefix("create ")
            .and_then(|s| s.split_whitespace().next())
            .ok_or_else(|| corrupt("bad dump schema"))?
            .to_string();
        let wanted = table.map_or(true, |t| t == name);
        if wanted {
            db.admin(&request.replacen("create", "ensure", 1))?;
        }
        total += load_records(db, &mut r, &name, wanted)?;
    }
    info!(records = total, "load complete");
    Ok(total)
}

fn load_records(
    db: &Arc<Database>,
    r: &mut impl Read,
    table: &str,
    wanted: bool,
) -> Result<usize> {
    let tran = db.update_tran();
    let mut n = 0;
    loop {
        let mut len4 = [0u8; 4];
        r.read_exact(&mut len4)?;
        let len = u32::from_be_bytes(len4) as usize;
        if len == 0 {
            break;
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        if wanted {
            tran.insert_record(table, &Record::from_vec(buf))?;
            n += 1;
        }
    }
    if wanted {
        tran.commit()?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn dump_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::heap();
        db.admin("create t (a, b) key(a)").unwrap();
        let t = db.update_tran();
        for i in 0..10 {
            t.insert_row("t", &[Value::Int(i), Value::str(format!("row{}", i))])
                .unwrap();
        }
        t.commit().unwrap();

        let path = dir.path().join("t.dump");
        assert_eq!(dump(&db, &path, None).unwrap(), 10);

        let db2 = Database::heap();
        assert_eq!(load(&db2, &path, None).unwrap(), 10);
        let st = db2.get_state();
        assert_eq!(st.meta.must_get("t").unwrap().info.nrows, 10);
    }
}
