//! Crash recovery: torn tails are truncated back to the last state
//! root that passes full validation.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use emberdb::query::{setup_query, Dir, Mode, Thread};
use emberdb::{repair, Database, Value};

fn row_count(db: &Database, table: &str) -> i64 {
    let tran = db.read_tran();
    let mut q = setup_query(&format!("{} summarize count", table), Mode::Read, &tran).unwrap();
    let th = Thread::new(&tran);
    let hdr = q.header();
    let row = q.get(&th, Dir::Next).unwrap().unwrap();
    row.get_val(&hdr, "count").unwrap().to_int().unwrap()
}

#[test]
fn repair_recovers_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.edb");

    // two persisted states: 10 rows, then 20
    {
        let db = Database::create(&path).unwrap();
        db.admin("create t (k) key(k)").unwrap();
        let t = db.update_tran();
        for i in 0..10 {
            t.insert_row("t", &[Value::Int(i)]).unwrap();
        }
        t.commit().unwrap();
        db.persist().unwrap();
        let t = db.update_tran();
        for i in 10..20 {
            t.insert_row("t", &[Value::Int(i)]).unwrap();
        }
        t.commit().unwrap();
        db.close().unwrap();
    }

    // tear the tail: zero the last 40 bytes, destroying the final state
    let size = std::fs::metadata(&path).unwrap().len();
    {
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(size - 40)).unwrap();
        f.write_all(&[0u8; 40]).unwrap();
        f.flush().unwrap();
    }

    // opening now fails; repair finds the 10-row state
    assert!(Database::open(&path).is_err());
    let recovered = repair::repair(&path).unwrap();
    assert!(recovered < size);

    // the original is preserved as .bak
    let bak = path.with_extension("bak");
    assert_eq!(std::fs::metadata(&bak).unwrap().len(), size);

    let db = Database::open(&path).unwrap();
    assert_eq!(row_count(&db, "t"), 10);
    db.close().unwrap();
}

#[test]
fn repair_is_noop_safe_on_clean_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.edb");
    {
        let db = Database::create(&path).unwrap();
        db.admin("create t (k) key(k)").unwrap();
        let t = db.update_tran();
        t.insert_row("t", &[Value::Int(1)]).unwrap();
        t.commit().unwrap();
        db.close().unwrap();
    }
    repair::repair(&path).unwrap();
    let db = Database::open(&path).unwrap();
    assert_eq!(row_count(&db, "t"), 1);
    db.close().unwrap();
}

#[test]
fn compact_preserves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fat.edb");
    {
        let db = Database::create(&path).unwrap();
        db.admin("create t (k, v) key(k)").unwrap();
        // churn: repeated persists leave superseded tree nodes behind
        for round in 0..5 {
            let t = db.update_tran();
            for i in 0..40 {
                t.insert_row("t", &[Value::Int(round * 40 + i), Value::Int(i)])
                    .unwrap();
            }
            t.commit().unwrap();
            db.persist().unwrap();
        }
        db.close().unwrap();
    }
    let (old_size, new_size) = emberdb::compact(&path).unwrap();
    assert!(new_size <= old_size);
    let db = Database::open(&path).unwrap();
    assert_eq!(row_count(&db, "t"), 200);
    db.close().unwrap();
}
