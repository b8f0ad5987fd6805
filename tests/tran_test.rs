//! Transaction semantics: snapshot isolation, conflict detection, and
//! the merge/persist/reopen cycle against real files.

use emberdb::errors::is_conflict;
use emberdb::query::{setup_query, Dir, Mode, Thread};
use emberdb::{Database, Value};

fn count(db: &Database, table: &str) -> i64 {
    let tran = db.read_tran();
    let mut q = setup_query(&format!("{} summarize count", table), Mode::Read, &tran).unwrap();
    let th = Thread::new(&tran);
    let hdr = q.header();
    let row = q.get(&th, Dir::Next).unwrap().unwrap();
    row.get_val(&hdr, "count").unwrap().to_int().unwrap()
}

#[test]
fn readers_see_their_snapshot() {
    let db = Database::heap();
    db.admin("create t (k, v) key(k)").unwrap();
    let t = db.update_tran();
    t.insert_row("t", &[Value::Int(1), Value::Int(10)]).unwrap();
    t.commit().unwrap();

    let reader = db.read_tran(); // snapshot before the second insert
    let writer = db.update_tran();
    writer
        .insert_row("t", &[Value::Int(2), Value::Int(20)])
        .unwrap();
    writer.commit().unwrap();

    // the old snapshot still sees one row; a fresh one sees two
    let th = Thread::new(&reader);
    let mut q = setup_query("t summarize count", Mode::Read, &reader).unwrap();
    let hdr = q.header();
    let row = q.get(&th, Dir::Next).unwrap().unwrap();
    assert_eq!(row.get_val(&hdr, "count").unwrap(), Value::Int(1));
    drop(q);
    drop(th);
    drop(reader);
    assert_eq!(count(&db, "t"), 2);
}

#[test]
fn update_tran_sees_own_writes() {
    let db = Database::heap();
    db.admin("create t (k) key(k)").unwrap();
    let t = db.update_tran();
    t.insert_row("t", &[Value::Int(1)]).unwrap();
    let th = Thread::new(&t);
    let mut q = setup_query("t", Mode::Update, &t).unwrap();
    let hdr = q.header();
    let row = q.get(&th, Dir::Next).unwrap().unwrap();
    assert_eq!(row.get_val(&hdr, "k").unwrap(), Value::Int(1));
    drop(q);
    drop(th);
    t.abort();
    assert_eq!(count(&db, "t"), 0); // abort left nothing
}

#[test]
fn duplicate_key_rejected() {
    let db = Database::heap();
    db.admin("create t (k, v) key(k)").unwrap();
    let t = db.update_tran();
    t.insert_row("t", &[Value::Int(1), Value::Int(10)]).unwrap();
    assert!(t.insert_row("t", &[Value::Int(1), Value::Int(11)]).is_err());
}

#[test]
fn conflicting_commit_aborts() {
    // two transactions both read k=1 then write the same unique key:
    // the first commits, the second gets Conflict and changes nothing
    let db = Database::heap();
    db.admin("create t (k, v) key(k)").unwrap();
    let seed = db.update_tran();
    seed.insert_row("t", &[Value::Int(1), Value::Int(0)]).unwrap();
    seed.commit().unwrap();

    let t1 = db.update_tran();
    let t2 = db.update_tran();

    let read_k1 = |tran: &emberdb::UpdateTran| {
        let th = Thread::new(tran);
        let mut q = setup_query("t where k = 1", Mode::Update, tran).unwrap();
        assert!(q.get(&th, Dir::Next).unwrap().is_some());
    };
    read_k1(&t1);
    read_k1(&t2);

    t1.insert_row("t", &[Value::Int(9), Value::Int(1)]).unwrap();
    t2.insert_row("t", &[Value::Int(9), Value::Int(2)]).unwrap();

    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert!(is_conflict(&err), "expected conflict, got {err}");

    assert_eq!(count(&db, "t"), 2); // seed row + t1's insert only
}

#[test]
fn read_write_conflict_on_range() {
    let db = Database::heap();
    db.admin("create t (k, v) key(k)").unwrap();
    let seed = db.update_tran();
    for k in [1, 5, 9] {
        seed.insert_row("t", &[Value::Int(k), Value::Int(0)]).unwrap();
    }
    seed.commit().unwrap();

    // t1 reads the whole table, t2 inserts into it, t2 commits first:
    // t1's write then fails validation against t2's write in its read range
    let t1 = db.update_tran();
    let t2 = db.update_tran();
    {
        let th = Thread::new(&t1);
        let mut q = setup_query("t", Mode::Update, &t1).unwrap();
        while q.get(&th, Dir::Next).unwrap().is_some() {}
    }
    t1.insert_row("t", &[Value::Int(2), Value::Int(1)]).unwrap();
    t2.insert_row("t", &[Value::Int(7), Value::Int(2)]).unwrap();
    t2.commit().unwrap();
    let err = t1.commit().unwrap_err();
    assert!(is_conflict(&err), "expected conflict, got {err}");
}

#[test]
fn non_overlapping_commits_both_succeed() {
    let db = Database::heap();
    db.admin("create t (k) key(k)").unwrap();
    let t1 = db.update_tran();
    let t2 = db.update_tran();
    t1.insert_row("t", &[Value::Int(1)]).unwrap();
    t2.insert_row("t", &[Value::Int(2)]).unwrap();
    t1.commit().unwrap();
    t2.commit().unwrap();
    assert_eq!(count(&db, "t"), 2);
}

#[test]
fn delete_and_update_records() {
    let db = Database::heap();
    db.admin("create t (k, v) key(k)").unwrap();
    let t = db.update_tran();
    let off1 = t.insert_row("t", &[Value::Int(1), Value::Int(10)]).unwrap();
    t.insert_row("t", &[Value::Int(2), Value::Int(20)]).unwrap();
    t.commit().unwrap();

    let t = db.update_tran();
    t.delete_record("t", off1).unwrap();
    t.commit().unwrap();
    assert_eq!(count(&db, "t"), 1);

    // the deleted key can be reused
    let t = db.update_tran();
    t.insert_row("t", &[Value::Int(1), Value::Int(11)]).unwrap();
    t.commit().unwrap();
    assert_eq!(count(&db, "t"), 2);
}

#[test]
fn merge_and_persist_keep_data_visible() {
    let db = Database::heap();
    db.admin("create t (k) key(k)").unwrap();
    for batch in 0..5 {
        let t = db.update_tran();
        for i in 0..20 {
            t.insert_row("t", &[Value::Int(batch * 20 + i)]).unwrap();
        }
        t.commit().unwrap();
    }
    assert_eq!(count(&db, "t"), 100);
    db.merge();
    assert_eq!(count(&db, "t"), 100);
    db.persist().unwrap();
    assert_eq!(count(&db, "t"), 100);
    // after persist the overlay is flat again
    let st = db.get_state();
    assert!(st.meta.must_get("t").unwrap().indexes[0].layers.is_empty());
}

#[test]
fn create_close_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.edb");
    {
        let db = Database::create(&path).unwrap();
        db.admin("create t (k, v) key(k) index(v)").unwrap();
        let t = db.update_tran();
        for i in 0..50 {
            t.insert_row("t", &[Value::Int(i), Value::Int(1000 - i)]).unwrap();
        }
        t.commit().unwrap();
        db.close().unwrap();
    }
    {
        let db = Database::open(&path).unwrap();
        assert_eq!(count(&db, "t"), 50);
        // secondary index survived: min via index reads one row
        let tran = db.read_tran();
        let mut q = setup_query("t summarize min v", Mode::Read, &tran).unwrap();
        let th = Thread::new(&tran);
        let hdr = q.header();
        let row = q.get(&th, Dir::Next).unwrap().unwrap();
        assert_eq!(row.get_val(&hdr, "min_v").unwrap(), Value::Int(951));
        drop(q);
        drop(th);
        drop(tran);
        db.close().unwrap();
    }
}

#[test]
fn concurrent_commits_are_serializable() {
    use std::sync::Arc;
    let db = Database::heap();
    db.admin("create t (k) key(k)").unwrap();
    let mut handles = Vec::new();
    for thread in 0..4 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let mut committed = 0;
            for i in 0..50 {
                let t = db.update_tran();
                let k = thread * 1000 + i;
                t.insert_row("t", &[Value::Int(k)]).unwrap();
                if t.commit().is_ok() {
                    committed += 1;
                }
            }
            committed
        }));
    }
    let total: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 200); // disjoint keys: no conflicts
    assert_eq!(count(&db, "t"), 200);
}
