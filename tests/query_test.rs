//! End-to-end query tests: parse, plan, and execute against an
//! in-memory database.

use emberdb::query::{setup_query, Dir, Mode, Thread};
use emberdb::{Database, Value};

fn heap_db() -> std::sync::Arc<Database> {
    Database::heap()
}

fn ints(db: &Database, table: &str, col_count: usize, vals: &[i64]) {
    let t = db.update_tran();
    for &v in vals {
        let mut row = vec![Value::Int(v)];
        for i in 1..col_count {
            row.push(Value::Int(v * 10 + i as i64));
        }
        t.insert_row(table, &row).unwrap();
    }
    t.commit().unwrap();
}

/// Runs a read query and extracts one named integer column per row.
fn run_ints(db: &Database, query: &str, col: &str) -> Vec<i64> {
    let tran = db.read_tran();
    let mut q = setup_query(query, Mode::Read, &tran).unwrap();
    let th = Thread::new(&tran);
    let hdr = q.header();
    let mut out = Vec::new();
    while let Some(row) = q.get(&th, Dir::Next).unwrap() {
        out.push(row.get_val(&hdr, col).unwrap().to_int().unwrap());
    }
    out
}

#[test]
fn summarize_count_whole_table() {
    let db = heap_db();
    db.admin("create t (a) key(a)").unwrap();
    ints(&db, "t", 1, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(run_ints(&db, "t summarize count", "count"), vec![10]);

    // strategy check: a bare table count never reads a row
    let tran = db.read_tran();
    let q = setup_query("t summarize count", Mode::Read, &tran).unwrap();
    assert!(q.describe().contains("SUMMARIZE-TBL"), "{}", q.describe());
}

#[test]
fn summarize_min_max_via_index() {
    let db = heap_db();
    db.admin("create x (k, v) key(k) index(v)").unwrap();
    let t = db.update_tran();
    for (k, v) in [(1, 3), (2, 1), (3, 2)] {
        t.insert_row("x", &[Value::Int(k), Value::Int(v)]).unwrap();
    }
    t.commit().unwrap();

    assert_eq!(run_ints(&db, "x summarize min v", "min_v"), vec![1]);
    assert_eq!(run_ints(&db, "x summarize max v", "max_v"), vec![3]);

    let tran = db.read_tran();
    let q = setup_query("x summarize min v", Mode::Read, &tran).unwrap();
    assert!(q.describe().contains("SUMMARIZE-IDX"), "{}", q.describe());
}

#[test]
fn summarize_grouped() {
    let db = heap_db();
    db.admin("create g (id, grp, n) key(id) index(grp)").unwrap();
    let t = db.update_tran();
    for (id, grp, n) in [(1, 1, 10), (2, 1, 20), (3, 2, 5), (4, 2, 7), (5, 3, 1)] {
        t.insert_row("g", &[Value::Int(id), Value::Int(grp), Value::Int(n)])
            .unwrap();
    }
    t.commit().unwrap();
    assert_eq!(
        run_ints(&db, "g summarize grp, total n", "total_n"),
        vec![30, 12, 1]
    );
    assert_eq!(
        run_ints(&db, "g summarize grp, count", "count"),
        vec![2, 2, 1]
    );
}

#[test]
fn union_merge_random_walk() {
    // two keyed tables merged in key order; a 1000-step random walk of
    // Next/Prev must track a logical cursor over the union exactly
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let db = heap_db();
    db.admin("create one (a) key(a)").unwrap();
    db.admin("create two (a) key(a)").unwrap();
    ints(&db, "one", 1, &[1, 4, 6, 7]);
    ints(&db, "two", 1, &[2, 3, 4, 5, 8, 9]);

    let tran = db.read_tran();
    let mut q = setup_query("one union two", Mode::Read, &tran).unwrap();
    assert!(q.describe().contains("MERGE"), "{}", q.describe());
    let th = Thread::new(&tran);
    let hdr = q.header();

    let logical = [1, 2, 3, 4, 5, 6, 7, 8, 9];
    let mut cur: isize = 0; // 0 = rewound; 1..=9 positions
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..1000 {
        let dir = if rng.gen_bool(0.5) {
            cur -= 1;
            if cur < 0 {
                cur = 9;
            }
            Dir::Prev
        } else {
            cur = (cur + 1) % 10;
            Dir::Next
        };
        let row = q.get(&th, dir).unwrap();
        let got = row
            .as_ref()
            .map(|r| r.get_val(&hdr, "a").unwrap().to_int().unwrap())
            .unwrap_or(0);
        let want = if cur == 0 { 0 } else { logical[cur as usize - 1] };
        assert_eq!(got, want, "walk mismatch at cursor {}", cur);
        if row.is_none() {
            q.rewind();
        }
    }
}

#[test]
fn union_lookup_suppresses_duplicates() {
    let db = heap_db();
    db.admin("create p (a, b) key(a)").unwrap();
    db.admin("create q (a, b) key(a)").unwrap();
    let t = db.update_tran();
    t.insert_row("p", &[Value::Int(1), Value::Int(11)]).unwrap();
    t.insert_row("p", &[Value::Int(2), Value::Int(22)]).unwrap();
    t.insert_row("q", &[Value::Int(2), Value::Int(22)]).unwrap();
    t.insert_row("q", &[Value::Int(3), Value::Int(33)]).unwrap();
    t.commit().unwrap();
    let mut got = run_ints(&db, "(p where b > 0) union (q where b > 0)", "a");
    got.sort();
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn where_uses_key_range() {
    let db = heap_db();
    db.admin("create t (a, b) key(a)").unwrap();
    ints(&db, "t", 2, &[1, 2, 3, 4, 5]);
    assert_eq!(run_ints(&db, "t where a = 3", "b"), vec![31]);
    assert_eq!(run_ints(&db, "t where b = 21", "a"), vec![2]);
    assert_eq!(run_ints(&db, "t where a > 3", "a"), vec![4, 5]);
}

#[test]
fn project_rename_extend() {
    let db = heap_db();
    db.admin("create t (a, b) key(a)").unwrap();
    ints(&db, "t", 2, &[1, 2, 3]);
    assert_eq!(run_ints(&db, "t project a", "a"), vec![1, 2, 3]);
    assert_eq!(run_ints(&db, "t rename a to x", "x"), vec![1, 2, 3]);
    assert_eq!(
        run_ints(&db, "t extend c = a * 100 + 5", "c"),
        vec![105, 205, 305]
    );
    // project to a non-key column de-duplicates
    db.admin("create dup (k, v) key(k)").unwrap();
    let t = db.update_tran();
    for (k, v) in [(1, 7), (2, 7), (3, 8)] {
        t.insert_row("dup", &[Value::Int(k), Value::Int(v)]).unwrap();
    }
    t.commit().unwrap();
    let mut got = run_ints(&db, "dup project v", "v");
    got.sort();
    assert_eq!(got, vec![7, 8]);
}

#[test]
fn join_and_leftjoin() {
    let db = heap_db();
    db.admin("create c (id, name) key(id)").unwrap();
    db.admin("create o (oid, id, amt) key(oid) index(id)").unwrap();
    let t = db.update_tran();
    t.insert_row("c", &[Value::Int(1), Value::str("ann")]).unwrap();
    t.insert_row("c", &[Value::Int(2), Value::str("bob")]).unwrap();
    t.insert_row("c", &[Value::Int(3), Value::str("cy")]).unwrap();
    t.insert_row("o", &[Value::Int(100), Value::Int(1), Value::Int(5)])
        .unwrap();
    t.insert_row("o", &[Value::Int(101), Value::Int(1), Value::Int(7)])
        .unwrap();
    t.insert_row("o", &[Value::Int(102), Value::Int(2), Value::Int(9)])
        .unwrap();
    t.commit().unwrap();

    assert_eq!(run_ints(&db, "c join o", "amt"), vec![5, 7, 9]);
    // leftjoin keeps unmatched customers with an empty amt
    let tran = db.read_tran();
    let mut q = setup_query("c leftjoin o", Mode::Read, &tran).unwrap();
    let th = Thread::new(&tran);
    let hdr = q.header();
    let mut rows = 0;
    let mut empties = 0;
    while let Some(row) = q.get(&th, Dir::Next).unwrap() {
        rows += 1;
        if row.get_raw(&hdr, "amt").is_empty() {
            empties += 1;
        }
    }
    assert_eq!(rows, 4);
    assert_eq!(empties, 1);
}

#[test]
fn intersect_and_minus() {
    let db = heap_db();
    db.admin("create s1 (a) key(a)").unwrap();
    db.admin("create s2 (a) key(a)").unwrap();
    ints(&db, "s1", 1, &[1, 2, 3, 4]);
    ints(&db, "s2", 1, &[3, 4, 5]);
    assert_eq!(run_ints(&db, "s1 intersect s2", "a"), vec![3, 4]);
    assert_eq!(run_ints(&db, "s1 minus s2", "a"), vec![1, 2]);
}

#[test]
fn sort_with_tempindex() {
    let db = heap_db();
    db.admin("create t (a, b) key(a)").unwrap();
    let t = db.update_tran();
    for (a, b) in [(1, 30), (2, 10), (3, 20)] {
        t.insert_row("t", &[Value::Int(a), Value::Int(b)]).unwrap();
    }
    t.commit().unwrap();
    assert_eq!(run_ints(&db, "t sort b", "a"), vec![2, 3, 1]);
    assert_eq!(run_ints(&db, "t sort reverse b", "a"), vec![1, 3, 2]);

    let tran = db.read_tran();
    let q = setup_query("t sort b", Mode::Read, &tran).unwrap();
    assert!(q.describe().contains("TEMPINDEX"), "{}", q.describe());
}

#[test]
fn tempindex_multi_source() {
    // join rows have multiple parts, so the temp index goes through its
    // side heap; lookup and reverse reads must still work
    let db = heap_db();
    db.admin("create l (id, pad) key(id)").unwrap();
    db.admin("create r (id, v) key(id)").unwrap();
    let t = db.update_tran();
    let pad = "x".repeat(500);
    for id in 1..=20 {
        t.insert_row("l", &[Value::Int(id), Value::str(&pad)]).unwrap();
        t.insert_row("r", &[Value::Int(id), Value::Int(100 - id)]).unwrap();
    }
    t.commit().unwrap();

    let tran = db.read_tran();
    let mut q = setup_query("l join r extend s = v + 1 sort s", Mode::Read, &tran).unwrap();
    assert!(q.describe().contains("TEMPINDEX"), "{}", q.describe());
    let th = Thread::new(&tran);
    let hdr = q.header();

    // ordered by s ascending -> id descending
    let row = q.get(&th, Dir::Next).unwrap().unwrap();
    assert_eq!(row.get_val(&hdr, "id").unwrap(), Value::Int(20));
    // from eof, Prev returns the last row
    q.rewind();
    let row = q.get(&th, Dir::Prev).unwrap().unwrap();
    assert_eq!(row.get_val(&hdr, "id").unwrap(), Value::Int(1));
    // point lookup on the synthesized column: s = v + 1 = 100 - id + 1
    q.rewind();
    let key = emberdb::encoding::pack::packed(&Value::Int(94));
    let row = q.lookup(&th, &["s".to_string()], &[key]).unwrap().unwrap();
    assert_eq!(row.get_val(&hdr, "id").unwrap(), Value::Int(7));
}

#[test]
fn views_expand() {
    let db = heap_db();
    db.admin("create t (a, b) key(a)").unwrap();
    ints(&db, "t", 2, &[1, 2, 3, 4]);
    db.admin("view big = t where a > 2").unwrap();
    assert_eq!(run_ints(&db, "big", "a"), vec![3, 4]);
    assert_eq!(run_ints(&db, "big where a = 3", "b"), vec![31]);
}

#[test]
fn bad_queries_error_cleanly() {
    let db = heap_db();
    db.admin("create t (a) key(a)").unwrap();
    let tran = db.read_tran();
    assert!(setup_query("missing_table", Mode::Read, &tran).is_err());
    assert!(setup_query("t project zzz", Mode::Read, &tran).is_err());
    assert!(setup_query("t where", Mode::Read, &tran).is_err());
    assert!(setup_query("t summarize", Mode::Read, &tran).is_err());
}
