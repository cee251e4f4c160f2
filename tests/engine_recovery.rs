// Durability, atomicity, encryption-at-rest, and index behavior across restarts.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use vaultdb::api::{
    Assignment, Column, ColumnType, Database, DatabaseOptions, Durability, ErrorKind, Predicate,
    Projection, Row, Schema, Value,
};

fn users() -> Schema {
    Schema::new(
        "users",
        vec![
            Column::new("id", ColumnType::Int).primary_key(),
            Column::new("password", ColumnType::Text).encrypted(),
        ],
    )
    .expect("schema")
}

fn open(dir: &Path) -> Database {
    Database::open(dir).expect("open")
}

fn rows(db: &Database, table: &str, predicate: &Predicate) -> Vec<Row> {
    db.scan(table, predicate, Projection::All)
        .expect("scan")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
}

fn ids(db: &Database, table: &str, predicate: &Predicate) -> Vec<i64> {
    rows(db, table, predicate)
        .iter()
        .map(|row| match row.values()[0] {
            Value::Int(id) => id,
            ref other => panic!("unexpected id {other:?}"),
        })
        .collect()
}

fn user(id: i64, password: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::from(password)]
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn encrypted_values_never_reach_disk_in_plaintext() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = open(temp.path());
    db.create_table(users()).expect("create");
    db.insert("users", user(1, "secret123")).expect("insert");

    // Before any checkpoint the row lives only in the log.
    let wal = std::fs::read(temp.path().join("wal.log")).expect("wal");
    assert!(!contains(&wal, b"secret123"));
    db.close().expect("close");

    let table = std::fs::read(temp.path().join("tables").join("users.tbl")).expect("tbl");
    assert!(!contains(&table, b"secret123"));

    let db = open(temp.path());
    let found = rows(&db, "users", &Predicate::eq("id", 1));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("password"), Some(&Value::from("secret123")));
}

#[test]
fn deletes_survive_a_crash() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        for id in 1..=3 {
            db.insert("users", user(id, "pw")).expect("insert");
        }
        assert_eq!(db.delete("users", &Predicate::eq("id", 2)).expect("delete"), 1);
        // Dropped without close: no checkpoint runs.
    }
    let db = open(temp.path());
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1, 3]);
    let report = db.recovery_report();
    assert!(report.is_clean());
    assert!(report.rows_redone >= 4);
}

#[test]
fn uncommitted_transactions_vanish_and_their_rids_stay_burned() {
    let temp = tempfile::tempdir().expect("tempdir");
    let txn;
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "kept")).expect("insert");
        txn = db.begin().expect("begin");
        db.insert("users", user(2, "lost")).expect("insert");
        db.insert("users", user(3, "lost")).expect("insert");
    }
    let db = open(temp.path());
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1]);
    assert_eq!(db.recovery_report().rolled_back, vec![txn]);

    let rid = db.insert("users", user(2, "again")).expect("insert");
    assert_eq!(rid, 4);
    drop(db);

    // The ABORT written during recovery keeps the next open clean.
    let db = open(temp.path());
    assert!(db.recovery_report().rolled_back.is_empty());
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1, 2]);
}

#[test]
fn committed_transactions_apply_all_or_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.begin().expect("begin");
        for id in 1..=3 {
            db.insert("users", user(id, "pw")).expect("insert");
        }
        db.update(
            "users",
            &Predicate::eq("id", 3),
            &[Assignment::new("password", "changed")],
        )
        .expect("update");
        db.commit().expect("commit");
    }
    let db = open(temp.path());
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1, 2, 3]);
    let third = rows(&db, "users", &Predicate::eq("id", 3));
    assert_eq!(third[0].get("password"), Some(&Value::from("changed")));
}

#[test]
fn rollback_restores_prior_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = open(temp.path());
    db.create_table(users()).expect("create");
    db.insert("users", user(1, "one")).expect("insert");

    db.begin().expect("begin");
    db.update("users", &Predicate::All, &[Assignment::new("password", "x")])
        .expect("update");
    db.insert("users", user(2, "two")).expect("insert");
    db.rollback().expect("rollback");

    let all = rows(&db, "users", &Predicate::All);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get("password"), Some(&Value::from("one")));
    assert!(db.verify().is_ok());
}

#[test]
fn damaged_log_tail_is_truncated_and_reported() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "a")).expect("insert");
        db.insert("users", user(2, "b")).expect("insert");
    }
    let wal_path = temp.path().join("wal.log");
    let intact_len = std::fs::metadata(&wal_path).expect("meta").len();
    {
        let mut file = OpenOptions::new().append(true).open(&wal_path).expect("wal");
        file.write_all(&[0xAB; 11]).expect("garbage");
    }

    let db = open(temp.path());
    let report = db.recovery_report();
    assert!(report.damage.is_some());
    assert_eq!(report.truncated_to, Some(intact_len));
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1, 2]);
}

#[test]
fn damage_inside_a_commit_record_discards_that_transaction() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "a")).expect("insert");
        db.insert("users", user(2, "b")).expect("insert");
    }
    // The last record in the log is the COMMIT of the second insert.
    let wal_path = temp.path().join("wal.log");
    let mut bytes = std::fs::read(&wal_path).expect("wal");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&wal_path, &bytes).expect("rewrite");

    let db = open(temp.path());
    assert!(db.recovery_report().damage.is_some());
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1]);
}

#[test]
fn missing_keystore_with_encrypted_rows_refuses_to_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "secret")).expect("insert");
        db.close().expect("close");
    }
    std::fs::remove_file(temp.path().join("keystore.json")).expect("remove keystore");
    let err = Database::open(temp.path()).expect_err("key unavailable");
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
}

#[test]
fn wrong_key_fails_integrity_only_for_encrypted_columns() {
    let temp = tempfile::tempdir().expect("tempdir");
    let other = tempfile::tempdir().expect("other");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "secret")).expect("insert");
        db.close().expect("close");
    }
    open(other.path()).close().expect("close other");
    std::fs::copy(
        other.path().join("keystore.json"),
        temp.path().join("keystore.json"),
    )
    .expect("swap keystore");

    let db = open(temp.path());
    let err = db
        .scan("users", &Predicate::All, Projection::All)
        .expect("scan")
        .next()
        .expect("one row")
        .expect_err("wrong key");
    assert_eq!(err.kind(), ErrorKind::Integrity);

    let ids_only = db
        .scan("users", &Predicate::All, Projection::columns(["id"]))
        .expect("scan")
        .collect::<Result<Vec<_>, _>>()
        .expect("plain columns decode");
    assert_eq!(ids_only.len(), 1);
    assert!(!db.verify().is_ok());
}

#[test]
fn uniqueness_holds_across_restarts() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "a")).expect("insert");
    }
    let db = open(temp.path());
    let err = db.insert("users", user(1, "b")).expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(ids(&db, "users", &Predicate::All), vec![1]);
}

#[test]
fn checkpoint_then_crash_keeps_everything() {
    let temp = tempfile::tempdir().expect("tempdir");
    let options = DatabaseOptions::new()
        .with_durability(Durability::Buffered)
        .with_checkpoint_after(None);
    {
        let db = Database::open_with(temp.path(), options.clone()).expect("open");
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "a")).expect("insert");
        db.insert("users", user(2, "b")).expect("insert");
        db.checkpoint().expect("checkpoint");
        assert!(db.wal_scan().expect("wal").records.is_empty());
        db.insert("users", user(3, "c")).expect("insert");
        db.delete("users", &Predicate::eq("id", 1)).expect("delete");
    }
    let db = Database::open_with(temp.path(), options).expect("reopen");
    assert_eq!(ids(&db, "users", &Predicate::All), vec![2, 3]);
    let stats = db.table_stats("users").expect("stats");
    assert_eq!(stats.live_rows, 2);
    assert_eq!(stats.tombstones, 1);
    assert_eq!(stats.next_rid, 4);
}

#[test]
fn index_range_scans_match_a_full_filter() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = Database::open_with(
        temp.path(),
        DatabaseOptions::new()
            .with_durability(Durability::Buffered)
            .with_btree_order(4),
    )
    .expect("open");
    let schema = Schema::new(
        "events",
        vec![
            Column::new("id", ColumnType::Int).primary_key(),
            Column::new("score", ColumnType::Int).indexed(),
            Column::new("note", ColumnType::Text),
        ],
    )
    .expect("schema");
    db.create_table(schema).expect("create");

    let mut state = 7u64;
    let mut scores = Vec::new();
    db.begin().expect("begin");
    for id in 0..300i64 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let score = ((state >> 33) % 100) as i64;
        scores.push((id, score));
        db.insert(
            "events",
            vec![Value::Int(id), Value::Int(score), Value::from("n")],
        )
        .expect("insert");
    }
    db.commit().expect("commit");
    db.delete("events", &Predicate::lt("id", 50)).expect("delete");

    let expect = |keep: &dyn Fn(i64) -> bool| -> Vec<i64> {
        scores
            .iter()
            .filter(|(id, score)| *id >= 50 && keep(*score))
            .map(|(id, _)| *id)
            .collect()
    };
    assert_eq!(
        ids(&db, "events", &Predicate::between("score", 20, 40)),
        expect(&|score| (20..=40).contains(&score))
    );
    assert_eq!(
        ids(&db, "events", &Predicate::ge("score", 90)),
        expect(&|score| score >= 90)
    );
    assert_eq!(
        ids(&db, "events", &Predicate::eq("score", 13)),
        expect(&|score| score == 13)
    );
    assert_eq!(
        ids(
            &db,
            "events",
            &Predicate::lt("score", 10).or(Predicate::gt("score", 95))
        ),
        expect(&|score| !(10..=95).contains(&score))
    );
    assert!(db.verify().is_ok());
    let stats = db.table_stats("events").expect("stats");
    assert!(stats.indexes.iter().all(|index| index.height >= 2));
}

#[test]
fn dropped_tables_do_not_come_back() {
    let temp = tempfile::tempdir().expect("tempdir");
    {
        let db = open(temp.path());
        db.create_table(users()).expect("create");
        db.insert("users", user(1, "a")).expect("insert");
        db.drop_table("users").expect("drop");
    }
    let db = open(temp.path());
    assert!(db.table_names().is_empty());
    db.create_table(users()).expect("recreate");
    assert!(ids(&db, "users", &Predicate::All).is_empty());
}
