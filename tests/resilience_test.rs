mod helpers;

use recollect::db;
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("new.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path).unwrap();
    assert!(db_path.exists());
    assert_eq!(helpers::count(&conn, "SELECT COUNT(*) FROM conversation_turns"), 0);
}

#[test]
fn health_check_counts_queue_states() {
    let mut conn = helpers::test_db();
    let scope = helpers::scope("p1");
    helpers::record(&mut conn, &scope, "hello", helpers::t0());
    helpers::record(&mut conn, &scope, "again", helpers::t0() + helpers::secs(1));
    conn.execute(
        "UPDATE pending_memory_writes SET status = 'exhausted' WHERE text = 'again'",
        [],
    )
    .unwrap();

    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert!(!report.sqlite_vec_version.is_empty());
    assert_eq!(report.turn_count, 2);
    assert_eq!(report.pending_count, 1);
    assert_eq!(report.exhausted_count, 1);
    assert_eq!(report.memory_count, 0);
}

#[test]
fn file_db_uses_wal_and_busy_timeout() {
    let (_dir, path) = helpers::file_db();
    let conn = db::open_database(&path).unwrap();

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);

    let mode: String = conn
        .pragma_query_value(None, "journal_mode", |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}
