// JSON snapshots of the conversational state
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::state::DbPool;

const TABLES: [&str; 4] = ["users", "tickets", "ticket_messages", "feedback"];
const PREFIX: &str = "backup_";
const SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write a snapshot into `dir` and prune all but the newest `keep` files
pub fn write_snapshot(
    pool: &DbPool,
    dir: &Path,
    now: DateTime<Utc>,
    keep: usize,
) -> Result<PathBuf, BackupError> {
    let conn = pool.get()?;

    let mut tables = Map::new();
    for table in TABLES {
        tables.insert(table.to_string(), Value::Array(dump_table(&conn, table)?));
    }
    let snapshot = serde_json::json!({
        "created_at": now,
        "tables": tables,
    });

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{PREFIX}{}{SUFFIX}", now.format("%Y%m%d_%H%M%S")));
    std::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)?;
    tracing::info!(path = %path.display(), "Backup written");

    prune(dir, keep)?;
    Ok(path)
}

fn dump_table(conn: &rusqlite::Connection, table: &str) -> Result<Vec<Value>, BackupError> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} ORDER BY rowid"))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let rows = stmt.query_map([], |row| {
        let mut object = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(n) => Value::from(n),
                ValueRef::Real(f) => Value::from(f),
                ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => Value::from(b.to_vec()),
            };
            object.insert(name.clone(), value);
        }
        Ok(Value::Object(object))
    })?;

    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Snapshot files in `dir`, oldest first
pub fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>, BackupError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(SUFFIX))
        })
        .collect();
    // Timestamped names sort chronologically
    files.sort();
    Ok(files)
}

fn prune(dir: &Path, keep: usize) -> Result<(), BackupError> {
    let files = list_snapshots(dir)?;
    let excess = files.len().saturating_sub(keep);
    for path in &files[..excess] {
        std::fs::remove_file(path)?;
        tracing::debug!(path = %path.display(), "Old backup removed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn snapshot_contains_rows_of_every_table() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO users (id, display_name, created_at, last_activity)
                 VALUES (42, 'Аня', '2025-07-12T12:00:00Z', '2025-07-12T12:00:00Z')",
                [],
            )
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 7, 12, 12, 0, 0).unwrap();
        let path = write_snapshot(&pool, &tmp.path().join("backups"), now, 10).unwrap();
        assert!(path.ends_with("backup_20250712_120000.json"));

        let snapshot: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let users = snapshot["tables"]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["id"], 42);
        assert_eq!(users[0]["display_name"], "Аня");
        for table in TABLES {
            assert!(snapshot["tables"][table].is_array(), "{table}");
        }
    }

    #[test]
    fn only_newest_snapshots_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(&tmp);
        let dir = tmp.path().join("backups");
        let start = Utc.with_ymd_and_hms(2025, 7, 12, 0, 0, 0).unwrap();

        for day in 0..5 {
            write_snapshot(&pool, &dir, start + Duration::days(day), 3).unwrap();
        }

        let left = list_snapshots(&dir).unwrap();
        assert_eq!(left.len(), 3);
        assert!(left[0].ends_with("backup_20250714_000000.json"));
    }
}
