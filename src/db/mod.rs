pub mod models;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use thiserror::Error;

use crate::state::DbPool;

pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_initial",
        include_str!("../../migrations/001_initial.sql"),
    ),
    (
        "002_feedback",
        include_str!("../../migrations/002_feedback.sql"),
    ),
];

/// Errors shared by every SQLite-backed repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] r2d2::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;

    Ok(pool)
}

/// Apply pending migrations in order. Each one commits together with its
/// `schema_version` row, so a failed migration leaves nothing behind.
pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let mut applied = 0;
    for (name, sql) in MIGRATIONS {
        let known: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM schema_version WHERE name = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if known {
            continue;
        }

        tracing::info!(migration = name, "Applying migration");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_version (name) VALUES (?1)", params![name])?;
        tx.commit()?;
        applied += 1;
    }

    tracing::info!(applied, total = MIGRATIONS.len(), "Database schema up to date");
    Ok(())
}

/// Runs `f` inside `BEGIN IMMEDIATE`, committing on success and rolling back on error.
pub(crate) fn immediate_transaction<T, F>(
    conn: &rusqlite::Connection,
    f: F,
) -> Result<T, RepositoryError>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T, RepositoryError>,
{
    conn.execute("BEGIN IMMEDIATE", [])?;
    match f(conn) {
        Ok(value) => {
            conn.execute("COMMIT", [])?;
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", [])?;
            Err(e)
        }
    }
}

/// Pool over a fresh migrated database inside `dir`
#[cfg(test)]
pub(crate) fn test_pool(dir: &tempfile::TempDir) -> DbPool {
    let pool = create_pool(&dir.path().join("test.db")).unwrap();
    run_migrations(&pool).unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_pool_creates_db_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("sub/dir/test.db");
        let pool = create_pool(&db_path).unwrap();
        assert!(db_path.exists());
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn migrations_run_successfully() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(&tmp);
        let conn = pool.get().unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        for table in [
            "users",
            "tickets",
            "ticket_messages",
            "rate_limits",
            "feedback",
            "notification_rate_limits",
            "action_log",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(&tmp);
        run_migrations(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn foreign_keys_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(&tmp);
        let conn = pool.get().unwrap();

        let result = conn.execute(
            "INSERT INTO tickets (user_id, email, created_at) VALUES (?1, ?2, datetime('now'))",
            params![999, "ghost@example.com"],
        );
        assert!(result.is_err());
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(&tmp);
        let conn = pool.get().unwrap();

        let result: Result<(), RepositoryError> = immediate_transaction(&conn, |conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, created_at, last_activity)
                 VALUES (1, 'a', datetime('now'), datetime('now'))",
                [],
            )?;
            Err(RepositoryError::Conflict("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
