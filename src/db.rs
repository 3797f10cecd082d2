//! SQLite database layer for the print-farm control plane.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the shared
//! connection handle used by the store. The connection is wrapped in a
//! `Mutex`; every store call locks it for exactly one logical unit of work,
//! so units of work are never shared across tasks.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Strip an optional `sqlite://` scheme from a database URL.
///
/// `:memory:` (with or without scheme) opens an in-memory database.
pub fn database_path(url: &str) -> String {
    let trimmed = url
        .strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    trimmed.to_string()
}

/// Open the database named by `url`, apply pragmas, and run migrations.
pub fn init(url: &str) -> Result<DbState, String> {
    let path = database_path(url);

    let conn = if path == ":memory:" {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("sqlite open (memory): {e}"))?;
        configure(&conn)?;
        conn
    } else {
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| format!("Failed to create db dir: {e}"))?;
            }
        }
        info!("Opening database at {path}");
        open_and_configure(Path::new(&path))?
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(path),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// v1: users, printers, orders, jobs, job history.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE users (
             id TEXT PRIMARY KEY,
             name TEXT NOT NULL UNIQUE,
             role TEXT NOT NULL DEFAULT 'user',
             create_time TEXT NOT NULL
         );

         CREATE TABLE printers (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             url TEXT NOT NULL UNIQUE,
             api_key TEXT,
             api TEXT NOT NULL,
             active INTEGER NOT NULL DEFAULT 0,
             opcua_name TEXT,
             create_time TEXT NOT NULL
         );

         CREATE TABLE orders (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id TEXT NOT NULL REFERENCES users(id),
             printer_id INTEGER REFERENCES printers(id),
             cancelled INTEGER NOT NULL DEFAULT 0,
             create_time TEXT NOT NULL
         );

         CREATE TABLE jobs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             order_id INTEGER REFERENCES orders(id),
             user_id TEXT REFERENCES users(id),
             printer_id INTEGER REFERENCES printers(id),
             status INTEGER NOT NULL DEFAULT 1,
             from_server INTEGER NOT NULL DEFAULT 0,
             gcode_file_path TEXT,
             original_filename TEXT,
             printer_filename TEXT,
             start_time TEXT,
             create_time TEXT NOT NULL
         );

         CREATE TABLE job_history (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             job_id INTEGER NOT NULL REFERENCES jobs(id),
             status TEXT NOT NULL,
             create_time TEXT NOT NULL
         );

         CREATE INDEX idx_jobs_printer_status ON jobs(printer_id, status);
         CREATE INDEX idx_job_history_job ON job_history(job_id);

         INSERT INTO schema_version (version) VALUES (1);
         COMMIT;",
    )
    .map_err(|e| format!("migration v1: {e}"))
}

/// v2: printer grouping for multi-cell farms.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "BEGIN;
         ALTER TABLE printers ADD COLUMN group_name TEXT;
         INSERT INTO schema_version (version) VALUES (2);
         COMMIT;",
    )
    .map_err(|e| format!("migration v2: {e}"))
}

/// v3: operator-facing printer metadata mirrored into the twin.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "BEGIN;
         ALTER TABLE printers ADD COLUMN camera_url TEXT;
         ALTER TABLE printers ADD COLUMN model TEXT;
         INSERT INTO schema_version (version) VALUES (3);
         COMMIT;",
    )
    .map_err(|e| format!("migration v3: {e}"))
}

/// Build an in-memory database with the full schema, for tests.
#[cfg(test)]
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    configure(&conn).expect("pragma setup");
    run_migrations(&conn).expect("migrations");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

/// Log basic table counts, used at startup for a quick sanity line.
pub fn log_summary(db: &DbState) {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(_) => {
            warn!("database mutex poisoned, skipping summary");
            return;
        }
    };

    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .unwrap_or(0)
    };

    info!(
        printers = count("printers"),
        jobs = count("jobs"),
        orders = count("orders"),
        "database ready"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_path_strips_scheme() {
        assert_eq!(database_path("sqlite:///var/lib/farm.db"), "/var/lib/farm.db");
        assert_eq!(database_path("sqlite://farm.db"), "farm.db");
        assert_eq!(database_path(":memory:"), ":memory:");
        assert_eq!(database_path("farm.db"), "farm.db");
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("second run");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_has_expected_tables() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();

        for table in ["users", "printers", "orders", "jobs", "job_history"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
