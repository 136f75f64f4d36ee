// Database module

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

use crate::constants::{APP_NAME, DB_BUSY_TIMEOUT_MS, DB_FILENAME};

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    configure_connection(&conn)?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Per-connection settings. Every worker opens its own connection.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode so readers never block the single writer
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Wait on a locked database instead of failing straight away
    conn.busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))?;

    Ok(())
}

/// Open a connection to an existing, already-migrated database.
pub fn open_worker_connection(db_path: &Path) -> crate::error::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Default database location in the platform data directory
pub fn get_default_db_path() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join(DB_FILENAME))
        .unwrap_or_else(|| PathBuf::from(DB_FILENAME))
}
