// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;
use anyhow::Result;

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- One row per (file path, discovery mode). Never deleted; kept for audit.
    CREATE TABLE file_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        camera_id TEXT NOT NULL,
        mode TEXT NOT NULL CHECK (mode IN ('bulk-backfill', 'continuous', 'ad-hoc')),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'done', 'failed')),
        priority INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL,
        created_at_source TEXT NOT NULL CHECK (created_at_source IN ('metadata', 'filesystem')),
        discovered_at_ms INTEGER NOT NULL,
        assigned_at_ms INTEGER,
        completed_at_ms INTEGER,
        retries INTEGER NOT NULL DEFAULT 0,
        run_token TEXT,
        claimed_by TEXT,
        last_error TEXT,
        event_count INTEGER,
        UNIQUE(path, mode)
    );

    -- Continuous discovery high-water mark per camera
    CREATE TABLE camera_watermarks (
        camera_id TEXT PRIMARY KEY,
        last_seen_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    -- Packing events (immutable once written)
    CREATE TABLE packing_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_job_id INTEGER NOT NULL REFERENCES file_jobs(id),
        camera_id TEXT NOT NULL,
        source_path TEXT NOT NULL,
        start_ms INTEGER NOT NULL,
        end_ms INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL CHECK (duration_ms >= 0),
        created_at_ms INTEGER NOT NULL,
        UNIQUE(source_path, start_ms, end_ms)
    );

    -- Tracking codes seen during an event
    CREATE TABLE event_codes (
        event_id INTEGER NOT NULL REFERENCES packing_events(id),
        code TEXT NOT NULL,
        PRIMARY KEY (event_id, code)
    );

    -- Raw per-frame detections, retained only when configured
    CREATE TABLE detections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_job_id INTEGER NOT NULL REFERENCES file_jobs(id),
        frame_ms INTEGER NOT NULL,
        zone TEXT NOT NULL CHECK (zone IN ('packing', 'trigger')),
        hand_present INTEGER,
        codes TEXT,
        confidence REAL
    );

    CREATE INDEX idx_file_jobs_claim ON file_jobs(status, priority DESC, discovered_at_ms ASC);
    CREATE INDEX idx_file_jobs_path ON file_jobs(path);
    CREATE INDEX idx_file_jobs_camera ON file_jobs(camera_id);
    CREATE INDEX idx_events_camera_time ON packing_events(camera_id, start_ms);
    CREATE INDEX idx_events_time ON packing_events(start_ms);
    CREATE INDEX idx_event_codes_code ON event_codes(code);
    CREATE INDEX idx_detections_job ON detections(file_job_id, frame_ms);
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "PRAGMA user_version",
        [],
        |row| row.get(0)
    )?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade packcam.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    // Apply pending migrations one-by-one, each with its version bump
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(&format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            migration, migration_version
        ))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}
