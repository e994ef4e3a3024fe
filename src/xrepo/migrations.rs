//! Versioned schema for the shared cross-repository database
//!
//! Migrations are sequential, checksummed, and recorded in a
//! `schema_migrations` table so a changed migration is caught instead of
//! silently diverging from deployed databases.

use crate::error::{Error, Result};
use crate::db::{now_millis, row_i64, row_text};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use turso::{Connection, Value};

pub trait Migration: Send + Sync {
    /// Sequential version, starting at 1.
    fn version(&self) -> u32;

    fn name(&self) -> &str;

    /// DDL/DML applied inside this migration's transaction.
    fn up_sql(&self) -> &str;

    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_string().as_bytes());
        hasher.update(self.name().as_bytes());
        hasher.update(self.up_sql().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

struct V001InitialSchema;

impl Migration for V001InitialSchema {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "initial_schema"
    }

    fn up_sql(&self) -> &str {
        r#"
CREATE TABLE IF NOT EXISTS lsif_dumps (
    id INTEGER PRIMARY KEY,
    repository TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    root TEXT NOT NULL,
    visible_at_tip INTEGER NOT NULL DEFAULT 0,
    uploaded_at INTEGER NOT NULL,
    UNIQUE (repository, commit_hash, root)
);
CREATE INDEX IF NOT EXISTS idx_lsif_dumps_repository ON lsif_dumps (repository, commit_hash);

CREATE TABLE IF NOT EXISTS lsif_packages (
    id INTEGER PRIMARY KEY,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    dump_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lsif_packages_lookup ON lsif_packages (scheme, name, version);
CREATE INDEX IF NOT EXISTS idx_lsif_packages_dump ON lsif_packages (dump_id);

CREATE TABLE IF NOT EXISTS lsif_references (
    id INTEGER PRIMARY KEY,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    dump_id INTEGER NOT NULL,
    filter BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lsif_references_lookup ON lsif_references (scheme, name, version);
CREATE INDEX IF NOT EXISTS idx_lsif_references_dump ON lsif_references (dump_id);

CREATE TABLE IF NOT EXISTS lsif_commits (
    id INTEGER PRIMARY KEY,
    repository TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    parent_hash TEXT,
    UNIQUE (repository, commit_hash, parent_hash)
);
CREATE INDEX IF NOT EXISTS idx_lsif_commits_child ON lsif_commits (repository, commit_hash);
CREATE INDEX IF NOT EXISTS idx_lsif_commits_parent ON lsif_commits (repository, parent_hash);

CREATE TABLE IF NOT EXISTS lsif_jobs (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    run_after INTEGER NOT NULL,
    lease_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lsif_jobs_claim ON lsif_jobs (status, run_after);
"#
    }
}

fn all_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(V001InitialSchema)]
}

/// Apply every pending migration on `conn`.
pub async fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    let migrations = all_migrations();
    let mut expected: u32 = 1;
    for migration in &migrations {
        if migration.version() != expected {
            return Err(Error::Fatal(format!(
                "migrations out of order: expected version {expected}, found {}",
                migration.version()
            )));
        }
        expected += 1;
    }

    for migration in &migrations {
        let mut rows = conn
            .query(
                "SELECT checksum FROM schema_migrations WHERE version = ?",
                [Value::Integer(migration.version() as i64)],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let recorded = row_text(&row, 0)?;
            if recorded != migration.checksum() {
                return Err(Error::Fatal(format!(
                    "migration {} ({}) changed after being applied",
                    migration.version(),
                    migration.name()
                )));
            }
            debug!(version = migration.version(), "migration already applied");
            continue;
        }

        for statement in migration
            .up_sql()
            .split(';')
            .filter(|s| !s.trim().is_empty())
        {
            conn.execute(statement, ()).await?;
        }
        conn.execute(
            "INSERT INTO schema_migrations (version, name, checksum, applied_at)
             VALUES (?, ?, ?, ?)",
            [
                Value::Integer(migration.version() as i64),
                Value::Text(migration.name().to_string()),
                Value::Text(migration.checksum()),
                Value::Integer(now_millis()),
            ],
        )
        .await?;
        info!(
            version = migration.version(),
            name = migration.name(),
            "applied migration"
        );
    }
    Ok(())
}

/// Current schema version, 0 when nothing has been applied.
pub async fn current_version(conn: &Connection) -> Result<i64> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await?;
    match rows.next().await? {
        Some(row) => row_i64(&row, 0),
        None => Ok(0),
    }
}
