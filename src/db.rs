//! Small helpers over the embedded database driver
//!
//! Keeps the row/value plumbing in one place so store code reads as SQL
//! plus domain logic.

use crate::error::{Error, Result};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use turso::{Builder, Connection, Database, Row, Value};

/// Open (creating if needed) an embedded database file.
pub async fn open_database(path: &Path) -> Result<Database> {
    let path = path.to_string_lossy();
    let database = Builder::new_local(path.as_ref()).build().await?;
    Ok(database)
}

/// Run `f` inside a transaction on `conn`, rolling back on error.
pub async fn with_transaction<F, Fut, T>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    conn.execute("BEGIN TRANSACTION", ()).await?;
    match f().await {
        Ok(value) => {
            conn.execute("COMMIT", ()).await?;
            Ok(value)
        }
        Err(err) => {
            // Surface the original error even if the rollback also fails.
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(err)
        }
    }
}

pub fn row_i64(row: &Row, idx: usize) -> Result<i64> {
    match row.get_value(idx)? {
        Value::Integer(n) => Ok(n),
        other => Err(Error::Fatal(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

pub fn row_text(row: &Row, idx: usize) -> Result<String> {
    match row.get_value(idx)? {
        Value::Text(s) => Ok(s),
        other => Err(Error::Fatal(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

pub fn row_blob(row: &Row, idx: usize) -> Result<Vec<u8>> {
    match row.get_value(idx)? {
        Value::Blob(b) => Ok(b),
        other => Err(Error::Fatal(format!(
            "expected blob in column {idx}, found {other:?}"
        ))),
    }
}

pub fn row_opt_text(row: &Row, idx: usize) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(Error::Fatal(format!(
            "expected text or null in column {idx}, found {other:?}"
        ))),
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used in every
/// table of this crate.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
