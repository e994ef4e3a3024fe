//! One embedded relational file per dump
//!
//! The writer side exists only for the importer: it creates the schema and
//! lands the entire dump in a single transaction. After the file is renamed
//! into place it is only ever opened read-only through [`DumpStore`], and
//! all such opens go through the connection cache.

use crate::db::{open_database, row_blob, row_i64, row_text, with_transaction};
use crate::encoding;
use crate::error::{Error, Result};
use crate::models::{DocumentData, MonikerRow, Range, ResultChunkData};
use std::path::{Path, PathBuf};
use tracing::debug;
use turso::{Database, Value};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY,
    lsif_version TEXT NOT NULL,
    writer_version TEXT NOT NULL,
    num_result_chunks INTEGER NOT NULL,
    encoding_version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    path TEXT PRIMARY KEY,
    data BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS result_chunks (
    id INTEGER PRIMARY KEY,
    data BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS definitions (
    id INTEGER PRIMARY KEY,
    scheme TEXT NOT NULL,
    identifier TEXT NOT NULL,
    document_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    start_character INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    end_character INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_definitions_moniker ON definitions (scheme, identifier);
CREATE TABLE IF NOT EXISTS refs (
    id INTEGER PRIMARY KEY,
    scheme TEXT NOT NULL,
    identifier TEXT NOT NULL,
    document_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    start_character INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    end_character INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_refs_moniker ON refs (scheme, identifier);
";

/// Per-dump constants, read once at open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpMeta {
    pub lsif_version: String,
    pub writer_version: String,
    pub num_result_chunks: i64,
    pub encoding_version: i64,
}

/// Write handle used by the importer while a conversion is in flight.
pub struct DumpWriter {
    db: Database,
    path: PathBuf,
}

impl DumpWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        let db = open_database(path).await?;
        let conn = db.connect()?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            conn.execute(statement, ()).await?;
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Land the whole dump in one transaction. `num_result_chunks` must be
    /// at least 1 and is immutable afterwards.
    pub async fn write_all(
        &self,
        lsif_version: &str,
        num_result_chunks: i64,
        documents: &[(String, DocumentData)],
        result_chunks: &[(i64, ResultChunkData)],
        definitions: &[MonikerRow],
        references: &[MonikerRow],
    ) -> Result<()> {
        if num_result_chunks < 1 {
            return Err(Error::Fatal(
                "a dump must have at least one result chunk".to_string(),
            ));
        }

        let conn = self.db.connect()?;
        with_transaction(&conn, || async {
            conn.execute(
                "INSERT INTO meta (id, lsif_version, writer_version, num_result_chunks, encoding_version)
                 VALUES (1, ?, ?, ?, ?)",
                [
                    Value::Text(lsif_version.to_string()),
                    Value::Text(env!("CARGO_PKG_VERSION").to_string()),
                    Value::Integer(num_result_chunks),
                    Value::Integer(encoding::ENCODING_VERSION),
                ],
            )
            .await?;

            for (path, document) in documents {
                conn.execute(
                    "INSERT INTO documents (path, data) VALUES (?, ?)",
                    [
                        Value::Text(path.clone()),
                        Value::Blob(encoding::encode_document(document)?),
                    ],
                )
                .await?;
            }

            for (chunk_id, chunk) in result_chunks {
                conn.execute(
                    "INSERT INTO result_chunks (id, data) VALUES (?, ?)",
                    [
                        Value::Integer(*chunk_id),
                        Value::Blob(encoding::encode_result_chunk(chunk)?),
                    ],
                )
                .await?;
            }

            insert_moniker_rows(&conn, "definitions", definitions).await?;
            insert_moniker_rows(&conn, "refs", references).await?;
            Ok(())
        })
        .await?;

        debug!(
            path = %self.path.display(),
            documents = documents.len(),
            result_chunks = result_chunks.len(),
            definitions = definitions.len(),
            references = references.len(),
            "wrote dump store"
        );
        Ok(())
    }
}

async fn insert_moniker_rows(
    conn: &turso::Connection,
    table: &str,
    rows: &[MonikerRow],
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table}
         (id, scheme, identifier, document_path, start_line, start_character, end_line, end_character)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    );
    for (id, row) in rows.iter().enumerate() {
        conn.execute(
            &sql,
            [
                Value::Integer(id as i64 + 1),
                Value::Text(row.scheme.clone()),
                Value::Text(row.identifier.clone()),
                Value::Text(row.document_path.clone()),
                Value::Integer(row.range.start.line as i64),
                Value::Integer(row.range.start.character as i64),
                Value::Integer(row.range.end.line as i64),
                Value::Integer(row.range.end.character as i64),
            ],
        )
        .await?;
    }
    Ok(())
}

/// Read handle for a finished dump. Many may be open concurrently; each
/// operation borrows a short-lived connection from the embedded engine.
pub struct DumpStore {
    db: Database,
    path: PathBuf,
    meta: DumpMeta,
}

impl DumpStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let db = open_database(path).await?;
        let conn = db.connect()?;
        let mut rows = conn
            .query(
                "SELECT lsif_version, writer_version, num_result_chunks, encoding_version
                 FROM meta WHERE id = 1",
                (),
            )
            .await?;
        let row = rows.next().await?.ok_or_else(|| {
            Error::Fatal(format!("dump store {} has no meta row", path.display()))
        })?;
        let meta = DumpMeta {
            lsif_version: row_text(&row, 0)?,
            writer_version: row_text(&row, 1)?,
            num_result_chunks: row_i64(&row, 2)?,
            encoding_version: row_i64(&row, 3)?,
        };
        if meta.num_result_chunks < 1 {
            return Err(Error::Fatal(format!(
                "dump store {} declares {} result chunks",
                path.display(),
                meta.num_result_chunks
            )));
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &DumpMeta {
        &self.meta
    }

    pub async fn document_exists(&self, document_path: &str) -> Result<bool> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM documents WHERE path = ?",
                [Value::Text(document_path.to_string())],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Fetch and decode one document payload.
    pub async fn document(&self, document_path: &str) -> Result<Option<DocumentData>> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT data FROM documents WHERE path = ?",
                [Value::Text(document_path.to_string())],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let blob = row_blob(&row, 0)?;
                Ok(Some(encoding::decode_document(
                    &blob,
                    self.meta.encoding_version,
                )?))
            }
            None => Ok(None),
        }
    }

    /// Fetch and decode one result-chunk shard.
    pub async fn result_chunk(&self, chunk_id: i64) -> Result<Option<ResultChunkData>> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT data FROM result_chunks WHERE id = ?",
                [Value::Integer(chunk_id)],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let blob = row_blob(&row, 0)?;
                Ok(Some(encoding::decode_result_chunk(
                    &blob,
                    self.meta.encoding_version,
                )?))
            }
            None => Ok(None),
        }
    }

    pub async fn moniker_definitions(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<MonikerRow>> {
        self.moniker_rows("definitions", scheme, identifier).await
    }

    pub async fn moniker_references(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<MonikerRow>> {
        self.moniker_rows("refs", scheme, identifier).await
    }

    async fn moniker_rows(
        &self,
        table: &str,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<MonikerRow>> {
        let conn = self.db.connect()?;
        let sql = format!(
            "SELECT scheme, identifier, document_path,
                    start_line, start_character, end_line, end_character
             FROM {table}
             WHERE scheme = ? AND identifier = ?
             ORDER BY document_path, start_line, start_character"
        );
        let mut rows = conn
            .query(
                &sql,
                [
                    Value::Text(scheme.to_string()),
                    Value::Text(identifier.to_string()),
                ],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(MonikerRow {
                scheme: row_text(&row, 0)?,
                identifier: row_text(&row, 1)?,
                document_path: row_text(&row, 2)?,
                range: Range::new(
                    row_i64(&row, 3)? as u32,
                    row_i64(&row, 4)? as u32,
                    row_i64(&row, 5)? as u32,
                    row_i64(&row, 6)? as u32,
                ),
            });
        }
        Ok(out)
    }
}
