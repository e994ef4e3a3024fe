//! Per-dump query engine
//!
//! Opened on demand for one dump and backed by the shared cache tier. All
//! resolution is local to the dump: definitions, references, and hover for
//! the innermost range containing a position, plus the moniker surface the
//! backend uses to stitch results across dumps.
//!
//! A single query pins at most one connection-cache entry and fans out its
//! document and result-chunk pins underneath it; every pin is released
//! when the operation returns, success or error.

use crate::cache::CacheTier;
use crate::dump::DumpStore;
use crate::encoding::result_chunk_index;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{
    DocumentData, Dump, Hover, Id, Location, MonikerData, PackageInformationData, Position,
    RangeData,
};
use std::path::PathBuf;
use std::sync::Arc;

pub struct QueryDatabase {
    dump: Dump,
    dump_path: PathBuf,
    caches: Arc<CacheTier>,
}

impl QueryDatabase {
    pub fn new(dump: Dump, dump_path: PathBuf, caches: Arc<CacheTier>) -> Self {
        Self {
            dump,
            dump_path,
            caches,
        }
    }

    pub fn dump(&self) -> &Dump {
        &self.dump
    }

    /// Whether the dump contains a document at this (dump-relative) path.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.with_store(|store| async move { store.document_exists(&path).await })
            .await
    }

    /// All definition locations for the innermost range at `position`.
    pub async fn definitions(&self, path: &str, position: Position) -> Result<Vec<Location>> {
        self.resolve_result_for(path, position, |range| range.definition_result_id)
            .await
    }

    /// Local reference locations for the innermost range at `position`.
    /// Cross-dump fan-out happens in the backend.
    pub async fn references(&self, path: &str, position: Position) -> Result<Vec<Location>> {
        self.resolve_result_for(path, position, |range| range.reference_result_id)
            .await
    }

    /// Hover contents attached to the innermost range at `position`.
    pub async fn hover(&self, path: &str, position: Position) -> Result<Option<Hover>> {
        let dump_id = self.dump.id;
        let path = path.to_string();
        self.with_store(|store| {
            let caches = self.caches.clone();
            async move {
                let Some(document) = fetch_document(&caches, &store, dump_id, &path).await? else {
                    return Ok(None);
                };
                let Some((_, range)) = innermost_range(&document, position) else {
                    return Ok(None);
                };
                let Some(hover_id) = range.hover_result_id else {
                    return Ok(None);
                };
                match document.hover_results.get(&hover_id) {
                    Some(contents) => Ok(Some(Hover {
                        contents: contents.clone(),
                        range: range.range,
                    })),
                    None => Err(Error::Fatal(format!(
                        "hover result {hover_id} missing from document {path}"
                    ))),
                }
            }
        })
        .await
    }

    /// Monikers (with any package information) attached to the innermost
    /// range at `position`, in attachment order.
    pub async fn monikers_at(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Vec<(MonikerData, Option<PackageInformationData>)>> {
        let dump_id = self.dump.id;
        let path = path.to_string();
        self.with_store(|store| {
            let caches = self.caches.clone();
            async move {
                let Some(document) = fetch_document(&caches, &store, dump_id, &path).await? else {
                    return Ok(Vec::new());
                };
                let Some((_, range)) = innermost_range(&document, position) else {
                    return Ok(Vec::new());
                };
                let mut monikers = Vec::new();
                for moniker_id in &range.moniker_ids {
                    let Some(moniker) = document.monikers.get(moniker_id) else {
                        continue;
                    };
                    let package = moniker
                        .package_information_id
                        .and_then(|id| document.package_information.get(&id))
                        .cloned();
                    monikers.push((moniker.clone(), package));
                }
                Ok(monikers)
            }
        })
        .await
    }

    /// Definition rows indexed under a moniker, as locations in this dump.
    pub async fn moniker_definitions(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<Location>> {
        let dump_id = self.dump.id;
        let (scheme, identifier) = (scheme.to_string(), identifier.to_string());
        self.with_store(|store| async move {
            let rows = store.moniker_definitions(&scheme, &identifier).await?;
            Ok(rows
                .into_iter()
                .map(|row| Location {
                    dump_id,
                    path: row.document_path,
                    range: row.range,
                })
                .collect())
        })
        .await
    }

    /// Reference rows indexed under a moniker, as locations in this dump.
    pub async fn moniker_references(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<Location>> {
        let dump_id = self.dump.id;
        let (scheme, identifier) = (scheme.to_string(), identifier.to_string());
        self.with_store(|store| async move {
            let rows = store.moniker_references(&scheme, &identifier).await?;
            Ok(rows
                .into_iter()
                .map(|row| Location {
                    dump_id,
                    path: row.document_path,
                    range: row.range,
                })
                .collect())
        })
        .await
    }

    async fn resolve_result_for(
        &self,
        path: &str,
        position: Position,
        pick: impl Fn(&RangeData) -> Option<Id>,
    ) -> Result<Vec<Location>> {
        let dump_id = self.dump.id;
        let path = path.to_string();
        self.with_store(|store| {
            let caches = self.caches.clone();
            async move {
                let Some(document) = fetch_document(&caches, &store, dump_id, &path).await? else {
                    return Ok(Vec::new());
                };
                let Some((_, range)) = innermost_range(&document, position) else {
                    return Ok(Vec::new());
                };
                let Some(result_id) = pick(range) else {
                    return Ok(Vec::new());
                };
                resolve_result(&caches, &store, dump_id, result_id).await
            }
        })
        .await
    }

    /// Run `user` with the dump store pinned in the connection cache.
    async fn with_store<R, FutU>(
        &self,
        user: impl FnOnce(Arc<DumpStore>) -> FutU,
    ) -> Result<R>
    where
        FutU: std::future::Future<Output = Result<R>>,
    {
        let path = self.dump_path.clone();
        self.caches
            .connections
            .with_entry(
                self.dump_path.clone(),
                move || async move { DumpStore::open(&path).await },
                user,
            )
            .await
    }
}

/// Fetch a decoded document through the cache; `None` when the dump has no
/// document at that path.
async fn fetch_document(
    caches: &CacheTier,
    store: &Arc<DumpStore>,
    dump_id: i64,
    path: &str,
) -> Result<Option<Arc<DocumentData>>> {
    let factory_store = store.clone();
    let factory_path = path.to_string();
    let result = caches
        .documents
        .with_entry(
            (dump_id, path.to_string()),
            move || async move {
                factory_store
                    .document(&factory_path)
                    .await?
                    .ok_or(Error::NotIndexed)
            },
            |document| async move { Ok(document) },
        )
        .await;
    match result {
        Ok(document) => Ok(Some(document)),
        Err(err) if err.kind() == ErrorKind::NotIndexed => Ok(None),
        Err(err) => Err(err),
    }
}

/// Resolve a result id through its shard into ordered locations.
async fn resolve_result(
    caches: &CacheTier,
    store: &Arc<DumpStore>,
    dump_id: i64,
    result_id: Id,
) -> Result<Vec<Location>> {
    let num_result_chunks = store.meta().num_result_chunks;
    let chunk_id = result_chunk_index(result_id, num_result_chunks);

    let factory_store = store.clone();
    let chunk = caches
        .chunks
        .with_entry(
            (dump_id, chunk_id),
            move || async move {
                factory_store.result_chunk(chunk_id).await?.ok_or_else(|| {
                    Error::Fatal(format!(
                        "result chunk {chunk_id} missing from dump {dump_id}"
                    ))
                })
            },
            |chunk| async move { Ok(chunk) },
        )
        .await?;

    let Some(members) = chunk.document_id_range_ids.get(&result_id) else {
        return Ok(Vec::new());
    };

    let mut locations = Vec::with_capacity(members.len());
    for member in members {
        let path = chunk.document_paths.get(&member.document_id).ok_or_else(|| {
            Error::Fatal(format!(
                "result chunk {chunk_id} references unknown document id {}",
                member.document_id
            ))
        })?;
        let Some(document) = fetch_document(caches, store, dump_id, path).await? else {
            return Err(Error::Fatal(format!(
                "result member names absent document {path}"
            )));
        };
        let range = document.ranges.get(&member.range_id).ok_or_else(|| {
            Error::Fatal(format!(
                "result member names unknown range {} in {path}",
                member.range_id
            ))
        })?;
        locations.push(Location {
            dump_id,
            path: path.clone(),
            range: range.range,
        });
    }
    locations.sort_by(|a, b| {
        (&a.path, a.range.start.line, a.range.start.character).cmp(&(
            &b.path,
            b.range.start.line,
            b.range.start.character,
        ))
    });
    Ok(locations)
}

/// The innermost range containing `position`: smallest area wins, ties
/// break by earliest start, then by range id for stability.
fn innermost_range(
    document: &DocumentData,
    position: Position,
) -> Option<(Id, &RangeData)> {
    document
        .ranges
        .iter()
        .filter(|(_, range)| range.range.contains(position))
        .min_by_key(|(id, range)| {
            (
                range.range.area(),
                range.range.start.line,
                range.range.start.character,
                **id,
            )
        })
        .map(|(id, range)| (*id, range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dump::DumpWriter;
    use crate::importer;
    use crate::importer::test_fixtures::{gzip_lines, sample_dump_lines};
    use crate::models::Range;
    use clap::Parser;
    use std::collections::HashMap;

    fn test_dump(id: i64) -> Dump {
        Dump {
            id,
            repository: "r".to_string(),
            commit: "a".repeat(40),
            root: String::new(),
            visible_at_tip: true,
            uploaded_at: 0,
        }
    }

    async fn sample_database(dir: &tempfile::TempDir) -> QueryDatabase {
        let path = dir.path().join("1.lsif.db");
        let writer = DumpWriter::create(&path).await.unwrap();
        let payload = gzip_lines(&sample_dump_lines("src/a.ts", "npm", "lib", "lib:foo"));
        importer::convert(&payload[..], &writer).await.unwrap();

        let config = Config::parse_from(["lsif-daemon"]);
        QueryDatabase::new(test_dump(1), path, Arc::new(CacheTier::new(&config)))
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        assert!(db.exists("src/a.ts").await.unwrap());
        assert!(!db.exists("src/missing.ts").await.unwrap());
    }

    #[tokio::test]
    async fn test_definitions_from_use_site() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        // The reference range at 3:2-3:5 resolves to the definition at
        // 0:4-0:7 through the shared result set.
        let locations = db
            .definitions("src/a.ts", Position { line: 3, character: 3 })
            .await
            .unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].range, Range::new(0, 4, 0, 7));
    }

    #[tokio::test]
    async fn test_references_include_def_and_use() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        let locations = db
            .references("src/a.ts", Position { line: 0, character: 5 })
            .await
            .unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].range, Range::new(0, 4, 0, 7));
        assert_eq!(locations[1].range, Range::new(3, 2, 3, 5));
    }

    #[tokio::test]
    async fn test_hover() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        let hover = db
            .hover("src/a.ts", Position { line: 0, character: 4 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hover.contents, "declares foo");
        assert_eq!(hover.range, Range::new(0, 4, 0, 7));

        // A position outside any range has no hover.
        assert!(db
            .hover("src/a.ts", Position { line: 9, character: 0 })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_monikers_at_position() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        let monikers = db
            .monikers_at("src/a.ts", Position { line: 3, character: 2 })
            .await
            .unwrap();
        assert_eq!(monikers.len(), 1);
        let (moniker, package) = &monikers[0];
        assert_eq!(moniker.identifier, "lib:foo");
        assert_eq!(package.as_ref().unwrap().name, "lib");
    }

    #[tokio::test]
    async fn test_position_outside_ranges_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_database(&dir).await;
        assert!(db
            .definitions("src/a.ts", Position { line: 50, character: 0 })
            .await
            .unwrap()
            .is_empty());
        assert!(db
            .references("src/missing.ts", Position { line: 0, character: 0 })
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_innermost_range_selection() {
        let mut document = DocumentData::default();
        let mut insert = |id: Id, range: Range| {
            document.ranges.insert(
                id,
                RangeData {
                    range,
                    definition_result_id: None,
                    reference_result_id: None,
                    hover_result_id: None,
                    moniker_ids: vec![],
                },
            );
        };
        insert(1, Range::new(0, 0, 10, 0)); // whole block
        insert(2, Range::new(2, 0, 2, 30)); // full line
        insert(3, Range::new(2, 4, 2, 9)); // identifier
        let (id, _) = innermost_range(
            &document,
            Position {
                line: 2,
                character: 5,
            },
        )
        .unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn test_innermost_tie_breaks_by_earliest_start() {
        let mut ranges = HashMap::new();
        for (id, range) in [
            (7, Range::new(1, 2, 1, 6)),
            (5, Range::new(1, 3, 1, 7)),
        ] {
            ranges.insert(
                id,
                RangeData {
                    range,
                    definition_result_id: None,
                    reference_result_id: None,
                    hover_result_id: None,
                    moniker_ids: vec![],
                },
            );
        }
        let document = DocumentData {
            ranges,
            ..Default::default()
        };
        // Both ranges have area 4 and contain (1,4); the earlier start
        // wins.
        let (id, _) = innermost_range(
            &document,
            Position {
                line: 1,
                character: 4,
            },
        )
        .unwrap();
        assert_eq!(id, 7);
    }
}
