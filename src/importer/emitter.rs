//! Emit pass: dense ids, chunk partitioning, and the dump-store write
//!
//! Takes the canonicalized graph, assigns small dense integer ids to
//! documents, ranges, results, monikers, and package information, shards
//! the result membership lists into `num_result_chunks` partitions, and
//! lands everything in the dump store in one transaction. Also derives the
//! cross-repository summaries: packages this dump exports and packages it
//! imports together with the identifiers referenced through them.

use super::canonicalize::Canonicalized;
use super::correlator::VertexId;
use crate::dump::DumpWriter;
use crate::encoding::result_chunk_index;
use crate::error::Result;
use crate::models::{
    DocumentData, DocumentIdRangeId, Id, MonikerData, MonikerKind, MonikerRow, Package,
    PackageReference, RangeData, ResultChunkData,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Target members per result chunk; the shard count grows with the number
/// of distinct results up to the cap.
const RESULTS_PER_RESULT_CHUNK: usize = 512;
const MAX_NUM_RESULT_CHUNKS: i64 = 1000;

/// Cross-repo summaries handed to the shared index after a conversion.
#[derive(Debug, Default, PartialEq)]
pub struct ImportSummary {
    pub packages: Vec<Package>,
    pub references: Vec<PackageReference>,
    pub num_documents: usize,
    pub num_result_chunks: i64,
}

pub async fn emit(writer: &DumpWriter, state: Canonicalized) -> Result<ImportSummary> {
    // Dense document ids, ordered by path for deterministic output.
    let mut paths: Vec<(&String, VertexId)> = state
        .documents
        .iter()
        .map(|(vertex, path)| (path, *vertex))
        .collect();
    paths.sort();
    let document_ids: HashMap<VertexId, Id> = paths
        .iter()
        .enumerate()
        .map(|(dense, (_, vertex))| (*vertex, dense as Id))
        .collect();
    let document_paths: HashMap<VertexId, &String> =
        paths.iter().map(|(path, vertex)| (*vertex, *path)).collect();

    // Dense range ids, per document in position order.
    let mut range_ids: HashMap<VertexId, Id> = HashMap::new();
    let mut next_range_id: Id = 0;
    for (_, document_vertex) in &paths {
        let mut contained = state
            .contains
            .get(document_vertex)
            .cloned()
            .unwrap_or_default();
        contained.sort_by_key(|vertex| {
            state
                .ranges
                .get(vertex)
                .map(|r| (r.range.start.line, r.range.start.character))
                .unwrap_or((u32::MAX, u32::MAX))
        });
        for vertex in contained {
            range_ids.entry(vertex).or_insert_with(|| {
                let id = next_range_id;
                next_range_id += 1;
                id
            });
        }
    }

    // Dense ids for results actually referenced by some range.
    let mut result_ids: HashMap<VertexId, Id> = HashMap::new();
    let mut referenced_results: BTreeSet<VertexId> = BTreeSet::new();
    for range in state.ranges.values() {
        referenced_results.extend(range.definition_result);
        referenced_results.extend(range.reference_result);
    }
    for (dense, vertex) in referenced_results.iter().enumerate() {
        result_ids.insert(*vertex, dense as Id);
    }

    // Dense ids for hover results, monikers, and package information.
    let hover_ids: HashMap<VertexId, Id> = dense_ids(state.hover_results.keys());
    let moniker_ids: HashMap<VertexId, Id> = dense_ids(state.monikers.keys());
    let package_info_ids: HashMap<VertexId, Id> = dense_ids(state.package_information.keys());

    let num_results = result_ids.len();
    let num_result_chunks = (num_results.div_ceil(RESULTS_PER_RESULT_CHUNK) as i64)
        .clamp(1, MAX_NUM_RESULT_CHUNKS);

    // Documents.
    let mut documents: Vec<(String, DocumentData)> = Vec::with_capacity(paths.len());
    for (path, document_vertex) in &paths {
        let mut data = DocumentData::default();
        for range_vertex in state.contains.get(document_vertex).into_iter().flatten() {
            let Some(range) = state.ranges.get(range_vertex) else {
                continue;
            };
            let hover_result_id = range.hover_result.and_then(|v| hover_ids.get(&v)).copied();
            if let (Some(vertex), Some(id)) = (range.hover_result, hover_result_id) {
                data.hover_results
                    .insert(id, state.hover_results[&vertex].clone());
            }
            let mut attached_monikers = Vec::new();
            for moniker_vertex in &range.monikers {
                let (Some(&dense), Some(raw)) = (
                    moniker_ids.get(moniker_vertex),
                    state.monikers.get(moniker_vertex),
                ) else {
                    continue;
                };
                let package_information_id = raw
                    .package_information
                    .and_then(|v| package_info_ids.get(&v))
                    .copied();
                if let (Some(vertex), Some(id)) = (raw.package_information, package_information_id)
                {
                    data.package_information
                        .insert(id, state.package_information[&vertex].clone());
                }
                data.monikers.insert(
                    dense,
                    MonikerData {
                        kind: raw.kind,
                        scheme: raw.scheme.clone(),
                        identifier: raw.identifier.clone(),
                        package_information_id,
                    },
                );
                attached_monikers.push(dense);
            }
            data.ranges.insert(
                range_ids[range_vertex],
                RangeData {
                    range: range.range,
                    definition_result_id: range
                        .definition_result
                        .and_then(|v| result_ids.get(&v))
                        .copied(),
                    reference_result_id: range
                        .reference_result
                        .and_then(|v| result_ids.get(&v))
                        .copied(),
                    hover_result_id,
                    moniker_ids: attached_monikers,
                },
            );
        }
        data.ranges.shrink_to_fit();
        documents.push(((*path).clone(), data));
    }

    // Result chunks.
    let mut chunks: BTreeMap<i64, ResultChunkData> = BTreeMap::new();
    for (vertex, dense) in &result_ids {
        let members = state
            .definition_results
            .get(vertex)
            .or_else(|| state.reference_results.get(vertex))
            .cloned()
            .unwrap_or_default();
        let chunk = chunks
            .entry(result_chunk_index(*dense, num_result_chunks))
            .or_default();
        let mut out_members = Vec::with_capacity(members.len());
        for member in members {
            let (Some(&document_id), Some(&range_id)) = (
                document_ids.get(&member.document),
                range_ids.get(&member.range),
            ) else {
                continue;
            };
            chunk
                .document_paths
                .entry(document_id)
                .or_insert_with(|| (*document_paths[&member.document]).clone());
            out_members.push(DocumentIdRangeId {
                document_id,
                range_id,
            });
        }
        chunk.document_id_range_ids.insert(*dense, out_members);
    }
    let result_chunks: Vec<(i64, ResultChunkData)> = chunks.into_iter().collect();

    // Moniker-indexed definition and reference rows. Local monikers stay
    // private to the dump; import and export monikers both index, so a
    // defining dump can be queried for references from its importers.
    let mut definition_rows: BTreeSet<(String, String, String, (u32, u32, u32, u32))> =
        BTreeSet::new();
    let mut reference_rows = BTreeSet::new();
    for (result_vertex, moniker_vertices) in &state.result_monikers {
        let members = state
            .definition_results
            .get(result_vertex)
            .or_else(|| state.reference_results.get(result_vertex));
        let Some(members) = members else {
            continue;
        };
        let is_definition = state.definition_results.contains_key(result_vertex);
        for moniker_vertex in moniker_vertices {
            let Some(moniker) = state.monikers.get(moniker_vertex) else {
                continue;
            };
            if moniker.kind == MonikerKind::Local {
                continue;
            }
            for member in members {
                let (Some(path), Some(range)) = (
                    document_paths.get(&member.document),
                    state.ranges.get(&member.range),
                ) else {
                    continue;
                };
                let key = (
                    moniker.scheme.clone(),
                    moniker.identifier.clone(),
                    (*path).clone(),
                    (
                        range.range.start.line,
                        range.range.start.character,
                        range.range.end.line,
                        range.range.end.character,
                    ),
                );
                if is_definition {
                    definition_rows.insert(key);
                } else {
                    reference_rows.insert(key);
                }
            }
        }
    }
    let definitions: Vec<MonikerRow> = definition_rows.into_iter().map(into_row).collect();
    let references: Vec<MonikerRow> = reference_rows.into_iter().map(into_row).collect();

    // Cross-repo summaries.
    let mut packages: BTreeSet<Package> = BTreeSet::new();
    let mut imports: BTreeMap<Package, BTreeSet<String>> = BTreeMap::new();
    for moniker in state.monikers.values() {
        let Some(info_vertex) = moniker.package_information else {
            continue;
        };
        let Some(info) = state.package_information.get(&info_vertex) else {
            continue;
        };
        let package = Package {
            scheme: moniker.scheme.clone(),
            name: info.name.clone(),
            version: info.version.clone(),
        };
        match moniker.kind {
            MonikerKind::Export => {
                packages.insert(package);
            }
            MonikerKind::Import => {
                imports
                    .entry(package)
                    .or_default()
                    .insert(moniker.identifier.clone());
            }
            MonikerKind::Local => {}
        }
    }

    writer
        .write_all(
            &state.lsif_version,
            num_result_chunks,
            &documents,
            &result_chunks,
            &definitions,
            &references,
        )
        .await?;

    debug!(
        documents = documents.len(),
        results = num_results,
        chunks = result_chunks.len(),
        packages = packages.len(),
        package_references = imports.len(),
        "emitted dump"
    );

    Ok(ImportSummary {
        packages: packages.into_iter().collect(),
        references: imports
            .into_iter()
            .map(|(package, identifiers)| PackageReference {
                package,
                identifiers: identifiers.into_iter().collect(),
            })
            .collect(),
        num_documents: documents.len(),
        num_result_chunks,
    })
}

fn dense_ids<'a>(vertices: impl Iterator<Item = &'a VertexId>) -> HashMap<VertexId, Id> {
    let mut sorted: Vec<VertexId> = vertices.copied().collect();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .enumerate()
        .map(|(dense, vertex)| (vertex, dense as Id))
        .collect()
}

#[allow(clippy::type_complexity)]
fn into_row(
    (scheme, identifier, document_path, (start_line, start_character, end_line, end_character)): (
        String,
        String,
        String,
        (u32, u32, u32, u32),
    ),
) -> MonikerRow {
    MonikerRow {
        scheme,
        identifier,
        document_path,
        range: crate::models::Range::new(start_line, start_character, end_line, end_character),
    }
}
