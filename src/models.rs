//! Domain model shared across the importer, the dump stores, and the
//! query path.
//!
//! The `*Data` types are the decoded shapes of the gzip-compressed blobs
//! stored per dump (see `encoding`); everything else is either a row in the
//! cross-repository index or a wire type returned from the HTTP surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dense identifier assigned by the importer to documents, ranges, and
/// results. Never the source graph's id.
pub type Id = u64;

/// A zero-based position within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// A half-open range within a document: the end character is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: u32, start_character: u32, end_line: u32, end_character: u32) -> Self {
        Self {
            start: Position {
                line: start_line,
                character: start_character,
            },
            end: Position {
                line: end_line,
                character: end_character,
            },
        }
    }

    /// Whether `position` falls inside this range (end-exclusive).
    pub fn contains(&self, position: Position) -> bool {
        if position.line < self.start.line || position.line > self.end.line {
            return false;
        }
        if position.line == self.start.line && position.character < self.start.character {
            return false;
        }
        if position.line == self.end.line && position.character >= self.end.character {
            return false;
        }
        true
    }

    /// Number of covered character cells, used to pick the innermost of
    /// overlapping ranges. Multi-line ranges weigh each full line.
    pub fn area(&self) -> u64 {
        let lines = (self.end.line - self.start.line) as u64;
        if lines == 0 {
            (self.end.character.saturating_sub(self.start.character)) as u64
        } else {
            lines * 10_000 + self.end.character as u64
        }
    }
}

/// A resolved code-intelligence location within a specific dump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub dump_id: i64,
    /// Dump-relative document path.
    pub path: String,
    pub range: Range,
}

/// A location with the owning dump resolved back to repository coordinates,
/// as returned from the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub repository: String,
    pub commit: String,
    /// Repository-relative path (dump root included).
    pub path: String,
    pub range: Range,
}

/// Hover contents plus the range the hover was attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hover {
    pub contents: String,
    pub range: Range,
}

/// One imported LSIF payload for a `(repository, commit, root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    pub id: i64,
    pub repository: String,
    pub commit: String,
    /// Repository-relative directory the dump was indexed from, `""` or a
    /// `dir/`-style prefix.
    pub root: String,
    pub visible_at_tip: bool,
    pub uploaded_at: i64,
}

/// A versioned namespace of monikers, exported or imported by a dump.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Package {
    pub scheme: String,
    pub name: String,
    pub version: String,
}

/// An imported package together with the moniker identifiers referenced
/// through it; the identifiers feed the reference-row bloom filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReference {
    pub package: Package,
    pub identifiers: Vec<String>,
}

/// Moniker kinds we act on. Anything else ingests as `Local` and stays
/// private to the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonikerKind {
    Import,
    Export,
    Local,
}

/// Decoded moniker attached to a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonikerData {
    pub kind: MonikerKind,
    pub scheme: String,
    pub identifier: String,
    pub package_information_id: Option<Id>,
}

/// Decoded packageInformation vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInformationData {
    pub name: String,
    pub version: String,
}

/// A single range record inside a document blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeData {
    pub range: Range,
    pub definition_result_id: Option<Id>,
    pub reference_result_id: Option<Id>,
    pub hover_result_id: Option<Id>,
    pub moniker_ids: Vec<Id>,
}

/// The decoded payload of one `documents` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentData {
    pub ranges: HashMap<Id, RangeData>,
    /// Hover contents keyed by hover result id; hovers live with the
    /// document rather than in their own table.
    pub hover_results: HashMap<Id, String>,
    pub monikers: HashMap<Id, MonikerData>,
    pub package_information: HashMap<Id, PackageInformationData>,
}

/// One member of a definition or reference result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIdRangeId {
    pub document_id: Id,
    pub range_id: Id,
}

/// The decoded payload of one `result_chunks` row: a shard of the map from
/// result id to its member ranges, with the paths of every document the
/// shard mentions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultChunkData {
    pub document_paths: HashMap<Id, String>,
    pub document_id_range_ids: HashMap<Id, Vec<DocumentIdRangeId>>,
}

/// A moniker-indexed definition or reference row as stored in a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonikerRow {
    pub scheme: String,
    pub identifier: String,
    pub document_path: String,
    pub range: Range,
}
