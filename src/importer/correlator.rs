//! Ingest pass: stream elements into an indexed correlation state
//!
//! The source graph arrives in arbitrary topological order, so nothing is
//! resolved here. Vertices land in an arena keyed by interned id; edges are
//! validated against the vertex kinds seen so far and recorded in index
//! maps for the canonicalize pass. Ids referenced before (or never)
//! defined surface as [`ImportError::DanglingReference`] — edges may only
//! point at already-ingested vertices, which every known producer
//! satisfies.

use super::elements::{Edge, EdgeLabel, Element, ItemProperty, LsifId, Vertex};
use super::ImportError;
use crate::models::{MonikerKind, PackageInformationData, Range};
use std::collections::HashMap;

/// Interned vertex id, dense from zero.
pub type VertexId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Project,
    Document,
    Range,
    ResultSet,
    DefinitionResult,
    ReferenceResult,
    HoverResult,
    Moniker,
    PackageInformation,
    Ignored,
}

/// Result attachments shared by ranges and result sets.
#[derive(Debug, Clone, Default)]
pub struct ResultAttachments {
    pub definition_result: Option<VertexId>,
    pub reference_result: Option<VertexId>,
    pub hover_result: Option<VertexId>,
    pub monikers: Vec<VertexId>,
    pub next: Option<VertexId>,
}

#[derive(Debug, Clone)]
pub struct RawRange {
    pub range: Range,
    pub attachments: ResultAttachments,
}

#[derive(Debug, Clone)]
pub struct RawMoniker {
    pub kind: MonikerKind,
    pub scheme: String,
    pub identifier: String,
    pub package_information: Option<VertexId>,
}

/// One `(document, range)` member of a definition or reference result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RawMember {
    pub document: VertexId,
    pub range: VertexId,
}

#[derive(Debug, Default)]
pub struct Correlator {
    interner: HashMap<LsifId, VertexId>,
    kinds: Vec<VertexKind>,

    pub lsif_version: Option<String>,
    pub documents: HashMap<VertexId, String>,
    pub contains: HashMap<VertexId, Vec<VertexId>>,
    pub ranges: HashMap<VertexId, RawRange>,
    pub result_sets: HashMap<VertexId, ResultAttachments>,
    pub definition_results: HashMap<VertexId, Vec<RawMember>>,
    pub reference_results: HashMap<VertexId, Vec<RawMember>>,
    pub hover_results: HashMap<VertexId, String>,
    pub monikers: HashMap<VertexId, RawMoniker>,
    pub package_information: HashMap<VertexId, PackageInformationData>,
    /// `nextMoniker` edges; direction is irrelevant, groups are unioned.
    pub moniker_links: Vec<(VertexId, VertexId)>,
    /// `item` edges of property `referenceResults`.
    pub linked_reference_results: Vec<(VertexId, VertexId)>,

    elements_seen: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, id: LsifId, kind: VertexKind) -> VertexId {
        let vertex_id = self.kinds.len() as VertexId;
        self.interner.insert(id, vertex_id);
        self.kinds.push(kind);
        vertex_id
    }

    fn resolve(&self, id: &LsifId, _line: u64) -> Result<VertexId, ImportError> {
        self.interner
            .get(id)
            .copied()
            .ok_or_else(|| ImportError::DanglingReference { id: id.to_string() })
    }

    fn kind(&self, vertex: VertexId) -> VertexKind {
        self.kinds[vertex as usize]
    }

    fn expect_kind(
        &self,
        vertex: VertexId,
        expected: &[VertexKind],
        line: u64,
        context: &str,
    ) -> Result<(), ImportError> {
        if expected.contains(&self.kind(vertex)) {
            Ok(())
        } else {
            Err(ImportError::MalformedInput {
                line,
                message: format!(
                    "{context}: expected one of {expected:?}, found {:?}",
                    self.kind(vertex)
                ),
            })
        }
    }

    /// Ingest one element. `line` is 1-based.
    pub fn insert(&mut self, element: Element, line: u64) -> Result<(), ImportError> {
        self.elements_seen += 1;
        if self.elements_seen == 1 {
            match &element {
                Element::Vertex {
                    vertex: Vertex::MetaData { version },
                    ..
                } => {
                    check_version(version)?;
                    self.lsif_version = Some(version.clone());
                }
                _ => {
                    return Err(ImportError::MalformedInput {
                        line,
                        message: "first element must be a metaData vertex".to_string(),
                    })
                }
            }
            return Ok(());
        }

        match element {
            Element::Vertex { id, vertex } => self.insert_vertex(id, vertex, line),
            Element::Edge { edge } => self.insert_edge(edge, line),
        }
    }

    fn insert_vertex(
        &mut self,
        id: LsifId,
        vertex: Vertex,
        line: u64,
    ) -> Result<(), ImportError> {
        if self.interner.contains_key(&id) {
            return Err(ImportError::MalformedInput {
                line,
                message: format!("duplicate vertex id {id}"),
            });
        }
        match vertex {
            Vertex::MetaData { .. } => Err(ImportError::MalformedInput {
                line,
                message: "metaData must be the first element and appear once".to_string(),
            }),
            Vertex::Project => {
                self.intern(id, VertexKind::Project);
                Ok(())
            }
            Vertex::Document { uri } => {
                let vertex_id = self.intern(id, VertexKind::Document);
                self.documents.insert(vertex_id, relative_uri(&uri));
                Ok(())
            }
            Vertex::Range { range } => {
                let vertex_id = self.intern(id, VertexKind::Range);
                self.ranges.insert(
                    vertex_id,
                    RawRange {
                        range,
                        attachments: ResultAttachments::default(),
                    },
                );
                Ok(())
            }
            Vertex::ResultSet => {
                let vertex_id = self.intern(id, VertexKind::ResultSet);
                self.result_sets
                    .insert(vertex_id, ResultAttachments::default());
                Ok(())
            }
            Vertex::DefinitionResult => {
                let vertex_id = self.intern(id, VertexKind::DefinitionResult);
                self.definition_results.insert(vertex_id, Vec::new());
                Ok(())
            }
            Vertex::ReferenceResult => {
                let vertex_id = self.intern(id, VertexKind::ReferenceResult);
                self.reference_results.insert(vertex_id, Vec::new());
                Ok(())
            }
            Vertex::HoverResult { contents } => {
                let vertex_id = self.intern(id, VertexKind::HoverResult);
                self.hover_results.insert(vertex_id, contents);
                Ok(())
            }
            Vertex::Moniker {
                kind,
                scheme,
                identifier,
            } => {
                let vertex_id = self.intern(id, VertexKind::Moniker);
                self.monikers.insert(
                    vertex_id,
                    RawMoniker {
                        kind,
                        scheme,
                        identifier,
                        package_information: None,
                    },
                );
                Ok(())
            }
            Vertex::PackageInformation { name, version } => {
                let vertex_id = self.intern(id, VertexKind::PackageInformation);
                self.package_information
                    .insert(vertex_id, PackageInformationData { name, version });
                Ok(())
            }
            Vertex::Ignored => {
                self.intern(id, VertexKind::Ignored);
                Ok(())
            }
        }
    }

    fn insert_edge(&mut self, edge: Edge, line: u64) -> Result<(), ImportError> {
        if edge.label == EdgeLabel::Ignored {
            return Ok(());
        }
        let out_v = self.resolve(&edge.out_v, line)?;
        let in_vs: Vec<VertexId> = edge
            .in_vs
            .iter()
            .map(|id| self.resolve(id, line))
            .collect::<Result<_, _>>()?;

        match edge.label {
            EdgeLabel::Contains => {
                // Project-contains-document edges carry no range facts.
                if self.kind(out_v) == VertexKind::Project {
                    return Ok(());
                }
                self.expect_kind(out_v, &[VertexKind::Document], line, "contains outV")?;
                for &in_v in &in_vs {
                    self.expect_kind(in_v, &[VertexKind::Range], line, "contains inV")?;
                }
                self.contains.entry(out_v).or_default().extend(in_vs);
                Ok(())
            }
            EdgeLabel::Next => {
                let in_v = single(&in_vs, line, "next")?;
                self.expect_kind(in_v, &[VertexKind::ResultSet], line, "next inV")?;
                self.attachments_mut(out_v, line, "next outV")?.next = Some(in_v);
                Ok(())
            }
            EdgeLabel::Item => self.insert_item_edge(out_v, &in_vs, edge, line),
            EdgeLabel::TextDocumentDefinition => {
                let in_v = single(&in_vs, line, "textDocument/definition")?;
                self.expect_kind(
                    in_v,
                    &[VertexKind::DefinitionResult],
                    line,
                    "definition inV",
                )?;
                self.attachments_mut(out_v, line, "definition outV")?
                    .definition_result = Some(in_v);
                Ok(())
            }
            EdgeLabel::TextDocumentReferences => {
                let in_v = single(&in_vs, line, "textDocument/references")?;
                self.expect_kind(in_v, &[VertexKind::ReferenceResult], line, "references inV")?;
                self.attachments_mut(out_v, line, "references outV")?
                    .reference_result = Some(in_v);
                Ok(())
            }
            EdgeLabel::TextDocumentHover => {
                let in_v = single(&in_vs, line, "textDocument/hover")?;
                self.expect_kind(in_v, &[VertexKind::HoverResult], line, "hover inV")?;
                self.attachments_mut(out_v, line, "hover outV")?.hover_result = Some(in_v);
                Ok(())
            }
            EdgeLabel::Moniker => {
                let in_v = single(&in_vs, line, "moniker")?;
                self.expect_kind(in_v, &[VertexKind::Moniker], line, "moniker inV")?;
                self.attachments_mut(out_v, line, "moniker outV")?
                    .monikers
                    .push(in_v);
                Ok(())
            }
            EdgeLabel::NextMoniker => {
                let in_v = single(&in_vs, line, "nextMoniker")?;
                self.expect_kind(out_v, &[VertexKind::Moniker], line, "nextMoniker outV")?;
                self.expect_kind(in_v, &[VertexKind::Moniker], line, "nextMoniker inV")?;
                self.moniker_links.push((out_v, in_v));
                Ok(())
            }
            EdgeLabel::PackageInformation => {
                let in_v = single(&in_vs, line, "packageInformation")?;
                self.expect_kind(out_v, &[VertexKind::Moniker], line, "packageInformation outV")?;
                self.expect_kind(
                    in_v,
                    &[VertexKind::PackageInformation],
                    line,
                    "packageInformation inV",
                )?;
                self.monikers
                    .get_mut(&out_v)
                    .expect("moniker kind checked")
                    .package_information = Some(in_v);
                Ok(())
            }
            EdgeLabel::Ignored => Ok(()),
        }
    }

    fn insert_item_edge(
        &mut self,
        out_v: VertexId,
        in_vs: &[VertexId],
        edge: Edge,
        line: u64,
    ) -> Result<(), ImportError> {
        // Linked reference results merge with each other instead of adding
        // range members.
        if edge.property == Some(ItemProperty::ReferenceResults) {
            self.expect_kind(out_v, &[VertexKind::ReferenceResult], line, "item outV")?;
            for &in_v in in_vs {
                self.expect_kind(in_v, &[VertexKind::ReferenceResult], line, "item inV")?;
                self.linked_reference_results.push((out_v, in_v));
            }
            return Ok(());
        }

        let document_id = edge.document.as_ref().ok_or(ImportError::MalformedInput {
            line,
            message: "item edge without document".to_string(),
        })?;
        let document = self.resolve(document_id, line)?;
        self.expect_kind(document, &[VertexKind::Document], line, "item document")?;

        let members: Vec<RawMember> = in_vs
            .iter()
            .map(|&range| {
                self.expect_kind(range, &[VertexKind::Range], line, "item inV")?;
                Ok(RawMember { document, range })
            })
            .collect::<Result<_, ImportError>>()?;

        match self.kind(out_v) {
            VertexKind::DefinitionResult => {
                self.definition_results
                    .get_mut(&out_v)
                    .expect("kind checked")
                    .extend(members);
                Ok(())
            }
            VertexKind::ReferenceResult => {
                self.reference_results
                    .get_mut(&out_v)
                    .expect("kind checked")
                    .extend(members);
                Ok(())
            }
            other => Err(ImportError::MalformedInput {
                line,
                message: format!("item outV must be a result, found {other:?}"),
            }),
        }
    }

    fn attachments_mut(
        &mut self,
        vertex: VertexId,
        line: u64,
        context: &str,
    ) -> Result<&mut ResultAttachments, ImportError> {
        match self.kind(vertex) {
            VertexKind::Range => Ok(&mut self.ranges.get_mut(&vertex).expect("range").attachments),
            VertexKind::ResultSet => Ok(self.result_sets.get_mut(&vertex).expect("result set")),
            other => Err(ImportError::MalformedInput {
                line,
                message: format!("{context}: expected range or result set, found {other:?}"),
            }),
        }
    }

    /// Final validation after the stream ends.
    pub fn finish(self) -> Result<Self, ImportError> {
        if self.lsif_version.is_none() {
            return Err(ImportError::MalformedInput {
                line: 0,
                message: "stream ended before a metaData vertex".to_string(),
            });
        }
        Ok(self)
    }
}

fn single(in_vs: &[VertexId], line: u64, label: &str) -> Result<VertexId, ImportError> {
    if in_vs.len() == 1 {
        Ok(in_vs[0])
    } else {
        Err(ImportError::MalformedInput {
            line,
            message: format!("{label} edge must have exactly one inV"),
        })
    }
}

/// Supported metaData versions: 0.4.x.
fn check_version(version: &str) -> Result<(), ImportError> {
    let mut parts = version.split('.');
    let major = parts.next().unwrap_or("");
    let minor = parts.next().unwrap_or("");
    if major == "0" && minor == "4" {
        Ok(())
    } else {
        Err(ImportError::UnsupportedVersion {
            version: version.to_string(),
        })
    }
}

/// Strip the leading `file:///` project-root prefix style down to the raw
/// uri; producers emit document uris relative to the project root.
fn relative_uri(uri: &str) -> String {
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}
