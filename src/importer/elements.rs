//! Serde model of the LSIF vertex/edge stream
//!
//! Each decompressed input line is one JSON object with `id`, `type`, and
//! `label`. Source ids are opaque tokens (integers or strings); they are
//! interned away immediately after parsing. Unknown vertex and edge labels
//! are tolerated for forward compatibility; anything structurally invalid
//! is a [`ImportError::MalformedInput`].

use super::ImportError;
use crate::models::{MonikerKind, Position, Range};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// An element id as it appears in the source graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum LsifId {
    Number(u64),
    String(String),
}

impl fmt::Display for LsifId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LsifId::Number(n) => write!(f, "{n}"),
            LsifId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Element {
    Vertex { id: LsifId, vertex: Vertex },
    Edge { edge: Edge },
}

#[derive(Debug, Clone)]
pub enum Vertex {
    MetaData {
        version: String,
    },
    Project,
    Document {
        uri: String,
    },
    Range {
        range: Range,
    },
    ResultSet,
    DefinitionResult,
    ReferenceResult,
    HoverResult {
        contents: String,
    },
    Moniker {
        kind: MonikerKind,
        scheme: String,
        identifier: String,
    },
    PackageInformation {
        name: String,
        version: String,
    },
    /// Forward compatibility: `$event` and friends carry no facts we index.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLabel {
    Contains,
    Next,
    Item,
    TextDocumentDefinition,
    TextDocumentReferences,
    TextDocumentHover,
    Moniker,
    NextMoniker,
    PackageInformation,
    Ignored,
}

/// Distinguishes the member lists an `item` edge appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemProperty {
    Definitions,
    References,
    /// Links two reference results for later merging.
    ReferenceResults,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub label: EdgeLabel,
    pub out_v: LsifId,
    pub in_vs: Vec<LsifId>,
    /// Only `item` edges carry a document.
    pub document: Option<LsifId>,
    pub property: Option<ItemProperty>,
}

#[derive(Debug, Deserialize)]
struct PositionPayload {
    line: u32,
    character: u32,
}

#[derive(Debug, Deserialize)]
struct RangePayload {
    start: PositionPayload,
    end: PositionPayload,
}

fn malformed(line: u64, message: impl Into<String>) -> ImportError {
    ImportError::MalformedInput {
        line,
        message: message.into(),
    }
}

/// Parse one decompressed line. `line_number` is 1-based and only used for
/// error reporting.
pub fn parse_line(input: &str, line_number: u64) -> Result<Element, ImportError> {
    let value: Value = serde_json::from_str(input)
        .map_err(|err| malformed(line_number, format!("not a JSON object: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| malformed(line_number, "element is not an object"))?;

    let element_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(line_number, "missing element type"))?;

    match element_type {
        "vertex" => {
            let id = parse_id(object.get("id"), line_number)?;
            let vertex = parse_vertex(object, line_number)?;
            Ok(Element::Vertex { id, vertex })
        }
        "edge" => Ok(Element::Edge {
            edge: parse_edge(object, line_number)?,
        }),
        other => Err(malformed(line_number, format!("unknown element type {other:?}"))),
    }
}

fn parse_id(value: Option<&Value>, line_number: u64) -> Result<LsifId, ImportError> {
    let value = value.ok_or_else(|| malformed(line_number, "missing id"))?;
    serde_json::from_value(value.clone())
        .map_err(|_| malformed(line_number, "id must be a number or string"))
}

fn parse_vertex(
    object: &serde_json::Map<String, Value>,
    line_number: u64,
) -> Result<Vertex, ImportError> {
    let label = object
        .get("label")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(line_number, "missing vertex label"))?;

    match label {
        "metaData" => {
            let version = object
                .get("version")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(line_number, "metaData without version"))?;
            Ok(Vertex::MetaData {
                version: version.to_string(),
            })
        }
        "project" => Ok(Vertex::Project),
        "document" => {
            let uri = object
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(line_number, "document without uri"))?;
            Ok(Vertex::Document {
                uri: uri.to_string(),
            })
        }
        "range" => {
            let payload: RangePayload = serde_json::from_value(Value::Object(object.clone()))
                .map_err(|err| malformed(line_number, format!("bad range: {err}")))?;
            Ok(Vertex::Range {
                range: Range {
                    start: Position {
                        line: payload.start.line,
                        character: payload.start.character,
                    },
                    end: Position {
                        line: payload.end.line,
                        character: payload.end.character,
                    },
                },
            })
        }
        "resultSet" => Ok(Vertex::ResultSet),
        "definitionResult" => Ok(Vertex::DefinitionResult),
        "referenceResult" => Ok(Vertex::ReferenceResult),
        "hoverResult" => {
            let contents = object
                .get("result")
                .and_then(|result| result.get("contents"))
                .and_then(hover_text)
                .ok_or_else(|| malformed(line_number, "hoverResult without contents"))?;
            Ok(Vertex::HoverResult { contents })
        }
        "moniker" => {
            let scheme = object
                .get("scheme")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(line_number, "moniker without scheme"))?;
            let identifier = object
                .get("identifier")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(line_number, "moniker without identifier"))?;
            let kind = match object.get("kind").and_then(Value::as_str) {
                Some("import") => MonikerKind::Import,
                Some("export") => MonikerKind::Export,
                // Absent and unrecognized kinds stay private to the dump.
                _ => MonikerKind::Local,
            };
            Ok(Vertex::Moniker {
                kind,
                scheme: scheme.to_string(),
                identifier: identifier.to_string(),
            })
        }
        "packageInformation" => {
            let name = object
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(line_number, "packageInformation without name"))?;
            let version = object
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(Vertex::PackageInformation {
                name: name.to_string(),
                version,
            })
        }
        _ => Ok(Vertex::Ignored),
    }
}

fn parse_edge(
    object: &serde_json::Map<String, Value>,
    line_number: u64,
) -> Result<Edge, ImportError> {
    let label = match object.get("label").and_then(Value::as_str) {
        Some("contains") => EdgeLabel::Contains,
        Some("next") => EdgeLabel::Next,
        Some("item") => EdgeLabel::Item,
        Some("textDocument/definition") => EdgeLabel::TextDocumentDefinition,
        Some("textDocument/references") => EdgeLabel::TextDocumentReferences,
        Some("textDocument/hover") => EdgeLabel::TextDocumentHover,
        Some("moniker") => EdgeLabel::Moniker,
        Some("nextMoniker") => EdgeLabel::NextMoniker,
        Some("packageInformation") => EdgeLabel::PackageInformation,
        Some(_) => EdgeLabel::Ignored,
        None => return Err(malformed(line_number, "missing edge label")),
    };

    let out_v = parse_id(object.get("outV"), line_number)?;
    let in_vs = if let Some(many) = object.get("inVs") {
        let many = many
            .as_array()
            .ok_or_else(|| malformed(line_number, "inVs must be an array"))?;
        many.iter()
            .map(|v| parse_id(Some(v), line_number))
            .collect::<Result<Vec<_>, _>>()?
    } else if object.get("inV").is_some() {
        vec![parse_id(object.get("inV"), line_number)?]
    } else if label == EdgeLabel::Ignored {
        Vec::new()
    } else {
        return Err(malformed(line_number, "edge without inV or inVs"));
    };

    let document = match object.get("document") {
        Some(value) => Some(parse_id(Some(value), line_number)?),
        None => None,
    };

    let property = match object.get("property").and_then(Value::as_str) {
        Some("definitions") => Some(ItemProperty::Definitions),
        Some("references") => Some(ItemProperty::References),
        Some("referenceResults") => Some(ItemProperty::ReferenceResults),
        Some(other) => {
            return Err(malformed(
                line_number,
                format!("unknown item property {other:?}"),
            ))
        }
        None => None,
    };

    Ok(Edge {
        label,
        out_v,
        in_vs,
        document,
        property,
    })
}

/// Normalize the LSP hover shapes (plain string, markup content, marked
/// string, or an array of those) into one displayable string.
fn hover_text(contents: &Value) -> Option<String> {
    match contents {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let value = map.get("value").and_then(Value::as_str)?;
            match map.get("language").and_then(Value::as_str) {
                Some(language) => Some(format!("```{language}\n{value}\n```")),
                None => Some(value.to_string()),
            }
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(hover_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n\n---\n\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_data() {
        let element = parse_line(
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///test"}"#,
            1,
        )
        .unwrap();
        match element {
            Element::Vertex {
                id: LsifId::Number(1),
                vertex: Vertex::MetaData { version },
            } => assert_eq!(version, "0.4.3"),
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn test_parse_range_vertex() {
        let element = parse_line(
            r#"{"id":"r1","type":"vertex","label":"range","start":{"line":1,"character":4},"end":{"line":1,"character":7}}"#,
            2,
        )
        .unwrap();
        match element {
            Element::Vertex {
                vertex: Vertex::Range { range },
                ..
            } => assert_eq!(range, Range::new(1, 4, 1, 7)),
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn test_parse_item_edge_with_property() {
        let element = parse_line(
            r#"{"id":9,"type":"edge","label":"item","outV":5,"inVs":[2,3],"document":4,"property":"references"}"#,
            3,
        )
        .unwrap();
        match element {
            Element::Edge { edge } => {
                assert_eq!(edge.label, EdgeLabel::Item);
                assert_eq!(edge.in_vs.len(), 2);
                assert_eq!(edge.property, Some(ItemProperty::References));
                assert!(edge.document.is_some());
            }
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn test_hover_shapes() {
        assert_eq!(hover_text(&serde_json::json!("plain")).unwrap(), "plain");
        assert_eq!(
            hover_text(&serde_json::json!({"language":"ts","value":"let x"})).unwrap(),
            "```ts\nlet x\n```"
        );
        assert_eq!(
            hover_text(&serde_json::json!({"kind":"markdown","value":"**x**"})).unwrap(),
            "**x**"
        );
        assert!(hover_text(&serde_json::json!(42)).is_none());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_line("not json", 1).is_err());
        assert!(parse_line(r#"{"type":"vertex"}"#, 1).is_err());
        assert!(parse_line(r#"{"id":1,"type":"widget","label":"range"}"#, 1).is_err());
        assert!(parse_line(r#"{"id":1,"type":"edge","label":"next","outV":2}"#, 1).is_err());
    }

    #[test]
    fn test_unknown_labels_are_tolerated() {
        let element = parse_line(
            r#"{"id":1,"type":"vertex","label":"$event","kind":"begin"}"#,
            1,
        )
        .unwrap();
        assert!(matches!(
            element,
            Element::Vertex {
                vertex: Vertex::Ignored,
                ..
            }
        ));
    }
}
