//! LSIF importer
//!
//! Streams a gzipped JSON-per-line LSIF graph, validates it, and produces
//! a dump store plus the cross-repository package summaries. Conceptually
//! three passes — ingest, canonicalize, emit — with resolution deferred to
//! the end of the stream so any topological order of definitions and uses
//! is tolerated. The importer is fail-fast: the first bad line aborts the
//! whole conversion.

mod canonicalize;
mod correlator;
mod elements;
mod emitter;

pub use emitter::ImportSummary;

use crate::dump::DumpWriter;
use crate::error::Result;
use canonicalize::canonicalize;
use correlator::Correlator;
use elements::parse_line;
use flate2::read::GzDecoder;
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ImportError {
    /// A line violated the element schema.
    #[error("malformed LSIF input at line {line}: {message}")]
    MalformedInput { line: u64, message: String },

    /// The metaData version is outside the accepted range.
    #[error("unsupported LSIF version {version}")]
    UnsupportedVersion { version: String },

    /// An edge referenced an id that was never defined.
    #[error("edge references unknown id {id}")]
    DanglingReference { id: String },
}

/// Convert a gzipped LSIF stream into the dump store behind `writer`.
///
/// On success the store holds the complete dump (written in one
/// transaction) and the returned summary carries the package facts for the
/// cross-repository index. On failure the store contents are undefined and
/// the caller is expected to discard the file.
pub async fn convert(input: impl Read, writer: &DumpWriter) -> Result<ImportSummary> {
    let correlator = correlate(input)?;
    let state = canonicalize(correlator);
    let summary = emitter::emit(writer, state).await?;
    info!(
        documents = summary.num_documents,
        result_chunks = summary.num_result_chunks,
        packages = summary.packages.len(),
        references = summary.references.len(),
        "conversion complete"
    );
    Ok(summary)
}

/// Validate a gzipped LSIF stream without writing anything: every line must
/// parse and correlate. Used by the upload endpoint when validation is
/// requested; conversion re-runs the same checks regardless.
pub fn validate(input: impl Read) -> std::result::Result<(), ImportError> {
    correlate(input).map(|_| ())
}

fn correlate(input: impl Read) -> std::result::Result<Correlator, ImportError> {
    let reader = BufReader::new(GzDecoder::new(input));
    let mut correlator = Correlator::new();
    let mut line_number: u64 = 0;
    for line in reader.lines() {
        line_number += 1;
        let line = line.map_err(|err| ImportError::MalformedInput {
            line: line_number,
            message: format!("unreadable input: {err}"),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let element = parse_line(&line, line_number)?;
        correlator.insert(element, line_number)?;
    }
    correlator.finish()
}
