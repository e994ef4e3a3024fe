//! Blob codec for document and result-chunk payloads
//!
//! Dump stores keep their variable-size payloads as gzip-compressed JSON.
//! The layout is pinned by `ENCODING_VERSION`, which the importer writes
//! into the dump's meta row; decoding refuses a dump written with a
//! different version so the layout can migrate later without silent
//! misreads.

use crate::error::{Error, Result};
use crate::models::{DocumentData, ResultChunkData};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Version of the blob layout. Bump on any change to the `*Data` shapes.
pub const ENCODING_VERSION: i64 = 1;

/// The shard a result id lives in. Writers and readers must agree on this
/// for the lifetime of a dump, so the mix is fixed (splitmix64 finalizer)
/// rather than borrowed from the standard library's unstable hasher.
pub fn result_chunk_index(result_id: u64, num_result_chunks: i64) -> i64 {
    let mut x = result_id.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    (x % num_result_chunks as u64) as i64
}

fn compress<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decompress<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let mut decoder = GzDecoder::new(data);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    serde_json::from_slice(&json)
        .map_err(|err| Error::Fatal(format!("undecodable blob payload: {err}")))
}

pub fn encode_document(document: &DocumentData) -> Result<Vec<u8>> {
    compress(document)
}

pub fn decode_document(data: &[u8], encoding_version: i64) -> Result<DocumentData> {
    check_version(encoding_version)?;
    decompress(data)
}

pub fn encode_result_chunk(chunk: &ResultChunkData) -> Result<Vec<u8>> {
    compress(chunk)
}

pub fn decode_result_chunk(data: &[u8], encoding_version: i64) -> Result<ResultChunkData> {
    check_version(encoding_version)?;
    decompress(data)
}

fn check_version(encoding_version: i64) -> Result<()> {
    if encoding_version != ENCODING_VERSION {
        return Err(Error::Fatal(format!(
            "dump written with encoding version {encoding_version}, expected {ENCODING_VERSION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentIdRangeId, Range, RangeData};

    #[test]
    fn test_document_round_trip() {
        let mut document = DocumentData::default();
        document.ranges.insert(
            3,
            RangeData {
                range: Range::new(1, 4, 1, 7),
                definition_result_id: Some(10),
                reference_result_id: Some(11),
                hover_result_id: None,
                moniker_ids: vec![7],
            },
        );
        document.hover_results.insert(12, "fn foo()".to_string());

        let blob = encode_document(&document).unwrap();
        let decoded = decode_document(&blob, ENCODING_VERSION).unwrap();
        assert_eq!(decoded, document);
    }

    #[test]
    fn test_result_chunk_round_trip() {
        let mut chunk = ResultChunkData::default();
        chunk.document_paths.insert(1, "src/index.ts".to_string());
        chunk.document_id_range_ids.insert(
            10,
            vec![DocumentIdRangeId {
                document_id: 1,
                range_id: 3,
            }],
        );

        let blob = encode_result_chunk(&chunk).unwrap();
        let decoded = decode_result_chunk(&blob, ENCODING_VERSION).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let blob = encode_document(&DocumentData::default()).unwrap();
        let err = decode_document(&blob, ENCODING_VERSION + 1).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_chunk_index_is_stable_and_bounded() {
        for n in [1i64, 2, 7, 1000] {
            for id in 0..64u64 {
                let index = result_chunk_index(id, n);
                assert!((0..n).contains(&index));
                assert_eq!(index, result_chunk_index(id, n));
            }
        }
        // With one chunk everything collapses to shard zero.
        assert_eq!(result_chunk_index(12345, 1), 0);
    }

    #[test]
    fn test_blob_is_actually_compressed() {
        let mut document = DocumentData::default();
        for id in 0..200 {
            document.ranges.insert(
                id,
                RangeData {
                    range: Range::new(id as u32, 0, id as u32, 10),
                    definition_result_id: None,
                    reference_result_id: None,
                    hover_result_id: None,
                    moniker_ids: vec![],
                },
            );
        }
        let blob = encode_document(&document).unwrap();
        let json = serde_json::to_vec(&document).unwrap();
        assert!(blob.len() < json.len());
    }
}
