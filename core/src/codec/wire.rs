//! Ingest-protocol payload framing, shared by client and server.
//!
//! Missing-set negotiation rides the transpose codec directly; the batch
//! endpoints use the framings here. Chunk batches stay uncompressed at the
//! envelope level (chunk payloads are compressed again inside the store);
//! file-definition batches are highly repetitive and ship as one Zstd
//! frame over a chunk-hash dictionary.

use crate::codec::transpose;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::varint;
use std::collections::HashMap;
use std::io::Read;

const FILE_BATCH_ZSTD_LEVEL: i32 = 3;

fn read_hash<R: Read>(input: &mut R) -> Result<Hash32> {
    let mut buf = [0u8; Hash32::LEN];
    input
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof("hash truncated".into()))?;
    Ok(Hash32::new(buf))
}

/// `varint(count)`, then per item `hash32, varint(len), payload bytes`.
pub fn encode_chunk_batch(items: &[(Hash32, Vec<u8>)]) -> Result<Vec<u8>> {
    let payload_total: usize = items.iter().map(|(_, b)| b.len()).sum();
    let mut out = Vec::with_capacity(payload_total + items.len() * 40);
    varint::write_usize(&mut out, items.len())?;
    for (hash, bytes) in items {
        out.extend_from_slice(hash.as_bytes());
        varint::write_usize(&mut out, bytes.len())?;
        out.extend_from_slice(bytes);
    }
    Ok(out)
}

pub fn decode_chunk_batch(data: &[u8]) -> Result<Vec<(Hash32, Vec<u8>)>> {
    let mut cursor = std::io::Cursor::new(data);
    let count = varint::read_usize(&mut cursor)?;
    let mut items = Vec::with_capacity(count.min(65536));
    for _ in 0..count {
        let hash = read_hash(&mut cursor)?;
        let len = varint::read_usize(&mut cursor)?;
        let remaining = data.len() - cursor.position() as usize;
        if len > remaining {
            return Err(Error::UnexpectedEof(format!(
                "chunk batch item declares {len} bytes, {remaining} remain"
            )));
        }
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        items.push((hash, bytes));
    }
    Ok(items)
}

/// One file identity and its chunk sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDefinition {
    pub file_hash: Hash32,
    pub length: u64,
    pub chunks: Vec<Hash32>,
}

/// Zstd-framed: transpose-compressed chunk-hash dictionary, then
/// `varint(N)` entries of `file_hash32, varint(length),
/// varint(chunk_count), chunk_count * varint(dictionary index)`.
pub fn encode_file_definitions(defs: &[FileDefinition]) -> Result<Vec<u8>> {
    let mut dict: Vec<Hash32> = Vec::new();
    let mut dict_index: HashMap<Hash32, usize> = HashMap::new();
    for def in defs {
        for chunk in &def.chunks {
            dict_index.entry(*chunk).or_insert_with(|| {
                dict.push(*chunk);
                dict.len() - 1
            });
        }
    }

    let mut inner = transpose::encode_hashes(&dict)?;
    varint::write_usize(&mut inner, defs.len())?;
    for def in defs {
        inner.extend_from_slice(def.file_hash.as_bytes());
        varint::write_u64(&mut inner, def.length)?;
        varint::write_usize(&mut inner, def.chunks.len())?;
        for chunk in &def.chunks {
            varint::write_usize(&mut inner, dict_index[chunk])?;
        }
    }
    Ok(zstd::stream::encode_all(&inner[..], FILE_BATCH_ZSTD_LEVEL)?)
}

pub fn decode_file_definitions(data: &[u8]) -> Result<Vec<FileDefinition>> {
    let inner = zstd::stream::decode_all(data)
        .map_err(|e| Error::Format(format!("file batch failed to decompress: {e}")))?;

    let (dict, dict_len) = transpose::decode_hashes_prefix(&inner)?;
    let mut cursor = std::io::Cursor::new(&inner[dict_len..]);

    let count = varint::read_usize(&mut cursor)?;
    let mut defs = Vec::with_capacity(count.min(65536));
    for _ in 0..count {
        let file_hash = read_hash(&mut cursor)?;
        let length = varint::read_u64(&mut cursor)?;
        let chunk_count = varint::read_usize(&mut cursor)?;
        let mut chunks = Vec::with_capacity(chunk_count.min(65536));
        for _ in 0..chunk_count {
            let index = varint::read_usize(&mut cursor)?;
            let chunk = dict.get(index).copied().ok_or_else(|| {
                Error::Format(format!(
                    "file batch chunk index {index} out of range (dictionary has {})",
                    dict.len()
                ))
            })?;
            chunks.push(chunk);
        }
        defs.push(FileDefinition {
            file_hash,
            length,
            chunks,
        });
    }
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_batch_round_trips() {
        let items = vec![
            (Hash32::compute(b"a"), b"payload a".to_vec()),
            (Hash32::compute(b""), Vec::new()),
            (Hash32::compute(b"c"), vec![0u8; 5000]),
        ];
        let encoded = encode_chunk_batch(&items).unwrap();
        assert_eq!(decode_chunk_batch(&encoded).unwrap(), items);
    }

    #[test]
    fn empty_chunk_batch_round_trips() {
        let encoded = encode_chunk_batch(&[]).unwrap();
        assert!(decode_chunk_batch(&encoded).unwrap().is_empty());
    }

    #[test]
    fn truncated_chunk_batch_is_rejected() {
        let items = vec![(Hash32::compute(b"x"), vec![1u8; 100])];
        let encoded = encode_chunk_batch(&items).unwrap();
        assert!(decode_chunk_batch(&encoded[..encoded.len() - 20]).is_err());
    }

    #[test]
    fn file_definitions_round_trip_with_shared_dictionary() {
        let shared = Hash32::compute(b"shared");
        let defs = vec![
            FileDefinition {
                file_hash: Hash32::compute(b"file1"),
                length: 1000,
                chunks: vec![shared, Hash32::compute(b"one")],
            },
            FileDefinition {
                file_hash: Hash32::compute(b"file2"),
                length: 500,
                chunks: vec![shared],
            },
            FileDefinition {
                file_hash: Hash32::compute(b"empty"),
                length: 0,
                chunks: vec![],
            },
        ];
        let encoded = encode_file_definitions(&defs).unwrap();
        assert_eq!(decode_file_definitions(&encoded).unwrap(), defs);
    }

    #[test]
    fn garbage_file_batch_is_format_error() {
        assert!(matches!(
            decode_file_definitions(b"not a zstd frame"),
            Err(Error::Format(_))
        ));
    }
}
