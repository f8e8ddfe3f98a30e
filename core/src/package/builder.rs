//! Assembles a [`ReleasePackage`] from per-file chunk sequences.
//!
//! The chunk table is built in reference order with one constraint: a
//! file's sequence must resolve to non-decreasing table positions, because
//! chunk refs store non-negative deltas over a per-file cursor. Reuse is
//! therefore forward-only; a backward reference appends a duplicate table
//! entry instead of encoding a negative jump. Identical whole files never
//! hit that path twice, as shared content is encoded once through the
//! content-id table.

use super::{
    Component, FileChunks, FilePart, ReleaseFile, ReleaseMeta, ReleasePackage, ReleaseStats,
};
use crate::chunker::ChunkMap;
use crate::codec::refpack::DeltaChunkRef;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use std::collections::HashMap;

/// One file's resolved content: its identity plus the chunk parts that
/// concatenate to its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSeq {
    pub name: String,
    pub file_hash: Hash32,
    pub parts: Vec<FilePart>,
}

impl FileSeq {
    /// Adopt a chunker result as a file sequence. Parts consume whole
    /// chunks; the identity is BLAKE3 over the chunk checksum list.
    pub fn from_chunk_map(name: impl Into<String>, map: &ChunkMap) -> Self {
        Self {
            name: name.into(),
            file_hash: map.file_hash(),
            parts: map
                .entries
                .iter()
                .map(|e| FilePart {
                    chunk: e.checksum,
                    offset: 0,
                    length: u64::from(e.length),
                })
                .collect(),
        }
    }

    pub fn size(&self) -> u64 {
        self.parts.iter().map(|p| p.length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSeq {
    pub name: String,
    pub files: Vec<FileSeq>,
}

/// Forward-only chunk table under construction. Also backs the patch
/// codec's patch-local chunk dictionary.
#[derive(Debug, Default)]
pub(crate) struct ChunkTable {
    entries: Vec<Hash32>,
    // Ascending table positions per hash; duplicates appear when a file
    // needed a backward reference.
    positions: HashMap<Hash32, Vec<usize>>,
}

impl ChunkTable {
    pub(crate) fn into_entries(self) -> Vec<Hash32> {
        self.entries
    }

    /// Encode one part sequence as delta refs, appending table entries as
    /// needed so every delta stays non-negative.
    pub(crate) fn encode_refs(&mut self, parts: &[FilePart]) -> Result<Vec<DeltaChunkRef>> {
        let mut refs = Vec::with_capacity(parts.len());
        let mut cursor = 0usize;
        for part in parts {
            let reusable = self.positions.get(&part.chunk).and_then(|list| {
                let at = list.partition_point(|&i| i < cursor);
                list.get(at).copied()
            });
            let index = match reusable {
                Some(index) => index,
                None => {
                    let index = self.entries.len();
                    self.entries.push(part.chunk);
                    self.positions.entry(part.chunk).or_default().push(index);
                    index
                }
            };
            let delta = u32::try_from(index - cursor)
                .map_err(|_| Error::Format("chunk table delta exceeds u32".into()))?;
            refs.push(DeltaChunkRef {
                delta_index: delta,
                offset: part.offset,
                length: part.length,
            });
            cursor = index;
        }
        Ok(refs)
    }
}

/// Build a release package from chunker output.
pub fn build_package(meta: ReleaseMeta, components: Vec<ComponentSeq>) -> Result<ReleasePackage> {
    assemble(meta, &components, &[])
}

/// Core assembly, shared with patch application. `table_seed` pre-loads
/// the string table (patches pin the child's table explicitly).
pub(crate) fn assemble(
    meta: ReleaseMeta,
    components: &[ComponentSeq],
    table_seed: &[String],
) -> Result<ReleasePackage> {
    // Shared content: any file identity appearing more than once is
    // stored through the content-id table.
    let mut occurrences: HashMap<Hash32, u32> = HashMap::new();
    for component in components {
        for file in &component.files {
            *occurrences.entry(file.file_hash).or_default() += 1;
        }
    }

    let mut table = ChunkTable::default();
    let mut content_ids = std::collections::BTreeMap::new();
    let mut assigned: HashMap<Hash32, u64> = HashMap::new();
    let mut next_content_id = 0u64;

    let mut out_components = Vec::with_capacity(components.len());
    let mut raw_size = 0u64;
    let mut file_count = 0u64;
    let mut chunk_lengths: HashMap<Hash32, u64> = HashMap::new();

    for component in components {
        let mut files = Vec::with_capacity(component.files.len());
        for file in &component.files {
            raw_size += file.size();
            file_count += 1;
            for part in &file.parts {
                let seen = chunk_lengths.entry(part.chunk).or_default();
                *seen = (*seen).max(part.offset + part.length);
            }

            let chunks = if occurrences[&file.file_hash] > 1 {
                let id = match assigned.get(&file.file_hash) {
                    Some(&id) => id,
                    None => {
                        let id = next_content_id;
                        next_content_id += 1;
                        let refs = table.encode_refs(&file.parts)?;
                        content_ids.insert(id, refs);
                        assigned.insert(file.file_hash, id);
                        id
                    }
                };
                FileChunks::ContentId(id)
            } else {
                FileChunks::Inline(table.encode_refs(&file.parts)?)
            };
            files.push(ReleaseFile {
                name: file.name.clone(),
                file_hash: file.file_hash,
                chunks,
            });
        }
        out_components.push(Component {
            name: component.name.clone(),
            files,
        });
    }

    let stats = ReleaseStats {
        component_count: out_components.len() as u64,
        file_count,
        chunk_count: table.entries.len() as u64,
        raw_size,
        deduped_size: chunk_lengths.values().sum(),
    };

    let mut pkg = ReleasePackage {
        meta,
        chunks: table.entries,
        string_table: Vec::new(),
        content_ids,
        components: out_components,
        stats,
    };
    let names = super::codec::tokenize_names(&pkg, table_seed)?;
    pkg.string_table = names.table;
    pkg.validate()?;
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::chunker::{chunk_bytes, ChunkerOptions};
    use crate::package::codec::{decode_package, encode_package, CodecOptions};

    fn meta() -> ReleaseMeta {
        ReleaseMeta {
            version: "1.0.0".into(),
            release_id: "rel-a".into(),
            repo_id: "repo-a".into(),
            created_at: 1_700_000_000,
            ..Default::default()
        }
    }

    fn seq_of(name: &str, data: &[u8]) -> FileSeq {
        let opts = ChunkerOptions::new(64, 256, 1024).unwrap();
        let map = chunk_bytes(data, &opts, &CancelToken::new()).unwrap();
        FileSeq::from_chunk_map(name, &map)
    }

    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn builds_single_file_release() {
        let data = [0x41, 0x42, 0x43];
        let opts = ChunkerOptions::new(8, 16, 64).unwrap();
        let map = chunk_bytes(&data, &opts, &CancelToken::new()).unwrap();
        let pkg = build_package(
            meta(),
            vec![ComponentSeq {
                name: "bin".into(),
                files: vec![FileSeq::from_chunk_map("app", &map)],
            }],
        )
        .unwrap();

        assert_eq!(pkg.chunks, vec![Hash32::compute(&data)]);
        assert_eq!(pkg.stats.file_count, 1);
        assert_eq!(pkg.stats.raw_size, 3);
        let (_, file) = pkg.iter_files().next().unwrap();
        assert_eq!(pkg.file_size(file).unwrap(), 3);
    }

    #[test]
    fn duplicate_files_share_a_content_id() {
        let payload = noise(4096, 9);
        let pkg = build_package(
            meta(),
            vec![ComponentSeq {
                name: "bin".into(),
                files: vec![
                    seq_of("a.bin", &payload),
                    seq_of("copy/a.bin", &payload),
                    seq_of("unique.bin", &noise(2048, 10)),
                ],
            }],
        )
        .unwrap();

        assert_eq!(pkg.content_ids.len(), 1);
        let files: Vec<_> = pkg.iter_files().map(|(_, f)| f).collect();
        assert_eq!(files[0].chunks, FileChunks::ContentId(0));
        assert_eq!(files[1].chunks, FileChunks::ContentId(0));
        assert!(matches!(files[2].chunks, FileChunks::Inline(_)));
        // Shared bytes are counted once in the chunk table.
        assert!(pkg.stats.deduped_size < pkg.stats.raw_size);
    }

    #[test]
    fn cross_file_reuse_keeps_deltas_non_negative() {
        let shared = noise(4096, 3);
        let mut second = noise(2048, 4);
        second.extend_from_slice(&shared);

        let pkg = build_package(
            meta(),
            vec![ComponentSeq {
                name: "data".into(),
                files: vec![seq_of("one.bin", &shared), seq_of("two.bin", &second)],
            }],
        )
        .unwrap();

        // Expansion succeeding means every delta resolved in-bounds and
        // forward; verify content equality through reassembly order.
        for (_, file) in pkg.iter_files() {
            let parts = pkg.expand_file(file).unwrap();
            assert!(!parts.is_empty());
        }
    }

    #[test]
    fn built_package_round_trips_through_codec() {
        let pkg = build_package(
            meta(),
            vec![
                ComponentSeq {
                    name: "bin".into(),
                    files: vec![seq_of("app/main", &noise(8192, 1))],
                },
                ComponentSeq {
                    name: "lib".into(),
                    files: vec![
                        seq_of("libx.so", &noise(4096, 2)),
                        seq_of("liby.so", &noise(4096, 2)),
                    ],
                },
            ],
        )
        .unwrap();

        let bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        assert_eq!(decode_package(&bytes).unwrap(), pkg);
    }

    #[test]
    fn sum_of_ref_lengths_equals_file_size() {
        let payload = noise(10_000, 77);
        let pkg = build_package(
            meta(),
            vec![ComponentSeq {
                name: "bin".into(),
                files: vec![seq_of("f", &payload)],
            }],
        )
        .unwrap();
        let (_, file) = pkg.iter_files().next().unwrap();
        assert_eq!(pkg.file_size(file).unwrap(), payload.len() as u64);
    }
}
