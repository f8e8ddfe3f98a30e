//! Release-to-release delta manifests.
//!
//! Given an old and a new release, work out which files changed and which
//! chunks a client holding the old release is actually missing. The
//! manifest travels as `delta-manifest.json` at the head of a delta
//! archive; the unique-new-chunk list decides which payloads ride along.

use crate::error::{Error, Result};
use crate::hash::{Hash32, Hash8};
use crate::package::ReleasePackage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Name-level fingerprint of a file's place in the release tree. The
/// NUL separator keeps `("a", "b/c")` and `("a/b", "c")` distinct.
fn path_key(component: &str, path: &str) -> Hash8 {
    let mut buf = Vec::with_capacity(component.len() + 1 + path.len());
    buf.extend_from_slice(component.as_bytes());
    buf.push(0);
    buf.extend_from_slice(path.as_bytes());
    Hash8::compute(&buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSource {
    /// Path did not exist in the old release.
    New,
    /// Same path, same content; nothing to transfer.
    Keep,
    /// Same path, different content.
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    /// The old release already holds this chunk.
    Existing,
    /// Must be fetched; listed in the archive's chunk payloads.
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaChunk {
    pub hash: Hash32,
    pub length: u64,
    pub source: ChunkSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaFile {
    pub component: String,
    pub path: String,
    pub file_hash: Hash32,
    pub size: u64,
    pub source: FileSource,
    /// Chunk plan; empty for `keep` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<DeltaChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaManifest {
    pub old_id: String,
    pub new_id: String,
    pub files: Vec<DeltaFile>,
}

/// A manifest plus the deduplicated transfer lists derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPlan {
    pub manifest: DeltaManifest,
    pub unique_new_chunks: Vec<Hash32>,
    pub unique_new_files: Vec<Hash32>,
}

/// Chunk sequences supplied for new file identities, as
/// `(chunk hash, length)` pairs. A negative length defers to the chunk
/// catalog.
pub type FileChunkMap = HashMap<Hash32, Vec<(Hash32, i64)>>;

/// Known stored-chunk lengths, keyed by chunk hash.
pub type ChunkCatalog = HashMap<Hash32, u64>;

fn resolve_length(hash: &Hash32, declared: i64, catalog: &ChunkCatalog) -> Result<u64> {
    if declared >= 0 {
        return Ok(declared as u64);
    }
    catalog.get(hash).copied().ok_or_else(|| {
        Error::NotFound(format!("chunk {hash} absent from catalog while resolving length"))
    })
}

/// Compute the delta between two releases, optionally restricted to one
/// component.
pub fn compute_delta(
    old: &ReleasePackage,
    new: &ReleasePackage,
    component_filter: Option<&str>,
    file_chunks: &FileChunkMap,
    chunk_catalog: &ChunkCatalog,
) -> Result<DeltaPlan> {
    let in_scope = |name: &str| component_filter.map_or(true, |f| f == name);

    // Index the old side: path fingerprints, file identities, and the
    // chunk multiset delta consumption draws from.
    let mut old_paths: HashMap<Hash8, Hash32> = HashMap::new();
    let mut old_file_hashes: HashSet<Hash32> = HashSet::new();
    let mut old_chunk_counts: HashMap<Hash32, u64> = HashMap::new();
    for (component, file) in old.iter_files() {
        if !in_scope(&component.name) {
            continue;
        }
        old_paths.insert(path_key(&component.name, &file.name), file.file_hash);
        old_file_hashes.insert(file.file_hash);
        for part in old.expand_file(file)? {
            *old_chunk_counts.entry(part.chunk).or_default() += 1;
        }
    }

    let mut files = Vec::new();
    let mut unique_new_chunks = Vec::new();
    let mut seen_new_chunks: HashSet<Hash32> = HashSet::new();
    let mut unique_new_files = Vec::new();
    let mut seen_new_files: HashSet<Hash32> = HashSet::new();

    for (component, file) in new.iter_files() {
        if !in_scope(&component.name) {
            continue;
        }
        let source = match old_paths.get(&path_key(&component.name, &file.name)) {
            Some(old_hash) if *old_hash == file.file_hash => FileSource::Keep,
            Some(_) => FileSource::Modified,
            None => FileSource::New,
        };

        // Chunk sequences come from the caller-supplied map when present
        // (freshly negotiated uploads), else from the release itself.
        let sequence: Vec<(Hash32, u64)> = match file_chunks.get(&file.file_hash) {
            Some(entries) => entries
                .iter()
                .map(|(hash, len)| Ok((*hash, resolve_length(hash, *len, chunk_catalog)?)))
                .collect::<Result<_>>()?,
            None => new
                .expand_file(file)?
                .into_iter()
                .map(|p| (p.chunk, p.length))
                .collect(),
        };
        let size: u64 = sequence.iter().map(|(_, len)| len).sum();

        let chunks = if source == FileSource::Keep {
            Vec::new()
        } else {
            if !old_file_hashes.contains(&file.file_hash)
                && seen_new_files.insert(file.file_hash)
            {
                unique_new_files.push(file.file_hash);
            }
            sequence
                .iter()
                .map(|(hash, length)| {
                    let available = old_chunk_counts.get_mut(hash);
                    let chunk_source = match available {
                        Some(count) if *count > 0 => {
                            *count -= 1;
                            ChunkSource::Existing
                        }
                        _ => {
                            if seen_new_chunks.insert(*hash) {
                                unique_new_chunks.push(*hash);
                            }
                            ChunkSource::New
                        }
                    };
                    DeltaChunk {
                        hash: *hash,
                        length: *length,
                        source: chunk_source,
                    }
                })
                .collect()
        };

        files.push(DeltaFile {
            component: component.name.clone(),
            path: file.name.clone(),
            file_hash: file.file_hash,
            size,
            source,
            chunks,
        });
    }

    Ok(DeltaPlan {
        manifest: DeltaManifest {
            old_id: old.meta.release_id.clone(),
            new_id: new.meta.release_id.clone(),
            files,
        },
        unique_new_chunks,
        unique_new_files,
    })
}
