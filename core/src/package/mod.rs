//! The release package: a complete description of one software release as
//! components and files over a per-release chunk dictionary.
//!
//! The model here is the in-memory form. `codec` moves it to and from the
//! `.rdef` container, `builder` assembles it from chunk maps, and `patch`
//! derives and applies parent-to-child deltas (`.rdpk`).

pub mod builder;
pub mod codec;
pub mod patch;

use crate::codec::refpack::DeltaChunkRef;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Release-level metadata carried in the `.rdef` metadata section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleaseMeta {
    pub version: String,
    pub release_id: String,
    pub repo_id: String,
    pub notes: Option<String>,
    pub custom_properties: BTreeMap<String, String>,
    /// Unix-second resolution; sub-second precision does not survive the
    /// codec and is truncated on construction.
    pub created_at: i64,
}

impl ReleaseMeta {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_at, 0)
    }
}

/// How a file's chunk sequence is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChunks {
    /// The sequence is spelled out on the file itself.
    Inline(Vec<DeltaChunkRef>),
    /// The sequence lives in the release's content-id table, shared with
    /// every other file of identical content.
    ContentId(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFile {
    pub name: String,
    pub file_hash: Hash32,
    pub chunks: FileChunks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub files: Vec<ReleaseFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseStats {
    pub component_count: u64,
    pub file_count: u64,
    pub chunk_count: u64,
    pub raw_size: u64,
    pub deduped_size: u64,
}

/// One resolved piece of a file: which stored chunk, and which byte range
/// of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePart {
    pub chunk: Hash32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleasePackage {
    pub meta: ReleaseMeta,
    /// Per-release chunk dictionary; positions are the local indices the
    /// delta-encoded chunk refs resolve against.
    pub chunks: Vec<Hash32>,
    /// Substring dictionary for component and file names. Positional ids;
    /// order is part of the format.
    pub string_table: Vec<String>,
    pub content_ids: BTreeMap<u64, Vec<DeltaChunkRef>>,
    pub components: Vec<Component>,
    pub stats: ReleaseStats,
}

impl ReleasePackage {
    /// The chunk-ref sequence behind `file`, whether inline or shared.
    pub fn refs_of<'a>(&'a self, file: &'a ReleaseFile) -> Result<&'a [DeltaChunkRef]> {
        match &file.chunks {
            FileChunks::Inline(refs) => Ok(refs),
            FileChunks::ContentId(id) => self
                .content_ids
                .get(id)
                .map(Vec::as_slice)
                .ok_or_else(|| Error::Format(format!("unknown content id {id}"))),
        }
    }

    /// Resolve a ref sequence to absolute positions in the chunk table.
    pub fn absolute_indices(refs: &[DeltaChunkRef]) -> Vec<u64> {
        let mut cursor = 0u64;
        refs.iter()
            .map(|r| {
                cursor += u64::from(r.delta_index);
                cursor
            })
            .collect()
    }

    /// Expand a file to `(chunk hash, offset, length)` parts.
    pub fn expand_file(&self, file: &ReleaseFile) -> Result<Vec<FilePart>> {
        let refs = self.refs_of(file)?;
        let indices = Self::absolute_indices(refs);
        refs.iter()
            .zip(indices)
            .map(|(r, idx)| {
                let chunk = self.chunks.get(idx as usize).copied().ok_or_else(|| {
                    Error::Format(format!(
                        "chunk index {idx} out of range (table has {})",
                        self.chunks.len()
                    ))
                })?;
                Ok(FilePart {
                    chunk,
                    offset: r.offset,
                    length: r.length,
                })
            })
            .collect()
    }

    /// Total payload size of a file, from its ref lengths.
    pub fn file_size(&self, file: &ReleaseFile) -> Result<u64> {
        Ok(self.refs_of(file)?.iter().map(|r| r.length).sum())
    }

    /// Every `(component, file)` pair in release order.
    pub fn iter_files(&self) -> impl Iterator<Item = (&Component, &ReleaseFile)> {
        self.components
            .iter()
            .flat_map(|c| c.files.iter().map(move |f| (c, f)))
    }

    /// Find one component by name.
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Reassemble a file's bytes through a chunk fetcher.
    ///
    /// `fetch` returns the full decompressed payload of a stored chunk;
    /// parts slice into it per their offset/length.
    pub fn reassemble_file(
        &self,
        file: &ReleaseFile,
        mut fetch: impl FnMut(&Hash32) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let parts = self.expand_file(file)?;
        let total: u64 = parts.iter().map(|p| p.length).sum();
        let mut out = Vec::with_capacity(total as usize);
        for part in parts {
            let payload = fetch(&part.chunk)?;
            let start = usize::try_from(part.offset)
                .map_err(|_| Error::Format("chunk offset overflows usize".into()))?;
            let end = start
                .checked_add(part.length as usize)
                .filter(|&e| e <= payload.len())
                .ok_or_else(|| {
                    Error::Format(format!(
                        "file part [{start}, +{}) exceeds chunk payload of {} bytes",
                        part.length,
                        payload.len()
                    ))
                })?;
            out.extend_from_slice(&payload[start..end]);
        }
        Ok(out)
    }

    /// Structural validation: every ref resolves, every content id exists,
    /// stats agree with the tree.
    pub fn validate(&self) -> Result<()> {
        let mut file_count = 0u64;
        for (_, file) in self.iter_files() {
            self.expand_file(file)?;
            file_count += 1;
        }
        if self.stats.component_count != self.components.len() as u64 {
            return Err(Error::Format(format!(
                "stats declare {} components, tree has {}",
                self.stats.component_count,
                self.components.len()
            )));
        }
        if self.stats.file_count != file_count {
            return Err(Error::Format(format!(
                "stats declare {} files, tree has {file_count}",
                self.stats.file_count
            )));
        }
        if self.stats.chunk_count != self.chunks.len() as u64 {
            return Err(Error::Format(format!(
                "stats declare {} chunks, table has {}",
                self.stats.chunk_count,
                self.chunks.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash32 {
        Hash32::compute(&[n])
    }

    fn two_chunk_file(name: &str) -> (ReleasePackage, ReleaseFile) {
        let chunks = vec![h(1), h(2), h(3)];
        let file = ReleaseFile {
            name: name.to_string(),
            file_hash: h(9),
            chunks: FileChunks::Inline(vec![
                DeltaChunkRef { delta_index: 1, offset: 0, length: 10 },
                DeltaChunkRef { delta_index: 1, offset: 0, length: 5 },
            ]),
        };
        let pkg = ReleasePackage {
            chunks,
            components: vec![Component {
                name: "bin".into(),
                files: vec![file.clone()],
            }],
            stats: ReleaseStats {
                component_count: 1,
                file_count: 1,
                chunk_count: 3,
                raw_size: 15,
                deduped_size: 15,
            },
            ..Default::default()
        };
        (pkg, file)
    }

    #[test]
    fn absolute_indices_are_prefix_sums() {
        let refs = [
            DeltaChunkRef { delta_index: 2, offset: 0, length: 1 },
            DeltaChunkRef { delta_index: 0, offset: 0, length: 1 },
            DeltaChunkRef { delta_index: 3, offset: 0, length: 1 },
        ];
        assert_eq!(ReleasePackage::absolute_indices(&refs), vec![2, 2, 5]);
    }

    #[test]
    fn expand_resolves_hashes() {
        let (pkg, file) = two_chunk_file("app");
        let parts = pkg.expand_file(&file).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chunk, h(2));
        assert_eq!(parts[1].chunk, h(3));
        assert_eq!(pkg.file_size(&file).unwrap(), 15);
    }

    #[test]
    fn out_of_range_ref_is_rejected() {
        let (mut pkg, file) = two_chunk_file("app");
        pkg.chunks.truncate(1);
        assert!(pkg.expand_file(&file).is_err());
    }

    #[test]
    fn reassembly_slices_parts() {
        let (pkg, file) = two_chunk_file("app");
        let out = pkg
            .reassemble_file(&file, |hash| {
                if *hash == h(2) {
                    Ok(b"0123456789".to_vec())
                } else {
                    Ok(b"abcde".to_vec())
                }
            })
            .unwrap();
        assert_eq!(out, b"0123456789abcde");
    }

    #[test]
    fn missing_content_id_is_format_error() {
        let (pkg, _) = two_chunk_file("app");
        let file = ReleaseFile {
            name: "other".into(),
            file_hash: h(8),
            chunks: FileChunks::ContentId(42),
        };
        assert!(matches!(pkg.refs_of(&file), Err(Error::Format(_))));
    }
}
