//! Parent-to-child release patches (`.rdpk`).
//!
//! A patch carries only what changed: string-table and custom-property
//! deltas, component/file edit scripts, and the chunk sequences of
//! inserted or modified files encoded against a patch-local chunk
//! dictionary. Applying a patch re-assembles the child through the normal
//! builder, so a patch chain reproduces each child exactly as the builder
//! originally produced it.

use super::builder::{assemble, ChunkTable, ComponentSeq, FileSeq};
use super::codec::{
    check_header, read_sections, read_string, write_section, write_string, CodecOptions,
};
use super::{FilePart, ReleaseMeta, ReleasePackage};
use crate::codec::refpack::{self, DeltaChunkRef};
use crate::codec::strtab::{StringTableBuilder, TokenizedString};
use crate::codec::transpose;
use crate::delta::edit::{self, EditOp, EditRun, EditScript};
use crate::error::{Error, Result};
use crate::hash::{Hash32, Hash8};
use crate::varint;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

pub const RDPK_MAGIC: [u8; 4] = *b"BPKD";
pub const RDPK_VERSION: u8 = 1;

const SECTION_METADATA: u8 = 0x01;
const SECTION_CHUNK_DICT: u8 = 0x02;
const SECTION_FILE_HASH_DICT: u8 = 0x03;
const SECTION_STRING_DELTA: u8 = 0x04;
const SECTION_PROPS_DELTA: u8 = 0x05;
const SECTION_EDITS: u8 = 0x06;

const RDPK_SECTIONS: [u8; 6] = [
    SECTION_METADATA,
    SECTION_CHUNK_DICT,
    SECTION_FILE_HASH_DICT,
    SECTION_STRING_DELTA,
    SECTION_PROPS_DELTA,
    SECTION_EDITS,
];

/// One string-table mutation. Ops execute in order against the evolving
/// table, so ids always address the table as it stands mid-application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringTableOp {
    Add { id: u16, value: String },
    Remove { id: u16 },
    Modify { id: u16, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyOp {
    Set { key: String, value: String },
    Remove { key: String },
}

/// Content of an inserted file, expanded to chunk parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub file_hash: Hash32,
    pub parts: Vec<FilePart>,
}

/// A kept-by-name file whose content changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileModify {
    /// Position in the kept component's child file list.
    pub child_position: usize,
    pub file_hash: Hash32,
    pub parts: Vec<FilePart>,
}

/// File-level edits of one kept component.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentFileEdit {
    pub runs: Vec<EditRun>,
    pub inserts: Vec<FilePayload>,
    pub modifies: Vec<FileModify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPayload {
    pub name: String,
    pub files: Vec<FilePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchMeta {
    pub parent_id: String,
    pub release_id: String,
    pub repo_id: String,
    pub version: String,
    pub notes: Option<String>,
    /// Depth in the patch chain rooted at a full release.
    pub level: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleasePackagePatch {
    pub meta: PatchMeta,
    pub string_ops: Vec<StringTableOp>,
    pub property_ops: Vec<PropertyOp>,
    pub component_runs: Vec<EditRun>,
    pub component_inserts: Vec<ComponentPayload>,
    /// One entry per kept component, in keep order.
    pub file_edits: Vec<ComponentFileEdit>,
}

/// Patches are identified by the hash of their encoded bytes.
pub fn patch_id(encoded: &[u8]) -> Hash32 {
    Hash32::compute(encoded)
}

// ---------------------------------------------------------------------------
// Compute
// ---------------------------------------------------------------------------

/// Translate an edit script over the string table into sequential ops.
fn string_table_ops(parent: &[String], child: &[String]) -> Vec<StringTableOp> {
    let script = edit::compute(
        parent,
        child,
        |s| s.clone(),
        |s| s.clone(),
        |s| s.clone(),
    );
    let mut ops = Vec::new();
    let mut index = 0usize;
    let mut inserted = script.inserts.iter();
    for run in &script.runs {
        match run.op {
            EditOp::Keep => index += run.len,
            EditOp::Del => {
                for _ in 0..run.len {
                    ops.push(StringTableOp::Remove { id: index as u16 });
                }
            }
            EditOp::Ins => {
                for _ in 0..run.len {
                    let value = inserted.next().expect("insert payload count matches runs");
                    ops.push(StringTableOp::Add {
                        id: index as u16,
                        value: value.clone(),
                    });
                    index += 1;
                }
            }
        }
    }
    // Adjacent Remove+Add at the same slot collapse into Modify.
    let mut folded: Vec<StringTableOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match (folded.last(), &op) {
            (Some(StringTableOp::Remove { id: removed }), StringTableOp::Add { id, value })
                if removed == id =>
            {
                let value = value.clone();
                let id = *id;
                folded.pop();
                folded.push(StringTableOp::Modify { id, value });
            }
            _ => folded.push(op),
        }
    }
    folded
}

fn apply_string_ops(parent: &[String], ops: &[StringTableOp]) -> Result<Vec<String>> {
    let mut table = parent.to_vec();
    for op in ops {
        match op {
            StringTableOp::Add { id, value } => {
                let at = usize::from(*id);
                if at > table.len() {
                    return Err(Error::Format(format!(
                        "string-table add at {at} past length {}",
                        table.len()
                    )));
                }
                table.insert(at, value.clone());
            }
            StringTableOp::Remove { id } => {
                let at = usize::from(*id);
                if at >= table.len() {
                    return Err(Error::Format(format!(
                        "string-table remove at {at} past length {}",
                        table.len()
                    )));
                }
                table.remove(at);
            }
            StringTableOp::Modify { id, value } => {
                let at = usize::from(*id);
                let slot = table.get_mut(at).ok_or_else(|| {
                    Error::Format(format!("string-table modify at {at} out of range"))
                })?;
                *slot = value.clone();
            }
        }
    }
    Ok(table)
}

fn property_ops(
    parent: &BTreeMap<String, String>,
    child: &BTreeMap<String, String>,
) -> Vec<PropertyOp> {
    let mut ops = Vec::new();
    for (key, value) in child {
        if parent.get(key) != Some(value) {
            ops.push(PropertyOp::Set {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    for key in parent.keys() {
        if !child.contains_key(key) {
            ops.push(PropertyOp::Remove { key: key.clone() });
        }
    }
    ops
}

fn expand_to_payload(pkg: &ReleasePackage, file: &super::ReleaseFile) -> Result<FilePayload> {
    Ok(FilePayload {
        name: file.name.clone(),
        file_hash: file.file_hash,
        parts: pkg.expand_file(file)?,
    })
}

/// Diff `parent` against `child`, producing a patch that [`apply_patch`]
/// replays deterministically. `child` must have been produced by the
/// package builder (or a prior `apply_patch`), which pins its chunk-table
/// and string-table construction order.
pub fn compute_patch(
    parent: &ReleasePackage,
    child: &ReleasePackage,
    level: u32,
) -> Result<ReleasePackagePatch> {
    // Components and files are matched by name fingerprints.
    let component_script = edit::compute(
        &parent.components,
        &child.components,
        |c| Hash8::compute(c.name.as_bytes()),
        |c| Hash8::compute(c.name.as_bytes()),
        |c| c.clone(),
    );

    let mut component_inserts = Vec::new();
    for inserted in &component_script.inserts {
        component_inserts.push(ComponentPayload {
            name: inserted.name.clone(),
            files: inserted
                .files
                .iter()
                .map(|f| expand_to_payload(child, f))
                .collect::<Result<_>>()?,
        });
    }

    let mut file_edits = Vec::new();
    for (parent_idx, child_idx) in component_script.kept_pairs() {
        let parent_comp = &parent.components[parent_idx];
        let child_comp = &child.components[child_idx];
        let file_script = edit::compute(
            &parent_comp.files,
            &child_comp.files,
            |f| Hash8::compute(f.name.as_bytes()),
            |f| Hash8::compute(f.name.as_bytes()),
            |f| f.clone(),
        );
        let inserts = file_script
            .inserts
            .iter()
            .map(|f| expand_to_payload(child, f))
            .collect::<Result<Vec<_>>>()?;
        let mut modifies = Vec::new();
        for (p_file, c_file) in file_script.kept_pairs() {
            let parent_file = &parent_comp.files[p_file];
            let child_file = &child_comp.files[c_file];
            if parent_file.file_hash != child_file.file_hash {
                modifies.push(FileModify {
                    child_position: c_file,
                    file_hash: child_file.file_hash,
                    parts: child.expand_file(child_file)?,
                });
            }
        }
        file_edits.push(ComponentFileEdit {
            runs: file_script.runs,
            inserts,
            modifies,
        });
    }

    Ok(ReleasePackagePatch {
        meta: PatchMeta {
            parent_id: parent.meta.release_id.clone(),
            release_id: child.meta.release_id.clone(),
            repo_id: child.meta.repo_id.clone(),
            version: child.meta.version.clone(),
            notes: child.meta.notes.clone(),
            level,
            created_at: child.meta.created_at,
        },
        string_ops: string_table_ops(&parent.string_table, &child.string_table),
        property_ops: property_ops(
            &parent.meta.custom_properties,
            &child.meta.custom_properties,
        ),
        component_runs: component_script.runs,
        component_inserts,
        file_edits,
    })
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

fn seq_of_payload(payload: &FilePayload) -> FileSeq {
    FileSeq {
        name: payload.name.clone(),
        file_hash: payload.file_hash,
        parts: payload.parts.clone(),
    }
}

/// Replay `patch` over `parent`, producing the child package.
pub fn apply_patch(parent: &ReleasePackage, patch: &ReleasePackagePatch) -> Result<ReleasePackage> {
    if parent.meta.release_id != patch.meta.parent_id {
        return Err(Error::Conflict(format!(
            "patch applies to release {}, not {}",
            patch.meta.parent_id, parent.meta.release_id
        )));
    }

    let string_table = apply_string_ops(&parent.string_table, &patch.string_ops)?;

    let mut custom_properties = parent.meta.custom_properties.clone();
    for op in &patch.property_ops {
        match op {
            PropertyOp::Set { key, value } => {
                custom_properties.insert(key.clone(), value.clone());
            }
            PropertyOp::Remove { key } => {
                custom_properties.remove(key);
            }
        }
    }

    // Expand the parent tree to chunk-part sequences.
    let parent_seqs: Vec<ComponentSeq> = parent
        .components
        .iter()
        .map(|component| {
            let files = component
                .files
                .iter()
                .map(|f| {
                    Ok(FileSeq {
                        name: f.name.clone(),
                        file_hash: f.file_hash,
                        parts: parent.expand_file(f)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ComponentSeq {
                name: component.name.clone(),
                files,
            })
        })
        .collect::<Result<_>>()?;

    // Component-level script: kept components keep their parent files for
    // now; file edits refine them next.
    let component_script = EditScript {
        runs: patch.component_runs.clone(),
        inserts: patch
            .component_inserts
            .iter()
            .map(|c| ComponentSeq {
                name: c.name.clone(),
                files: c.files.iter().map(seq_of_payload).collect(),
            })
            .collect(),
        final_count: {
            let kept: usize = patch
                .component_runs
                .iter()
                .filter(|r| r.op == EditOp::Keep)
                .map(|r| r.len)
                .sum();
            kept + patch.component_inserts.len()
        },
    };
    let mut components = edit::apply(&component_script, &parent_seqs)?;

    // Refine kept components with their file edits.
    let kept_child_positions: Vec<usize> = component_script
        .kept_pairs()
        .into_iter()
        .map(|(_, child_idx)| child_idx)
        .collect();
    if kept_child_positions.len() != patch.file_edits.len() {
        return Err(Error::Format(format!(
            "patch carries {} file edits for {} kept components",
            patch.file_edits.len(),
            kept_child_positions.len()
        )));
    }
    for (child_idx, file_edit) in kept_child_positions.into_iter().zip(&patch.file_edits) {
        let component = &mut components[child_idx];
        let file_script = EditScript {
            runs: file_edit.runs.clone(),
            inserts: file_edit.inserts.iter().map(seq_of_payload).collect(),
            final_count: {
                let kept: usize = file_edit
                    .runs
                    .iter()
                    .filter(|r| r.op == EditOp::Keep)
                    .map(|r| r.len)
                    .sum();
                kept + file_edit.inserts.len()
            },
        };
        component.files = edit::apply(&file_script, &component.files)?;
        for modify in &file_edit.modifies {
            let slot = component.files.get_mut(modify.child_position).ok_or_else(|| {
                Error::Format(format!(
                    "file modify position {} out of range",
                    modify.child_position
                ))
            })?;
            slot.file_hash = modify.file_hash;
            slot.parts = modify.parts.clone();
        }
    }

    let meta = ReleaseMeta {
        version: patch.meta.version.clone(),
        release_id: patch.meta.release_id.clone(),
        repo_id: patch.meta.repo_id.clone(),
        notes: patch.meta.notes.clone(),
        custom_properties,
        created_at: patch.meta.created_at,
    };
    assemble(meta, &components, &string_table)
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Shared dictionary builder: file payloads reference chunk and file
/// hashes by dictionary index, in first-use order.
#[derive(Default)]
struct DictBuilder {
    chunk_table: ChunkTable,
    file_hashes: Vec<Hash32>,
    file_index: std::collections::HashMap<Hash32, usize>,
}

impl DictBuilder {
    fn file_hash_index(&mut self, hash: Hash32) -> usize {
        *self.file_index.entry(hash).or_insert_with(|| {
            self.file_hashes.push(hash);
            self.file_hashes.len() - 1
        })
    }
}

fn encode_payload(out: &mut Vec<u8>, payload: &FilePayload, dicts: &mut DictBuilder) -> Result<()> {
    write_string(out, &payload.name)?;
    varint::write_usize(out, dicts.file_hash_index(payload.file_hash))?;
    let refs = dicts.chunk_table.encode_refs(&payload.parts)?;
    refpack::write_refs(out, &refs)?;
    Ok(())
}

fn encode_runs(out: &mut Vec<u8>, runs: &[EditRun]) -> Result<()> {
    varint::write_usize(out, runs.len())?;
    for run in runs {
        out.push(run.op.code());
        varint::write_usize(out, run.len)?;
    }
    Ok(())
}

fn decode_runs<R: Read>(input: &mut R) -> Result<Vec<EditRun>> {
    let count = varint::read_usize(input)?;
    let mut runs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let mut op = [0u8; 1];
        input
            .read_exact(&mut op)
            .map_err(|_| Error::UnexpectedEof("edit run truncated".into()))?;
        runs.push(EditRun {
            op: EditOp::from_code(op[0])?,
            len: varint::read_usize(input)?,
        });
    }
    Ok(runs)
}

/// Serialize a patch into `.rdpk` bytes.
pub fn encode_patch(patch: &ReleasePackagePatch, opts: &CodecOptions) -> Result<Vec<u8>> {
    if patch.meta.created_at < 0 {
        return Err(Error::InvalidArgument(
            "patch timestamps before the epoch are not representable".into(),
        ));
    }

    // 0x01 metadata
    let mut metadata = Vec::new();
    write_string(&mut metadata, &patch.meta.parent_id)?;
    write_string(&mut metadata, &patch.meta.release_id)?;
    write_string(&mut metadata, &patch.meta.repo_id)?;
    write_string(&mut metadata, &patch.meta.version)?;
    write_string(&mut metadata, patch.meta.notes.as_deref().unwrap_or(""))?;
    varint::write_u32(&mut metadata, patch.meta.level)?;
    varint::write_u64(&mut metadata, patch.meta.created_at as u64)?;

    // 0x04 string-table delta, values tokenized against a patch-local
    // substring table.
    let mut local = StringTableBuilder::new();
    let tokenized_ops: Vec<(u8, u16, Option<TokenizedString>)> = patch
        .string_ops
        .iter()
        .map(|op| {
            Ok(match op {
                StringTableOp::Add { id, value } => (0u8, *id, Some(local.tokenize(value)?)),
                StringTableOp::Remove { id } => (1, *id, None),
                StringTableOp::Modify { id, value } => (2, *id, Some(local.tokenize(value)?)),
            })
        })
        .collect::<Result<_>>()?;
    let mut string_delta = Vec::new();
    let local_table = local.into_entries();
    varint::write_usize(&mut string_delta, local_table.len())?;
    for entry in &local_table {
        write_string(&mut string_delta, entry)?;
    }
    varint::write_usize(&mut string_delta, tokenized_ops.len())?;
    for (code, id, value) in &tokenized_ops {
        string_delta.push(*code);
        varint::write_u32(&mut string_delta, u32::from(*id))?;
        if let Some(value) = value {
            value.encode(&mut string_delta)?;
        }
    }

    // 0x05 custom-properties delta
    let mut props_delta = Vec::new();
    varint::write_usize(&mut props_delta, patch.property_ops.len())?;
    for op in &patch.property_ops {
        match op {
            PropertyOp::Set { key, value } => {
                props_delta.push(0);
                write_string(&mut props_delta, key)?;
                write_string(&mut props_delta, value)?;
            }
            PropertyOp::Remove { key } => {
                props_delta.push(1);
                write_string(&mut props_delta, key)?;
            }
        }
    }

    // 0x06 edits; populates the chunk and file-hash dictionaries as a
    // side effect, in a pinned traversal order.
    let mut dicts = DictBuilder::default();
    let mut edits = Vec::new();
    encode_runs(&mut edits, &patch.component_runs)?;
    varint::write_usize(&mut edits, patch.component_inserts.len())?;
    for component in &patch.component_inserts {
        write_string(&mut edits, &component.name)?;
        varint::write_usize(&mut edits, component.files.len())?;
        for file in &component.files {
            encode_payload(&mut edits, file, &mut dicts)?;
        }
    }
    varint::write_usize(&mut edits, patch.file_edits.len())?;
    for file_edit in &patch.file_edits {
        encode_runs(&mut edits, &file_edit.runs)?;
        varint::write_usize(&mut edits, file_edit.inserts.len())?;
        for file in &file_edit.inserts {
            encode_payload(&mut edits, file, &mut dicts)?;
        }
        varint::write_usize(&mut edits, file_edit.modifies.len())?;
        for modify in &file_edit.modifies {
            varint::write_usize(&mut edits, modify.child_position)?;
            varint::write_usize(&mut edits, dicts.file_hash_index(modify.file_hash))?;
            let refs = dicts.chunk_table.encode_refs(&modify.parts)?;
            refpack::write_refs(&mut edits, &refs)?;
        }
    }

    // 0x02 / 0x03 dictionaries, now complete.
    let chunk_dict = transpose::encode_hashes(&dicts.chunk_table.into_entries())?;
    let file_dict = transpose::encode_hashes(&dicts.file_hashes)?;

    let compression = opts.enable_compression.then_some(opts.compression_level);
    let mut out = Vec::new();
    out.extend_from_slice(&RDPK_MAGIC);
    out.push(RDPK_VERSION);
    out.push(if opts.enable_compression { 0b0000_0001 } else { 0 });
    write_section(&mut out, SECTION_METADATA, &metadata, compression)?;
    write_section(&mut out, SECTION_CHUNK_DICT, &chunk_dict, compression)?;
    write_section(&mut out, SECTION_FILE_HASH_DICT, &file_dict, compression)?;
    write_section(&mut out, SECTION_STRING_DELTA, &string_delta, compression)?;
    write_section(&mut out, SECTION_PROPS_DELTA, &props_delta, compression)?;
    write_section(&mut out, SECTION_EDITS, &edits, compression)?;
    Ok(out)
}

fn refs_to_parts(refs: &[DeltaChunkRef], dict: &[Hash32]) -> Result<Vec<FilePart>> {
    let indices = ReleasePackage::absolute_indices(refs);
    refs.iter()
        .zip(indices)
        .map(|(r, idx)| {
            let chunk = dict.get(idx as usize).copied().ok_or_else(|| {
                Error::Format(format!(
                    "patch chunk index {idx} out of range (dictionary has {})",
                    dict.len()
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

fn decode_payload<R: Read>(
    input: &mut R,
    chunk_dict: &[Hash32],
    file_dict: &[Hash32],
) -> Result<FilePayload> {
    let name = read_string(input)?;
    let hash_index = varint::read_usize(input)?;
    let file_hash = file_dict.get(hash_index).copied().ok_or_else(|| {
        Error::Format(format!(
            "file-hash index {hash_index} out of range (dictionary has {})",
            file_dict.len()
        ))
    })?;
    let refs = refpack::read_refs(input)?;
    Ok(FilePayload {
        name,
        file_hash,
        parts: refs_to_parts(&refs, chunk_dict)?,
    })
}

/// Parse `.rdpk` bytes back into a patch.
pub fn decode_patch(data: &[u8]) -> Result<ReleasePackagePatch> {
    let (compressed, header_len) = check_header(data, &RDPK_MAGIC, RDPK_VERSION)?;
    let sections = read_sections(&data[header_len..], compressed, &RDPK_SECTIONS)?;
    let section = |id: u8| -> Result<&[u8]> {
        sections
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Format(format!("missing section {id:#04x}")))
    };

    // 0x01 metadata
    let mut cursor = Cursor::new(section(SECTION_METADATA)?);
    let parent_id = read_string(&mut cursor)?;
    let release_id = read_string(&mut cursor)?;
    let repo_id = read_string(&mut cursor)?;
    let version = read_string(&mut cursor)?;
    let notes = read_string(&mut cursor)?;
    let meta = PatchMeta {
        parent_id,
        release_id,
        repo_id,
        version,
        notes: (!notes.is_empty()).then_some(notes),
        level: varint::read_u32(&mut cursor)?,
        created_at: varint::read_u64(&mut cursor)? as i64,
    };

    // Dictionaries
    let chunk_dict = transpose::decode_hashes(section(SECTION_CHUNK_DICT)?)?;
    let file_dict = transpose::decode_hashes(section(SECTION_FILE_HASH_DICT)?)?;

    // 0x04 string-table delta
    let mut cursor = Cursor::new(section(SECTION_STRING_DELTA)?);
    let local_len = varint::read_usize(&mut cursor)?;
    let mut local_table = Vec::with_capacity(local_len.min(4096));
    for _ in 0..local_len {
        local_table.push(read_string(&mut cursor)?);
    }
    let op_count = varint::read_usize(&mut cursor)?;
    let mut string_ops = Vec::with_capacity(op_count.min(4096));
    for _ in 0..op_count {
        let mut code = [0u8; 1];
        cursor
            .read_exact(&mut code)
            .map_err(|_| Error::UnexpectedEof("string-table op truncated".into()))?;
        let id = varint::read_u32(&mut cursor)?;
        let id = u16::try_from(id)
            .map_err(|_| Error::Format(format!("string-table id {id} exceeds u16")))?;
        string_ops.push(match code[0] {
            0 => StringTableOp::Add {
                id,
                value: TokenizedString::decode(&mut cursor)?.resolve(&local_table)?,
            },
            1 => StringTableOp::Remove { id },
            2 => StringTableOp::Modify {
                id,
                value: TokenizedString::decode(&mut cursor)?.resolve(&local_table)?,
            },
            other => return Err(Error::Format(format!("unknown string-table op {other}"))),
        });
    }

    // 0x05 custom-properties delta
    let mut cursor = Cursor::new(section(SECTION_PROPS_DELTA)?);
    let prop_count = varint::read_usize(&mut cursor)?;
    let mut property_ops = Vec::with_capacity(prop_count.min(4096));
    for _ in 0..prop_count {
        let mut code = [0u8; 1];
        cursor
            .read_exact(&mut code)
            .map_err(|_| Error::UnexpectedEof("property op truncated".into()))?;
        property_ops.push(match code[0] {
            0 => PropertyOp::Set {
                key: read_string(&mut cursor)?,
                value: read_string(&mut cursor)?,
            },
            1 => PropertyOp::Remove {
                key: read_string(&mut cursor)?,
            },
            other => return Err(Error::Format(format!("unknown property op {other}"))),
        });
    }

    // 0x06 edits
    let mut cursor = Cursor::new(section(SECTION_EDITS)?);
    let component_runs = decode_runs(&mut cursor)?;
    let insert_count = varint::read_usize(&mut cursor)?;
    let mut component_inserts = Vec::with_capacity(insert_count.min(1024));
    for _ in 0..insert_count {
        let name = read_string(&mut cursor)?;
        let file_count = varint::read_usize(&mut cursor)?;
        let mut files = Vec::with_capacity(file_count.min(65536));
        for _ in 0..file_count {
            files.push(decode_payload(&mut cursor, &chunk_dict, &file_dict)?);
        }
        component_inserts.push(ComponentPayload { name, files });
    }
    let edit_count = varint::read_usize(&mut cursor)?;
    let mut file_edits = Vec::with_capacity(edit_count.min(1024));
    for _ in 0..edit_count {
        let runs = decode_runs(&mut cursor)?;
        let insert_count = varint::read_usize(&mut cursor)?;
        let mut inserts = Vec::with_capacity(insert_count.min(65536));
        for _ in 0..insert_count {
            inserts.push(decode_payload(&mut cursor, &chunk_dict, &file_dict)?);
        }
        let modify_count = varint::read_usize(&mut cursor)?;
        let mut modifies = Vec::with_capacity(modify_count.min(65536));
        for _ in 0..modify_count {
            let child_position = varint::read_usize(&mut cursor)?;
            let hash_index = varint::read_usize(&mut cursor)?;
            let file_hash = file_dict.get(hash_index).copied().ok_or_else(|| {
                Error::Format(format!("file-hash index {hash_index} out of range"))
            })?;
            let refs = refpack::read_refs(&mut cursor)?;
            modifies.push(FileModify {
                child_position,
                file_hash,
                parts: refs_to_parts(&refs, &chunk_dict)?,
            });
        }
        file_edits.push(ComponentFileEdit {
            runs,
            inserts,
            modifies,
        });
    }

    Ok(ReleasePackagePatch {
        meta,
        string_ops,
        property_ops,
        component_runs,
        component_inserts,
        file_edits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::chunker::{chunk_bytes, ChunkerOptions};
    use crate::package::builder::{build_package, ComponentSeq, FileSeq};

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

    fn seq_of(name: &str, data: &[u8]) -> FileSeq {
        let opts = ChunkerOptions::new(64, 256, 1024).unwrap();
        let map = chunk_bytes(data, &opts, &CancelToken::new()).unwrap();
        FileSeq::from_chunk_map(name, &map)
    }

    fn release(id: &str, components: Vec<ComponentSeq>) -> ReleasePackage {
        build_package(
            ReleaseMeta {
                version: format!("{id}.0"),
                release_id: id.into(),
                repo_id: "repo".into(),
                created_at: 1_700_000_000,
                custom_properties: BTreeMap::from([(
                    "branch".to_string(),
                    format!("rel/{id}"),
                )]),
                ..Default::default()
            },
            components,
        )
        .unwrap()
    }

    fn parent_child() -> (ReleasePackage, ReleasePackage) {
        let shared = noise(4096, 1);
        let parent = release(
            "r1",
            vec![
                ComponentSeq {
                    name: "bin".into(),
                    files: vec![
                        seq_of("app", &shared),
                        seq_of("helper", &noise(2048, 2)),
                    ],
                },
                ComponentSeq {
                    name: "docs".into(),
                    files: vec![seq_of("readme.md", &noise(512, 3))],
                },
            ],
        );
        // Child: app modified, helper kept, docs dropped, plugins added.
        let mut modified = shared.clone();
        modified.splice(1000..1000, noise(64, 9));
        let child = release(
            "r2",
            vec![
                ComponentSeq {
                    name: "bin".into(),
                    files: vec![
                        seq_of("app", &modified),
                        seq_of("helper", &noise(2048, 2)),
                        seq_of("tool", &noise(1024, 5)),
                    ],
                },
                ComponentSeq {
                    name: "plugins".into(),
                    files: vec![seq_of("ext.so", &noise(3000, 6))],
                },
            ],
        );
        (parent, child)
    }

    #[test]
    fn apply_reproduces_child() {
        let (parent, child) = parent_child();
        let patch = compute_patch(&parent, &child, 1).unwrap();
        let rebuilt = apply_patch(&parent, &patch).unwrap();
        assert_eq!(rebuilt, child);
    }

    #[test]
    fn identical_releases_patch_to_identity() {
        let (parent, _) = parent_child();
        let mut clone = parent.clone();
        clone.meta.release_id = "r1b".into();
        let names = crate::package::codec::tokenize_names(&clone, &[]).unwrap();
        clone.string_table = names.table;
        let patch = compute_patch(&parent, &clone, 1).unwrap();
        assert!(patch.component_inserts.is_empty());
        assert!(patch.file_edits.iter().all(|e| e.inserts.is_empty() && e.modifies.is_empty()));
        let rebuilt = apply_patch(&parent, &patch).unwrap();
        assert_eq!(rebuilt, clone);
    }

    #[test]
    fn patch_codec_round_trips() {
        let (parent, child) = parent_child();
        let patch = compute_patch(&parent, &child, 3).unwrap();
        let bytes = encode_patch(&patch, &CodecOptions::default()).unwrap();
        assert_eq!(&bytes[..4], b"BPKD");
        let decoded = decode_patch(&bytes).unwrap();
        assert_eq!(decoded, patch);
        // Applying the decoded patch still reproduces the child.
        assert_eq!(apply_patch(&parent, &decoded).unwrap(), child);
    }

    #[test]
    fn patch_chain_applies_in_sequence() {
        let (r1, r2) = parent_child();
        let mut extra = noise(1500, 12);
        extra.extend_from_slice(&noise(100, 13));
        let r3 = release(
            "r3",
            vec![
                ComponentSeq {
                    name: "bin".into(),
                    files: vec![seq_of("app", &extra)],
                },
            ],
        );
        let p12 = compute_patch(&r1, &r2, 1).unwrap();
        let p23 = compute_patch(&r2, &r3, 2).unwrap();
        let rebuilt = apply_patch(&apply_patch(&r1, &p12).unwrap(), &p23).unwrap();
        assert_eq!(rebuilt, r3);
    }

    #[test]
    fn wrong_parent_is_conflict() {
        let (parent, child) = parent_child();
        let patch = compute_patch(&parent, &child, 1).unwrap();
        match apply_patch(&child, &patch) {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn string_ops_fold_remove_add_into_modify() {
        let parent = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let child = vec!["a".to_string(), "x".to_string(), "c".to_string()];
        let ops = string_table_ops(&parent, &child);
        assert!(ops
            .iter()
            .any(|op| matches!(op, StringTableOp::Modify { .. })));
        assert_eq!(apply_string_ops(&parent, &ops).unwrap(), child);
    }

    #[test]
    fn patch_identity_is_stable() {
        let (parent, child) = parent_child();
        let patch = compute_patch(&parent, &child, 1).unwrap();
        let a = encode_patch(&patch, &CodecOptions::default()).unwrap();
        let b = encode_patch(&patch, &CodecOptions::default()).unwrap();
        assert_eq!(patch_id(&a), patch_id(&b));
    }
}
