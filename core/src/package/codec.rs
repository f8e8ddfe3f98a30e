//! The `.rdef` container: a sectioned, optionally per-section-compressed
//! binary serialization of [`ReleasePackage`].
//!
//! Sections are independent `id, flags, varint(len), payload` frames so a
//! reader can collect them in one pass and decode in dependency order
//! (string table before anything that resolves names). The codec holds no
//! state between calls; concurrent encodes of distinct packages are safe.

use super::{Component, FileChunks, ReleaseFile, ReleaseMeta, ReleasePackage, ReleaseStats};
use crate::codec::refpack;
use crate::codec::strtab::{StringTableBuilder, TokenizedString};
use crate::codec::transpose;
use crate::error::{Error, Result};
use crate::hash::Hash32;
use crate::varint;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

pub const RDEF_MAGIC: [u8; 4] = *b"BPKG";
pub const RDEF_VERSION: u8 = 1;

/// File flag bit 0: section payloads are Zstd frames.
const FLAG_COMPRESSED: u8 = 0b0000_0001;

const SECTION_METADATA: u8 = 0x01;
const SECTION_CHUNK_TABLE: u8 = 0x02;
const SECTION_STRING_TABLE: u8 = 0x03;
const SECTION_CONTENT_IDS: u8 = 0x04;
const SECTION_COMPONENTS: u8 = 0x05;
const SECTION_STATS: u8 = 0x06;

const RDEF_SECTIONS: [u8; 6] = [
    SECTION_METADATA,
    SECTION_CHUNK_TABLE,
    SECTION_STRING_TABLE,
    SECTION_CONTENT_IDS,
    SECTION_COMPONENTS,
    SECTION_STATS,
];

/// File encoding flag: chunk refs spelled out inline.
const FILE_FLAG_INLINE: u8 = 0b0000_0001;
/// File encoding flag: refs shared through the content-id table.
const FILE_FLAG_CONTENT_ID: u8 = 0b0000_0010;

#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    pub enable_compression: bool,
    pub compression_level: i32,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_level: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Section framing (shared with the patch codec)
// ---------------------------------------------------------------------------

pub(crate) fn write_section(
    out: &mut Vec<u8>,
    id: u8,
    payload: &[u8],
    compression: Option<i32>,
) -> Result<()> {
    let body = match compression {
        Some(level) => zstd::stream::encode_all(payload, level)?,
        None => payload.to_vec(),
    };
    out.push(id);
    out.push(0); // section flags, reserved
    varint::write_usize(out, body.len())?;
    out.extend_from_slice(&body);
    Ok(())
}

/// Collect every section into an id-keyed map, validating framing.
pub(crate) fn read_sections(
    data: &[u8],
    compressed: bool,
    allowed: &[u8],
) -> Result<BTreeMap<u8, Vec<u8>>> {
    let mut sections = BTreeMap::new();
    let mut cursor = Cursor::new(data);
    while (cursor.position() as usize) < data.len() {
        let mut head = [0u8; 2];
        cursor
            .read_exact(&mut head)
            .map_err(|_| Error::UnexpectedEof("section header truncated".into()))?;
        let [id, flags] = head;
        if !allowed.contains(&id) {
            return Err(Error::Format(format!("unknown section id {id:#04x}")));
        }
        if flags != 0 {
            return Err(Error::Format(format!(
                "section {id:#04x} carries reserved flags {flags:#04x}"
            )));
        }
        let len = varint::read_usize(&mut cursor)?;
        let remaining = data.len() - cursor.position() as usize;
        if len > remaining {
            return Err(Error::UnexpectedEof(format!(
                "section {id:#04x} declares {len} bytes, {remaining} remain"
            )));
        }
        let mut body = vec![0u8; len];
        cursor.read_exact(&mut body)?;
        let payload = if compressed {
            zstd::stream::decode_all(&body[..])
                .map_err(|e| Error::Format(format!("section {id:#04x} failed to decompress: {e}")))?
        } else {
            body
        };
        if sections.insert(id, payload).is_some() {
            return Err(Error::Format(format!("duplicate section id {id:#04x}")));
        }
    }
    Ok(sections)
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    varint::write_usize(out, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = varint::read_usize(input)?;
    let mut buf = vec![0u8; len];
    input
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof("string truncated".into()))?;
    String::from_utf8(buf).map_err(|e| Error::Format(format!("invalid UTF-8 string: {e}")))
}

pub(crate) fn read_hash32<R: Read>(input: &mut R) -> Result<Hash32> {
    let mut buf = [0u8; Hash32::LEN];
    input
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof("hash truncated".into()))?;
    Ok(Hash32::new(buf))
}

// ---------------------------------------------------------------------------
// Name tokenization
// ---------------------------------------------------------------------------

/// Every tokenized name in a package, plus the (possibly extended) table
/// that resolves them. Tokenization order is part of the format: custom
/// properties first (key, then value, in key order), then components and
/// their files in release order.
pub(crate) struct TokenizedNames {
    pub props: Vec<(TokenizedString, TokenizedString)>,
    pub components: Vec<(TokenizedString, Vec<TokenizedString>)>,
    pub table: Vec<String>,
}

pub(crate) fn tokenize_names(pkg: &ReleasePackage, seed: &[String]) -> Result<TokenizedNames> {
    let mut builder = StringTableBuilder::from_entries(seed.to_vec())?;
    let props = pkg
        .meta
        .custom_properties
        .iter()
        .map(|(k, v)| Ok((builder.tokenize(k)?, builder.tokenize(v)?)))
        .collect::<Result<Vec<_>>>()?;
    let components = pkg
        .components
        .iter()
        .map(|c| {
            let name = builder.tokenize(&c.name)?;
            let files = c
                .files
                .iter()
                .map(|f| builder.tokenize(&f.name))
                .collect::<Result<Vec<_>>>()?;
            Ok((name, files))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TokenizedNames {
        props,
        components,
        table: builder.into_entries(),
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize `pkg` into `.rdef` bytes.
pub fn encode_package(pkg: &ReleasePackage, opts: &CodecOptions) -> Result<Vec<u8>> {
    if pkg.meta.created_at < 0 {
        return Err(Error::InvalidArgument(
            "release timestamps before the epoch are not representable".into(),
        ));
    }
    let names = tokenize_names(pkg, &pkg.string_table)?;

    // 0x01 metadata
    let mut metadata = Vec::new();
    write_string(&mut metadata, &pkg.meta.version)?;
    write_string(&mut metadata, &pkg.meta.release_id)?;
    write_string(&mut metadata, &pkg.meta.repo_id)?;
    write_string(&mut metadata, pkg.meta.notes.as_deref().unwrap_or(""))?;
    varint::write_u64(&mut metadata, pkg.meta.created_at as u64)?;
    varint::write_usize(&mut metadata, names.props.len())?;
    for (key, value) in &names.props {
        key.encode(&mut metadata)?;
        value.encode(&mut metadata)?;
    }

    // 0x02 chunk table
    let chunk_table = transpose::encode_hashes(&pkg.chunks)?;

    // 0x03 string table
    let mut string_table = Vec::new();
    varint::write_usize(&mut string_table, names.table.len())?;
    for entry in &names.table {
        write_string(&mut string_table, entry)?;
    }

    // 0x04 content-id table
    let mut content_ids = Vec::new();
    varint::write_usize(&mut content_ids, pkg.content_ids.len())?;
    for (id, refs) in &pkg.content_ids {
        varint::write_u64(&mut content_ids, *id)?;
        refpack::write_refs(&mut content_ids, refs)?;
    }

    // 0x05 components/files
    let mut components = Vec::new();
    varint::write_usize(&mut components, pkg.components.len())?;
    for (component, (name, file_names)) in pkg.components.iter().zip(&names.components) {
        name.encode(&mut components)?;
        varint::write_usize(&mut components, component.files.len())?;
        for (file, file_name) in component.files.iter().zip(file_names) {
            file_name.encode(&mut components)?;
            components.extend_from_slice(file.file_hash.as_bytes());
            match &file.chunks {
                FileChunks::Inline(refs) => {
                    components.push(FILE_FLAG_INLINE);
                    refpack::write_refs(&mut components, refs)?;
                }
                FileChunks::ContentId(id) => {
                    components.push(FILE_FLAG_CONTENT_ID);
                    varint::write_u64(&mut components, *id)?;
                }
            }
        }
    }

    // 0x06 stats
    let mut stats = Vec::new();
    varint::write_u64(&mut stats, pkg.stats.component_count)?;
    varint::write_u64(&mut stats, pkg.stats.file_count)?;
    varint::write_u64(&mut stats, pkg.stats.chunk_count)?;
    varint::write_u64(&mut stats, pkg.stats.raw_size)?;
    varint::write_u64(&mut stats, pkg.stats.deduped_size)?;

    let compression = opts.enable_compression.then_some(opts.compression_level);
    let mut out = Vec::new();
    out.extend_from_slice(&RDEF_MAGIC);
    out.push(RDEF_VERSION);
    out.push(if opts.enable_compression { FLAG_COMPRESSED } else { 0 });
    write_section(&mut out, SECTION_METADATA, &metadata, compression)?;
    write_section(&mut out, SECTION_CHUNK_TABLE, &chunk_table, compression)?;
    write_section(&mut out, SECTION_STRING_TABLE, &string_table, compression)?;
    write_section(&mut out, SECTION_CONTENT_IDS, &content_ids, compression)?;
    write_section(&mut out, SECTION_COMPONENTS, &components, compression)?;
    write_section(&mut out, SECTION_STATS, &stats, compression)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub(crate) fn check_header(data: &[u8], magic: &[u8; 4], version: u8) -> Result<(bool, usize)> {
    if data.len() < 6 {
        return Err(Error::UnexpectedEof("container header truncated".into()));
    }
    if &data[..4] != magic {
        return Err(Error::Format(format!(
            "bad magic {:02x?}, expected {:?}",
            &data[..4],
            std::str::from_utf8(magic).unwrap_or("?")
        )));
    }
    if data[4] != version {
        return Err(Error::Format(format!(
            "unsupported container version {}",
            data[4]
        )));
    }
    let flags = data[5];
    if flags & !FLAG_COMPRESSED != 0 {
        return Err(Error::Format(format!("unknown file flags {flags:#04x}")));
    }
    Ok((flags & FLAG_COMPRESSED != 0, 6))
}

fn required_section<'a>(
    sections: &'a BTreeMap<u8, Vec<u8>>,
    id: u8,
) -> Result<&'a [u8]> {
    sections
        .get(&id)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Format(format!("missing section {id:#04x}")))
}

/// Parse `.rdef` bytes back into a [`ReleasePackage`].
pub fn decode_package(data: &[u8]) -> Result<ReleasePackage> {
    let (compressed, header_len) = check_header(data, &RDEF_MAGIC, RDEF_VERSION)?;
    let sections = read_sections(&data[header_len..], compressed, &RDEF_SECTIONS)?;

    // String table first; everything else resolves names against it.
    let mut cursor = Cursor::new(required_section(&sections, SECTION_STRING_TABLE)?);
    let table_len = varint::read_usize(&mut cursor)?;
    let mut string_table = Vec::with_capacity(table_len.min(4096));
    for _ in 0..table_len {
        string_table.push(read_string(&mut cursor)?);
    }

    // 0x01 metadata
    let mut cursor = Cursor::new(required_section(&sections, SECTION_METADATA)?);
    let version = read_string(&mut cursor)?;
    let release_id = read_string(&mut cursor)?;
    let repo_id = read_string(&mut cursor)?;
    let notes = read_string(&mut cursor)?;
    let created_at = varint::read_u64(&mut cursor)? as i64;
    let prop_count = varint::read_usize(&mut cursor)?;
    let mut custom_properties = BTreeMap::new();
    for _ in 0..prop_count {
        let key = TokenizedString::decode(&mut cursor)?.resolve(&string_table)?;
        let value = TokenizedString::decode(&mut cursor)?.resolve(&string_table)?;
        custom_properties.insert(key, value);
    }
    let meta = ReleaseMeta {
        version,
        release_id,
        repo_id,
        notes: (!notes.is_empty()).then_some(notes),
        custom_properties,
        created_at,
    };

    // 0x02 chunk table
    let chunks = transpose::decode_hashes(required_section(&sections, SECTION_CHUNK_TABLE)?)?;

    // 0x04 content-id table
    let mut cursor = Cursor::new(required_section(&sections, SECTION_CONTENT_IDS)?);
    let content_count = varint::read_usize(&mut cursor)?;
    let mut content_ids = BTreeMap::new();
    for _ in 0..content_count {
        let id = varint::read_u64(&mut cursor)?;
        let refs = refpack::read_refs(&mut cursor)?;
        if content_ids.insert(id, refs).is_some() {
            return Err(Error::Format(format!("duplicate content id {id}")));
        }
    }

    // 0x05 components/files
    let mut cursor = Cursor::new(required_section(&sections, SECTION_COMPONENTS)?);
    let component_count = varint::read_usize(&mut cursor)?;
    let mut components = Vec::with_capacity(component_count.min(1024));
    for _ in 0..component_count {
        let name = TokenizedString::decode(&mut cursor)?.resolve(&string_table)?;
        let file_count = varint::read_usize(&mut cursor)?;
        let mut files = Vec::with_capacity(file_count.min(65536));
        for _ in 0..file_count {
            let file_name = TokenizedString::decode(&mut cursor)?.resolve(&string_table)?;
            let file_hash = read_hash32(&mut cursor)?;
            let mut flag = [0u8; 1];
            cursor
                .read_exact(&mut flag)
                .map_err(|_| Error::UnexpectedEof("file encoding flag truncated".into()))?;
            let chunks = match flag[0] {
                FILE_FLAG_INLINE => FileChunks::Inline(refpack::read_refs(&mut cursor)?),
                FILE_FLAG_CONTENT_ID => FileChunks::ContentId(varint::read_u64(&mut cursor)?),
                other => {
                    return Err(Error::Format(format!(
                        "invalid file encoding flag {other:#04x}"
                    )))
                }
            };
            files.push(ReleaseFile {
                name: file_name,
                file_hash,
                chunks,
            });
        }
        components.push(Component { name, files });
    }

    // 0x06 stats
    let mut cursor = Cursor::new(required_section(&sections, SECTION_STATS)?);
    let stats = ReleaseStats {
        component_count: varint::read_u64(&mut cursor)?,
        file_count: varint::read_u64(&mut cursor)?,
        chunk_count: varint::read_u64(&mut cursor)?,
        raw_size: varint::read_u64(&mut cursor)?,
        deduped_size: varint::read_u64(&mut cursor)?,
    };

    let pkg = ReleasePackage {
        meta,
        chunks,
        string_table,
        content_ids,
        components,
        stats,
    };
    pkg.validate()?;
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::refpack::DeltaChunkRef;

    fn h(n: u8) -> Hash32 {
        Hash32::compute(&[n])
    }

    fn sample_package() -> ReleasePackage {
        let mut pkg = ReleasePackage {
            meta: ReleaseMeta {
                version: "2.1.0".into(),
                release_id: "rel-01".into(),
                repo_id: "repo-main".into(),
                notes: Some("first cut".into()),
                custom_properties: BTreeMap::from([
                    ("branch".to_string(), "release/2.1".to_string()),
                    ("builder".to_string(), "ci-linux_x64".to_string()),
                ]),
                created_at: 1_700_000_000,
            },
            chunks: vec![h(1), h(2), h(3), h(4)],
            content_ids: BTreeMap::from([(
                0u64,
                vec![
                    DeltaChunkRef { delta_index: 2, offset: 0, length: 700 },
                    DeltaChunkRef { delta_index: 1, offset: 0, length: 300 },
                ],
            )]),
            components: vec![
                Component {
                    name: "bin".into(),
                    files: vec![
                        ReleaseFile {
                            name: "app/main.exe".into(),
                            file_hash: h(10),
                            chunks: FileChunks::Inline(vec![
                                DeltaChunkRef { delta_index: 0, offset: 0, length: 100 },
                                DeltaChunkRef { delta_index: 1, offset: 0, length: 200 },
                            ]),
                        },
                        ReleaseFile {
                            name: "app/data-a.bin".into(),
                            file_hash: h(11),
                            chunks: FileChunks::ContentId(0),
                        },
                    ],
                },
                Component {
                    name: "docs".into(),
                    files: vec![ReleaseFile {
                        name: "manual_v2.pdf".into(),
                        file_hash: h(11),
                        chunks: FileChunks::ContentId(0),
                    }],
                },
            ],
            ..Default::default()
        };
        pkg.stats = ReleaseStats {
            component_count: 2,
            file_count: 3,
            chunk_count: 4,
            raw_size: 2300,
            deduped_size: 1300,
        };
        let names = tokenize_names(&pkg, &[]).unwrap();
        pkg.string_table = names.table;
        pkg
    }

    #[test]
    fn round_trips_with_compression() {
        let pkg = sample_package();
        let bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        assert_eq!(&bytes[..4], b"BPKG");
        assert_eq!(bytes[4], 1);
        let decoded = decode_package(&bytes).unwrap();
        assert_eq!(decoded, pkg);
    }

    #[test]
    fn round_trips_uncompressed() {
        let pkg = sample_package();
        let opts = CodecOptions { enable_compression: false, compression_level: 0 };
        let bytes = encode_package(&pkg, &opts).unwrap();
        assert_eq!(decode_package(&bytes).unwrap(), pkg);
    }

    #[test]
    fn empty_notes_normalizes_to_none() {
        let mut pkg = sample_package();
        pkg.meta.notes = None;
        let bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        assert_eq!(decode_package(&bytes).unwrap().meta.notes, None);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let pkg = sample_package();
        let mut bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode_package(&bytes), Err(Error::Format(_))));

        let mut bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        bytes[4] = 9;
        assert!(matches!(decode_package(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn rejects_unknown_section_id() {
        let pkg = sample_package();
        let opts = CodecOptions { enable_compression: false, compression_level: 0 };
        let mut bytes = encode_package(&pkg, &opts).unwrap();
        // First section id sits right after the 6-byte header.
        bytes[6] = 0x7f;
        assert!(matches!(decode_package(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn truncated_section_is_eof() {
        let pkg = sample_package();
        let bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        let truncated = &bytes[..bytes.len() - 10];
        assert!(matches!(
            decode_package(truncated),
            Err(Error::UnexpectedEof(_))
        ));
    }

    #[test]
    fn expanded_files_resolve_after_round_trip() {
        let pkg = sample_package();
        let bytes = encode_package(&pkg, &CodecOptions::default()).unwrap();
        let decoded = decode_package(&bytes).unwrap();
        let (_, file) = decoded.iter_files().nth(1).unwrap();
        let parts = decoded.expand_file(file).unwrap();
        assert_eq!(parts[0].chunk, h(3));
        assert_eq!(parts[1].chunk, h(4));
    }
}
