//! Directory ingest pipeline: chunk, negotiate, upload, finalize.

use crate::api::ApiClient;
use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use stash_core::cancel::CancelToken;
use stash_core::chunker::{chunk_file, ChunkMap, ChunkerOptions};
use stash_core::codec::wire::FileDefinition;
use stash_core::package::builder::{build_package, ComponentSeq, FileSeq};
use stash_core::package::codec::{encode_package, CodecOptions};
use stash_core::package::ReleaseMeta;
use stash_core::Hash32;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Upper bound on the payload bytes of one chunk-batch request.
const BATCH_BYTE_LIMIT: usize = 32 * 1024 * 1024;
/// Hashes per missing-chunks query.
const MISSING_QUERY_LIMIT: usize = 50_000;

pub struct IngestOptions {
    pub root: PathBuf,
    pub repo_id: Uuid,
    pub version: String,
    pub component: String,
    pub notes: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub chunker: ChunkerOptions,
}

/// Where a chunk's bytes can be re-read during upload.
#[derive(Clone)]
struct ChunkLocation {
    path: PathBuf,
    offset: u64,
    length: u32,
}

struct ScanResult {
    files: Vec<(String, ChunkMap)>,
    locations: HashMap<Hash32, ChunkLocation>,
    total_bytes: u64,
}

fn progress_bar(len: u64, message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{msg:>10} [{bar:40.cyan/blue}] {pos}/{len} {eta}")
            .expect("static template parses")
            .progress_chars("=> "),
    );
    bar.set_message(message);
    bar
}

/// Walk and chunk the release tree. CPU-bound; run on a blocking thread.
fn scan_tree(root: &Path, chunker: &ChunkerOptions) -> anyhow::Result<ScanResult> {
    let paths: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    anyhow::ensure!(!paths.is_empty(), "no files under {}", root.display());

    let bar = progress_bar(paths.len() as u64, "chunking");
    let cancel = CancelToken::new();
    let mut files = Vec::with_capacity(paths.len());
    let mut locations: HashMap<Hash32, ChunkLocation> = HashMap::new();
    let mut total_bytes = 0u64;
    for path in paths {
        let name = path
            .strip_prefix(root)
            .context("walked file outside root")?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let map = chunk_file(&path, chunker, &cancel)?;
        total_bytes += map.total_size;
        for entry in &map.entries {
            locations.entry(entry.checksum).or_insert(ChunkLocation {
                path: path.clone(),
                offset: entry.offset,
                length: entry.length,
            });
        }
        files.push((name, map));
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(ScanResult {
        files,
        locations,
        total_bytes,
    })
}

fn read_chunk(location: &ChunkLocation) -> anyhow::Result<Vec<u8>> {
    let mut file = std::fs::File::open(&location.path)
        .with_context(|| format!("reopening {}", location.path.display()))?;
    file.seek(SeekFrom::Start(location.offset))?;
    let mut buf = vec![0u8; location.length as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub async fn run(client: &ApiClient, options: IngestOptions) -> anyhow::Result<()> {
    let root = options.root.clone();
    let chunker = options.chunker.clone();
    let scan = tokio::task::spawn_blocking(move || scan_tree(&root, &chunker)).await??;
    tracing::info!(
        files = scan.files.len(),
        bytes = scan.total_bytes,
        unique_chunks = scan.locations.len(),
        "release tree chunked"
    );

    // Assemble the release definition up front; its chunk table is the
    // negotiation universe.
    let release_id = Uuid::new_v4().to_string();
    let package = build_package(
        ReleaseMeta {
            version: options.version.clone(),
            release_id: release_id.clone(),
            repo_id: options.repo_id.to_string(),
            notes: options.notes.clone(),
            custom_properties: options.properties.clone(),
            created_at: chrono::Utc::now().timestamp(),
        },
        vec![ComponentSeq {
            name: options.component.clone(),
            files: scan
                .files
                .iter()
                .map(|(name, map)| FileSeq::from_chunk_map(name.clone(), map))
                .collect(),
        }],
    )?;

    let session = client
        .create_session(options.repo_id, &options.version)
        .await?;
    tracing::info!(%session, release = %release_id, "ingest session open");

    // Negotiate the missing set.
    let unique: Vec<Hash32> = scan.locations.keys().copied().collect();
    let mut missing = Vec::new();
    for window in unique.chunks(MISSING_QUERY_LIMIT) {
        missing.extend(client.missing_chunks(session, window).await?);
    }
    let missing_bytes: u64 = missing
        .iter()
        .map(|h| u64::from(scan.locations[h].length))
        .sum();
    println!(
        "{} of {} chunks missing on server ({} of {} bytes)",
        missing.len(),
        unique.len(),
        missing_bytes,
        scan.total_bytes
    );

    // Upload in byte-bounded batches. The server tolerates chunks that
    // raced in from elsewhere since the query.
    let bar = progress_bar(missing.len() as u64, "uploading");
    let mut batch: Vec<(Hash32, Vec<u8>)> = Vec::new();
    let mut batch_bytes = 0usize;
    for hash in &missing {
        let location = scan.locations[hash].clone();
        let bytes = tokio::task::spawn_blocking(move || read_chunk(&location)).await??;
        batch_bytes += bytes.len();
        batch.push((*hash, bytes));
        if batch_bytes >= BATCH_BYTE_LIMIT {
            client.upload_chunks(session, &batch).await?;
            bar.inc(batch.len() as u64);
            batch.clear();
            batch_bytes = 0;
        }
    }
    if !batch.is_empty() {
        client.upload_chunks(session, &batch).await?;
        bar.inc(batch.len() as u64);
    }
    bar.finish_and_clear();

    // Register file identities the server has not seen.
    let mut defs: HashMap<Hash32, FileDefinition> = HashMap::new();
    for (_, map) in &scan.files {
        let def = FileDefinition {
            file_hash: map.file_hash(),
            length: map.total_size,
            chunks: map.entries.iter().map(|e| e.checksum).collect(),
        };
        defs.entry(def.file_hash).or_insert(def);
    }
    let file_hashes: Vec<Hash32> = defs.keys().copied().collect();
    let missing_files = client.missing_files(session, &file_hashes).await?;
    if !missing_files.is_empty() {
        let new_defs: Vec<FileDefinition> = missing_files
            .iter()
            .filter_map(|h| defs.get(h).cloned())
            .collect();
        client.upload_file_definitions(session, &new_defs).await?;
    }

    let definition = encode_package(&package, &CodecOptions::default())?;
    let release = client
        .finalize(session, options.repo_id, definition)
        .await?;
    println!(
        "release {} (version {}) ingested: {} files, {} chunks",
        release.id, release.version, package.stats.file_count, package.stats.chunk_count
    );
    Ok(())
}
