//! Catalog contract: repositories, releases, chunk metadata, and ingest
//! sessions.
//!
//! The engine only needs a keyed record store; anything that can answer
//! these lookups can back it. The in-memory implementation in `memory` is
//! the reference one and what the server runs with.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stash_core::{Hash32, Result};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use memory::MemoryCatalog;

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub chunk_store_id: Uuid,
    pub storage_class: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Release {
    /// Release identity; minted by the client when the package is built.
    pub id: String,
    pub repo_id: Uuid,
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// BLAKE3 of the stored `.rdef` bytes.
    pub definition_checksum: Hash32,
    pub custom_properties: BTreeMap<String, String>,
    pub serializer_version: u8,
}

/// Stored-chunk metadata, per chunk store.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    pub checksum: Hash32,
    pub length: u64,
    pub compressed_length: u64,
}

/// Registered file identity, per chunk store.
#[derive(Debug, Clone, Copy)]
pub struct FileDefRecord {
    pub checksum: Hash32,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    InProgress,
    Completed,
    Failed,
    Aborted,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Aborted
                | SessionState::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSession {
    pub id: Uuid,
    pub repo_id: Uuid,
    pub state: SessionState,
    pub intended_release: String,
    pub client_agent: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub chunks_seen_total: u64,
    pub chunks_seen_unique: u64,
    pub chunks_seen_new: u64,
    pub data_size_total: u64,
    pub data_size_unique: u64,
    pub files_seen_total: u64,
    pub files_seen_unique: u64,
    pub files_seen_new: u64,
    pub metadata_size: u64,
    pub error: Option<String>,
}

// =============================================================================
// Contract
// =============================================================================

pub trait Catalog: Send + Sync {
    // Repositories
    fn create_repository(&self, name: &str, storage_class: &str) -> Result<Repository>;
    fn repository(&self, id: Uuid) -> Result<Option<Repository>>;
    fn list_repositories(&self) -> Result<Vec<Repository>>;

    // Releases
    fn record_release(&self, release: Release) -> Result<()>;
    fn release(&self, id: &str) -> Result<Option<Release>>;
    fn list_releases(&self, repo_id: Uuid) -> Result<Vec<Release>>;

    // Chunk / file-definition metadata, keyed by chunk store
    fn record_chunks(&self, chunk_store_id: Uuid, records: &[ChunkRecord]) -> Result<()>;
    fn chunk(&self, chunk_store_id: Uuid, checksum: &Hash32) -> Result<Option<ChunkRecord>>;
    fn record_file_defs(&self, chunk_store_id: Uuid, records: &[FileDefRecord]) -> Result<()>;
    fn file_def(&self, chunk_store_id: Uuid, checksum: &Hash32) -> Result<Option<FileDefRecord>>;
    fn file_def_chunks(&self, chunk_store_id: Uuid, checksum: &Hash32)
        -> Result<Option<Vec<Hash32>>>;
    fn record_file_def_chunks(
        &self,
        chunk_store_id: Uuid,
        checksum: &Hash32,
        chunks: &[Hash32],
    ) -> Result<()>;

    // Ingest sessions
    fn insert_session(&self, session: IngestSession) -> Result<()>;
    fn session(&self, id: Uuid) -> Result<Option<IngestSession>>;
    fn update_session(&self, session: IngestSession) -> Result<()>;
}
