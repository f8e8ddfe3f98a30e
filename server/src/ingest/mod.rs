//! Ingest sessions: the server half of the upload protocol.
//!
//! A session is created against one repository, negotiates missing chunk
//! and file sets, admits verified batches into the repository's chunk
//! store, and finalizes by recording the release definition. Uploads are
//! unordered and idempotent; the missing-set queries are read-only, so a
//! client may retry anything. TTL overruns flip the session to `Expired`
//! at the first operation that observes them.

use crate::catalog::{
    Catalog, ChunkRecord, FileDefRecord, IngestSession, Release, Repository, SessionState,
};
use crate::releases::ReleaseStore;
use crate::store::StoreManager;
use chrono::{Duration, Utc};
use stash_core::chunker::file_hash_of;
use stash_core::codec::wire::FileDefinition;
use stash_core::package::codec::{decode_package, RDEF_VERSION};
use stash_core::{Error, Hash32, Result};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct SessionManager {
    catalog: Arc<dyn Catalog>,
    stores: Arc<StoreManager>,
    releases: Arc<ReleaseStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        stores: Arc<StoreManager>,
        releases: Arc<ReleaseStore>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            catalog,
            stores,
            releases,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn create(
        &self,
        repo_id: Uuid,
        intended_release: &str,
        client_agent: &str,
    ) -> Result<IngestSession> {
        let repo = self.repository(repo_id)?;
        let now = Utc::now();
        let session = IngestSession {
            id: Uuid::new_v4(),
            repo_id: repo.id,
            state: SessionState::Created,
            intended_release: intended_release.to_string(),
            client_agent: client_agent.to_string(),
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            expires_at: now + self.ttl,
            chunks_seen_total: 0,
            chunks_seen_unique: 0,
            chunks_seen_new: 0,
            data_size_total: 0,
            data_size_unique: 0,
            files_seen_total: 0,
            files_seen_unique: 0,
            files_seen_new: 0,
            metadata_size: 0,
            error: None,
        };
        self.catalog.insert_session(session.clone())?;
        tracing::info!(session = %session.id, repo = %repo.name, "ingest session created");
        Ok(session)
    }

    pub fn session(&self, id: Uuid) -> Result<IngestSession> {
        self.catalog
            .session(id)?
            .ok_or_else(|| Error::NotFound(format!("session {id} not found")))
    }

    fn repository(&self, id: Uuid) -> Result<Repository> {
        self.catalog
            .repository(id)?
            .ok_or_else(|| Error::NotFound(format!("repository {id} not found")))
    }

    /// Load a session for an ingest operation: enforce TTL, require a
    /// live state, and move `Created` to `InProgress`.
    fn checkout(&self, id: Uuid) -> Result<(IngestSession, Repository)> {
        let mut session = self.session(id)?;
        let now = Utc::now();
        if !session.state.is_terminal() && now >= session.expires_at {
            session.state = SessionState::Expired;
            session.last_updated_at = now;
            self.catalog.update_session(session.clone())?;
            tracing::warn!(session = %id, "ingest session expired");
        }
        match session.state {
            SessionState::Created => {
                // Persisted immediately so validation failures later in
                // the operation still leave a resumable session behind.
                session.state = SessionState::InProgress;
                session.last_updated_at = now;
                self.catalog.update_session(session.clone())?;
            }
            SessionState::InProgress => {}
            other => {
                return Err(Error::SessionState(format!(
                    "session {id} is {other:?}"
                )))
            }
        }
        session.last_updated_at = now;
        let repo = self.repository(session.repo_id)?;
        Ok((session, repo))
    }

    /// Subset of `hashes` absent from the repository's chunk store.
    /// Read-only with respect to the store; retries are free.
    pub fn missing_chunks(&self, id: Uuid, hashes: &[Hash32]) -> Result<Vec<Hash32>> {
        let (session, repo) = self.checkout(id)?;
        let store = self.stores.store(repo.chunk_store_id)?;
        let missing = store.missing_of(hashes)?;
        self.catalog.update_session(session)?;
        tracing::debug!(
            session = %id,
            queried = hashes.len(),
            missing = missing.len(),
            "missing-chunks query"
        );
        Ok(missing)
    }

    /// Subset of `hashes` not registered as file identities.
    pub fn missing_files(&self, id: Uuid, hashes: &[Hash32]) -> Result<Vec<Hash32>> {
        let (session, repo) = self.checkout(id)?;
        let mut missing = Vec::new();
        for hash in hashes {
            if self.catalog.file_def(repo.chunk_store_id, hash)?.is_none() {
                missing.push(*hash);
            }
        }
        self.catalog.update_session(session)?;
        Ok(missing)
    }

    /// Admit a chunk batch. Every payload is re-hashed; one mismatch
    /// rejects the whole batch before anything is stored.
    pub fn upload_chunks(&self, id: Uuid, batch: &[(Hash32, Vec<u8>)]) -> Result<()> {
        let (mut session, repo) = self.checkout(id)?;
        for (declared, bytes) in batch {
            let actual = Hash32::compute(bytes);
            if actual != *declared {
                return Err(Error::InvalidArgument(format!(
                    "chunk hash mismatch: declared {declared}, content is {actual}"
                )));
            }
        }

        let store = self.stores.store(repo.chunk_store_id)?;
        let mut seen_in_batch: HashSet<Hash32> = HashSet::new();
        let mut records = Vec::new();
        for (hash, bytes) in batch {
            let written = store.write(hash, bytes)?;
            session.chunks_seen_total += 1;
            session.data_size_total += bytes.len() as u64;
            if seen_in_batch.insert(*hash) {
                session.chunks_seen_unique += 1;
                session.data_size_unique += bytes.len() as u64;
            }
            if written > 0 {
                session.chunks_seen_new += 1;
                records.push(ChunkRecord {
                    checksum: *hash,
                    length: bytes.len() as u64,
                    compressed_length: written,
                });
            }
        }
        self.catalog.record_chunks(repo.chunk_store_id, &records)?;
        self.catalog.update_session(session)?;
        tracing::debug!(
            session = %id,
            chunks = batch.len(),
            new = records.len(),
            "chunk batch admitted"
        );
        Ok(())
    }

    /// Register file identities. Every referenced chunk must already be
    /// stored (negotiated via `missing_chunks` beforehand) and each
    /// identity must match its chunk sequence.
    pub fn upload_file_definitions(&self, id: Uuid, defs: &[FileDefinition]) -> Result<()> {
        let (mut session, repo) = self.checkout(id)?;
        let store = self.stores.store(repo.chunk_store_id)?;

        for def in defs {
            let expected = file_hash_of(def.chunks.iter());
            if expected != def.file_hash {
                return Err(Error::InvalidArgument(format!(
                    "file identity {} does not match its chunk sequence",
                    def.file_hash
                )));
            }
            for chunk in &def.chunks {
                if !store.contains(chunk)? {
                    return Err(Error::InvalidArgument(format!(
                        "file {} references unknown chunk {chunk}",
                        def.file_hash
                    )));
                }
            }
        }

        for def in defs {
            session.files_seen_total += 1;
            let known = self.catalog.file_def(repo.chunk_store_id, &def.file_hash)?;
            if known.is_none() {
                session.files_seen_unique += 1;
                session.files_seen_new += 1;
            }
            self.catalog.record_file_defs(
                repo.chunk_store_id,
                &[FileDefRecord {
                    checksum: def.file_hash,
                    length: def.length,
                }],
            )?;
            self.catalog
                .record_file_def_chunks(repo.chunk_store_id, &def.file_hash, &def.chunks)?;
        }
        self.catalog.update_session(session)?;
        Ok(())
    }

    /// Verify the release definition against the store and record it.
    /// Validation failures leave the session `InProgress` (resumable);
    /// storage failures flip it to `Failed`.
    pub fn finalize(&self, id: Uuid, definition: &[u8]) -> Result<Release> {
        let (mut session, repo) = self.checkout(id)?;

        let pkg = decode_package(definition)?;
        if pkg.meta.repo_id != repo.id.to_string() {
            return Err(Error::InvalidArgument(format!(
                "release targets repository {}, session belongs to {}",
                pkg.meta.repo_id, repo.id
            )));
        }
        let store = self.stores.store(repo.chunk_store_id)?;
        let missing = store.missing_of(&pkg.chunks)?;
        if !missing.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "release references {} chunks not yet uploaded (first: {})",
                missing.len(),
                missing[0]
            )));
        }

        let stored = (|| -> Result<Release> {
            let checksum = self.releases.save(&pkg.meta.release_id, definition)?;
            let release = Release {
                id: pkg.meta.release_id.clone(),
                repo_id: repo.id,
                version: pkg.meta.version.clone(),
                created_at: Utc::now(),
                definition_checksum: checksum,
                custom_properties: pkg.meta.custom_properties.clone(),
                serializer_version: RDEF_VERSION,
            };
            self.catalog.record_release(release.clone())?;
            Ok(release)
        })();

        match stored {
            Ok(release) => {
                session.state = SessionState::Completed;
                session.completed_at = Some(Utc::now());
                session.metadata_size += definition.len() as u64;
                self.catalog.update_session(session)?;
                tracing::info!(
                    session = %id,
                    release = %release.id,
                    version = %release.version,
                    "ingest finalized"
                );
                Ok(release)
            }
            Err(err @ Error::Conflict(_)) => {
                // Another finalize won; resumable from the client's side.
                self.catalog.update_session(session)?;
                Err(err)
            }
            Err(err) => {
                session.state = SessionState::Failed;
                session.error = Some(err.to_string());
                self.catalog.update_session(session)?;
                Err(err)
            }
        }
    }

    /// Client-requested abort. Ingested-but-unreferenced chunks stay in
    /// the store.
    pub fn abort(&self, id: Uuid) -> Result<IngestSession> {
        let mut session = self.session(id)?;
        if session.state.is_terminal() {
            return Err(Error::SessionState(format!(
                "session {id} is {:?}",
                session.state
            )));
        }
        session.state = SessionState::Aborted;
        session.last_updated_at = Utc::now();
        self.catalog.update_session(session.clone())?;
        tracing::info!(session = %id, "ingest session aborted");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use stash_core::pack::PackOptions;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: SessionManager,
        catalog: Arc<MemoryCatalog>,
        repo: Repository,
    }

    fn fixture_with_ttl(ttl_secs: i64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let stores = Arc::new(StoreManager::new(dir.path(), PackOptions::default()));
        let releases = Arc::new(ReleaseStore::new(dir.path()).unwrap());
        let repo = catalog.create_repository("main", "standard").unwrap();
        let manager = SessionManager::new(catalog.clone(), stores, releases, ttl_secs);
        Fixture {
            _dir: dir,
            manager,
            catalog,
            repo,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ttl(3600)
    }

    #[test]
    fn missing_chunks_shrinks_after_upload() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let payload = b"chunk payload".to_vec();
        let hash = Hash32::compute(&payload);

        let missing = fx.manager.missing_chunks(session.id, &[hash]).unwrap();
        assert_eq!(missing, vec![hash]);

        fx.manager
            .upload_chunks(session.id, &[(hash, payload)])
            .unwrap();
        let missing = fx.manager.missing_chunks(session.id, &[hash]).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn duplicate_upload_is_idempotent() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let payload = b"same chunk".to_vec();
        let hash = Hash32::compute(&payload);

        fx.manager
            .upload_chunks(session.id, &[(hash, payload.clone()), (hash, payload.clone())])
            .unwrap();
        fx.manager
            .upload_chunks(session.id, &[(hash, payload)])
            .unwrap();

        let state = fx.manager.session(session.id).unwrap();
        assert_eq!(state.chunks_seen_total, 3);
        assert_eq!(state.chunks_seen_new, 1);
    }

    #[test]
    fn hash_mismatch_rejects_whole_batch() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let good = b"good".to_vec();
        let good_hash = Hash32::compute(&good);
        let bad_hash = Hash32::compute(b"something else");

        let err = fx
            .manager
            .upload_chunks(
                session.id,
                &[(good_hash, good.clone()), (bad_hash, b"liar".to_vec())],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // Nothing from the batch landed.
        let missing = fx.manager.missing_chunks(session.id, &[good_hash]).unwrap();
        assert_eq!(missing, vec![good_hash]);
    }

    #[test]
    fn file_definitions_require_stored_chunks() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let chunk = b"file chunk".to_vec();
        let chunk_hash = Hash32::compute(&chunk);
        let def = FileDefinition {
            file_hash: file_hash_of([chunk_hash].iter()),
            length: chunk.len() as u64,
            chunks: vec![chunk_hash],
        };

        // Chunk not yet uploaded: rejected.
        assert!(fx
            .manager
            .upload_file_definitions(session.id, std::slice::from_ref(&def))
            .is_err());

        fx.manager
            .upload_chunks(session.id, &[(chunk_hash, chunk)])
            .unwrap();
        fx.manager
            .upload_file_definitions(session.id, std::slice::from_ref(&def))
            .unwrap();

        let missing = fx
            .manager
            .missing_files(session.id, &[def.file_hash])
            .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn finalize_completes_session_and_records_release() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();

        // Build a one-file release whose chunks are uploaded first.
        let payload = vec![0x41, 0x42, 0x43];
        let opts = stash_core::chunker::ChunkerOptions::new(8, 16, 64).unwrap();
        let map = stash_core::chunker::chunk_bytes(
            &payload,
            &opts,
            &stash_core::CancelToken::new(),
        )
        .unwrap();
        for entry in &map.entries {
            let bytes = payload[entry.offset as usize..(entry.offset + u64::from(entry.length)) as usize].to_vec();
            fx.manager
                .upload_chunks(session.id, &[(entry.checksum, bytes)])
                .unwrap();
        }
        let pkg = stash_core::package::builder::build_package(
            stash_core::package::ReleaseMeta {
                version: "1.0".into(),
                release_id: "rel-1".into(),
                repo_id: fx.repo.id.to_string(),
                created_at: 1_700_000_000,
                ..Default::default()
            },
            vec![stash_core::package::builder::ComponentSeq {
                name: "bin".into(),
                files: vec![stash_core::package::builder::FileSeq::from_chunk_map(
                    "app", &map,
                )],
            }],
        )
        .unwrap();
        let bytes = stash_core::package::codec::encode_package(
            &pkg,
            &stash_core::package::codec::CodecOptions::default(),
        )
        .unwrap();

        let release = fx.manager.finalize(session.id, &bytes).unwrap();
        assert_eq!(release.id, "rel-1");
        assert_eq!(
            fx.manager.session(session.id).unwrap().state,
            SessionState::Completed
        );
        assert!(fx.catalog.release("rel-1").unwrap().is_some());

        // Finalize on a completed session is a state error.
        assert!(matches!(
            fx.manager.finalize(session.id, &bytes),
            Err(Error::SessionState(_))
        ));
    }

    #[test]
    fn finalize_rejects_unknown_chunks_and_stays_resumable() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let opts = stash_core::chunker::ChunkerOptions::new(8, 16, 64).unwrap();
        let map = stash_core::chunker::chunk_bytes(
            b"never uploaded",
            &opts,
            &stash_core::CancelToken::new(),
        )
        .unwrap();
        let pkg = stash_core::package::builder::build_package(
            stash_core::package::ReleaseMeta {
                version: "1.0".into(),
                release_id: "rel-x".into(),
                repo_id: fx.repo.id.to_string(),
                created_at: 1_700_000_000,
                ..Default::default()
            },
            vec![stash_core::package::builder::ComponentSeq {
                name: "bin".into(),
                files: vec![stash_core::package::builder::FileSeq::from_chunk_map(
                    "app", &map,
                )],
            }],
        )
        .unwrap();
        let bytes = stash_core::package::codec::encode_package(
            &pkg,
            &stash_core::package::codec::CodecOptions::default(),
        )
        .unwrap();

        assert!(fx.manager.finalize(session.id, &bytes).is_err());
        assert_eq!(
            fx.manager.session(session.id).unwrap().state,
            SessionState::InProgress
        );
    }

    #[test]
    fn finalize_first_repo_mismatch_persists_in_progress() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let opts = stash_core::chunker::ChunkerOptions::new(8, 16, 64).unwrap();
        let map = stash_core::chunker::chunk_bytes(
            b"wrong repo",
            &opts,
            &stash_core::CancelToken::new(),
        )
        .unwrap();
        let pkg = stash_core::package::builder::build_package(
            stash_core::package::ReleaseMeta {
                version: "1.0".into(),
                release_id: "rel-y".into(),
                repo_id: uuid::Uuid::new_v4().to_string(),
                created_at: 1_700_000_000,
                ..Default::default()
            },
            vec![stash_core::package::builder::ComponentSeq {
                name: "bin".into(),
                files: vec![stash_core::package::builder::FileSeq::from_chunk_map(
                    "app", &map,
                )],
            }],
        )
        .unwrap();
        let bytes = stash_core::package::codec::encode_package(
            &pkg,
            &stash_core::package::codec::CodecOptions::default(),
        )
        .unwrap();

        // Finalize is the first operation on the session; the rejected
        // attempt must still leave the persisted state resumable.
        let err = fx.manager.finalize(session.id, &bytes).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(
            fx.manager.session(session.id).unwrap().state,
            SessionState::InProgress
        );
    }

    #[test]
    fn expired_session_rejects_operations() {
        let fx = fixture_with_ttl(0);
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        let err = fx
            .manager
            .upload_chunks(session.id, &[(Hash32::compute(b"x"), b"x".to_vec())])
            .unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert_eq!(
            fx.manager.session(session.id).unwrap().state,
            SessionState::Expired
        );
    }

    #[test]
    fn abort_is_terminal() {
        let fx = fixture();
        let session = fx.manager.create(fx.repo.id, "1.0", "test").unwrap();
        fx.manager.abort(session.id).unwrap();
        assert!(matches!(
            fx.manager.missing_chunks(session.id, &[]),
            Err(Error::SessionState(_))
        ));
        assert!(fx.manager.abort(session.id).is_err());
    }
}
