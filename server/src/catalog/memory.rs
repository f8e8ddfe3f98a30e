//! In-memory catalog: `RwLock`-guarded maps keyed the same way the
//! contract queries are.

use super::{
    Catalog, ChunkRecord, FileDefRecord, IngestSession, Release, Repository,
};
use chrono::Utc;
use stash_core::{Error, Hash32, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    repositories: HashMap<Uuid, Repository>,
    releases: HashMap<String, Release>,
    chunks: HashMap<(Uuid, Hash32), ChunkRecord>,
    file_defs: HashMap<(Uuid, Hash32), FileDefRecord>,
    file_def_chunks: HashMap<(Uuid, Hash32), Vec<Hash32>>,
    sessions: HashMap<Uuid, IngestSession>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemoryCatalog {
    fn create_repository(&self, name: &str, storage_class: &str) -> Result<Repository> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        if state.repositories.values().any(|r| r.name == name) {
            return Err(Error::Conflict(format!("repository '{name}' already exists")));
        }
        let repo = Repository {
            id: Uuid::new_v4(),
            name: name.to_string(),
            chunk_store_id: Uuid::new_v4(),
            storage_class: storage_class.to_string(),
            created_at: Utc::now(),
        };
        state.repositories.insert(repo.id, repo.clone());
        Ok(repo)
    }

    fn repository(&self, id: Uuid) -> Result<Option<Repository>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .repositories
            .get(&id)
            .cloned())
    }

    fn list_repositories(&self) -> Result<Vec<Repository>> {
        let state = self.state.read().expect("catalog lock poisoned");
        let mut repos: Vec<Repository> = state.repositories.values().cloned().collect();
        repos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(repos)
    }

    fn record_release(&self, release: Release) -> Result<()> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        if state.releases.contains_key(&release.id) {
            return Err(Error::Conflict(format!(
                "release '{}' already recorded",
                release.id
            )));
        }
        if state
            .releases
            .values()
            .any(|r| r.repo_id == release.repo_id && r.version == release.version)
        {
            return Err(Error::Conflict(format!(
                "repository already has a release with version '{}'",
                release.version
            )));
        }
        state.releases.insert(release.id.clone(), release);
        Ok(())
    }

    fn release(&self, id: &str) -> Result<Option<Release>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .releases
            .get(id)
            .cloned())
    }

    fn list_releases(&self, repo_id: Uuid) -> Result<Vec<Release>> {
        let state = self.state.read().expect("catalog lock poisoned");
        let mut releases: Vec<Release> = state
            .releases
            .values()
            .filter(|r| r.repo_id == repo_id)
            .cloned()
            .collect();
        releases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(releases)
    }

    fn record_chunks(&self, chunk_store_id: Uuid, records: &[ChunkRecord]) -> Result<()> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        for record in records {
            state
                .chunks
                .entry((chunk_store_id, record.checksum))
                .or_insert(*record);
        }
        Ok(())
    }

    fn chunk(&self, chunk_store_id: Uuid, checksum: &Hash32) -> Result<Option<ChunkRecord>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .chunks
            .get(&(chunk_store_id, *checksum))
            .copied())
    }

    fn record_file_defs(&self, chunk_store_id: Uuid, records: &[FileDefRecord]) -> Result<()> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        for record in records {
            state
                .file_defs
                .entry((chunk_store_id, record.checksum))
                .or_insert(*record);
        }
        Ok(())
    }

    fn file_def(&self, chunk_store_id: Uuid, checksum: &Hash32) -> Result<Option<FileDefRecord>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .file_defs
            .get(&(chunk_store_id, *checksum))
            .copied())
    }

    fn file_def_chunks(
        &self,
        chunk_store_id: Uuid,
        checksum: &Hash32,
    ) -> Result<Option<Vec<Hash32>>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .file_def_chunks
            .get(&(chunk_store_id, *checksum))
            .cloned())
    }

    fn record_file_def_chunks(
        &self,
        chunk_store_id: Uuid,
        checksum: &Hash32,
        chunks: &[Hash32],
    ) -> Result<()> {
        self.state
            .write()
            .expect("catalog lock poisoned")
            .file_def_chunks
            .entry((chunk_store_id, *checksum))
            .or_insert_with(|| chunks.to_vec());
        Ok(())
    }

    fn insert_session(&self, session: IngestSession) -> Result<()> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        if state.sessions.contains_key(&session.id) {
            return Err(Error::Conflict(format!("session {} already exists", session.id)));
        }
        state.sessions.insert(session.id, session);
        Ok(())
    }

    fn session(&self, id: Uuid) -> Result<Option<IngestSession>> {
        Ok(self
            .state
            .read()
            .expect("catalog lock poisoned")
            .sessions
            .get(&id)
            .cloned())
    }

    fn update_session(&self, session: IngestSession) -> Result<()> {
        let mut state = self.state.write().expect("catalog lock poisoned");
        match state.sessions.get_mut(&session.id) {
            Some(slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(Error::NotFound(format!("session {} not found", session.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names_are_unique() {
        let catalog = MemoryCatalog::new();
        catalog.create_repository("main", "standard").unwrap();
        assert!(matches!(
            catalog.create_repository("main", "standard"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn release_versions_are_unique_per_repo() {
        let catalog = MemoryCatalog::new();
        let repo = catalog.create_repository("main", "standard").unwrap();
        let release = Release {
            id: "r1".into(),
            repo_id: repo.id,
            version: "1.0".into(),
            created_at: Utc::now(),
            definition_checksum: Hash32::compute(b"def"),
            custom_properties: Default::default(),
            serializer_version: 1,
        };
        catalog.record_release(release.clone()).unwrap();

        let mut dup = release.clone();
        dup.id = "r2".into();
        assert!(matches!(
            catalog.record_release(dup),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn chunk_records_first_write_wins() {
        let catalog = MemoryCatalog::new();
        let store = Uuid::new_v4();
        let checksum = Hash32::compute(b"chunk");
        catalog
            .record_chunks(store, &[ChunkRecord { checksum, length: 10, compressed_length: 8 }])
            .unwrap();
        catalog
            .record_chunks(store, &[ChunkRecord { checksum, length: 99, compressed_length: 99 }])
            .unwrap();
        assert_eq!(catalog.chunk(store, &checksum).unwrap().unwrap().length, 10);
        // Other stores do not see it.
        assert!(catalog.chunk(Uuid::new_v4(), &checksum).unwrap().is_none());
    }
}
