//! Chunk-store registry: one [`ChunkStore`] per chunk-store id, opened
//! lazily under `<data_dir>/stores/<uuid>`.

use stash_core::pack::store::ChunkStore;
use stash_core::pack::PackOptions;
use stash_core::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

pub struct StoreManager {
    root: PathBuf,
    options: PackOptions,
    stores: RwLock<HashMap<Uuid, Arc<ChunkStore>>>,
}

impl StoreManager {
    pub fn new(data_dir: impl Into<PathBuf>, options: PackOptions) -> Self {
        Self {
            root: data_dir.into().join("stores"),
            options,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self, id: Uuid) -> Result<Arc<ChunkStore>> {
        if let Some(store) = self.stores.read().expect("store lock poisoned").get(&id) {
            return Ok(store.clone());
        }
        let mut guard = self.stores.write().expect("store lock poisoned");
        if let Some(store) = guard.get(&id) {
            return Ok(store.clone());
        }
        let path = self.root.join(id.to_string());
        let store = Arc::new(ChunkStore::open(path, self.options)?);
        guard.insert(id, store.clone());
        Ok(store)
    }
}
