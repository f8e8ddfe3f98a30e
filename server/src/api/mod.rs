pub mod rest;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::ingest::SessionManager;
use crate::releases::ReleaseStore;
use crate::store::StoreManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub catalog: Arc<dyn Catalog>,
    pub stores: Arc<StoreManager>,
    pub releases: Arc<ReleaseStore>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: Config, catalog: Arc<dyn Catalog>) -> anyhow::Result<Self> {
        let pack_options = stash_core::pack::PackOptions {
            max_pack_size: config.max_pack_size,
            compression_level: config.compression_level,
        };
        let stores = Arc::new(StoreManager::new(config.data_dir.clone(), pack_options));
        let releases = Arc::new(ReleaseStore::new(config.data_dir.clone())?);
        let sessions = Arc::new(SessionManager::new(
            catalog.clone(),
            stores.clone(),
            releases.clone(),
            config.session_ttl_secs,
        ));
        Ok(Self {
            config,
            catalog,
            stores,
            releases,
            sessions,
        })
    }
}
