//! Chunk store: shards chunks across per-prefix pack engines by the
//! leading hash byte, creating engines lazily as prefixes are touched.

use super::{PackEngine, PackOptions};
use crate::error::Result;
use crate::hash::Hash32;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub struct ChunkStore {
    root: PathBuf,
    options: PackOptions,
    engines: RwLock<HashMap<u8, Arc<PackEngine>>>,
}

impl ChunkStore {
    pub fn open(root: impl AsRef<Path>, options: PackOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        // Eagerly open prefixes that already exist on disk so counters and
        // verification see the whole store.
        let mut engines = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(byte) = u8::from_str_radix(name, 16) else {
                continue;
            };
            if name.len() != 2 {
                continue;
            }
            let engine = PackEngine::open(entry.path(), name, options)?;
            engines.insert(byte, Arc::new(engine));
        }

        Ok(Self {
            root,
            options,
            engines: RwLock::new(engines),
        })
    }

    fn engine_for(&self, hash: &Hash32) -> Result<Arc<PackEngine>> {
        let byte = hash.prefix_byte();
        if let Some(engine) = self.engines.read().expect("engines lock poisoned").get(&byte) {
            return Ok(engine.clone());
        }
        let mut guard = self.engines.write().expect("engines lock poisoned");
        if let Some(engine) = guard.get(&byte) {
            return Ok(engine.clone());
        }
        let prefix = format!("{byte:02x}");
        let engine = Arc::new(PackEngine::open(
            self.root.join(&prefix),
            &prefix,
            self.options,
        )?);
        guard.insert(byte, engine.clone());
        Ok(engine)
    }

    pub fn write(&self, hash: &Hash32, bytes: &[u8]) -> Result<u64> {
        self.engine_for(hash)?.write(hash, bytes)
    }

    pub fn read(&self, hash: &Hash32) -> Result<Vec<u8>> {
        self.engine_for(hash)?.read(hash)
    }

    pub fn contains(&self, hash: &Hash32) -> Result<bool> {
        Ok(self.engine_for(hash)?.contains(hash))
    }

    /// The subset of `hashes` absent from the store, in input order.
    pub fn missing_of(&self, hashes: &[Hash32]) -> Result<Vec<Hash32>> {
        let mut missing = Vec::new();
        for hash in hashes {
            if !self.contains(hash)? {
                missing.push(*hash);
            }
        }
        Ok(missing)
    }

    pub fn chunk_count(&self) -> usize {
        self.engines
            .read()
            .expect("engines lock poisoned")
            .values()
            .map(|e| e.chunk_count())
            .sum()
    }

    /// Verify every stored chunk; returns hashes that failed.
    pub fn verify(&self) -> Result<Vec<Hash32>> {
        let engines: Vec<Arc<PackEngine>> = self
            .engines
            .read()
            .expect("engines lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut corrupt = Vec::new();
        for engine in engines {
            corrupt.extend(engine.verify()?);
        }
        Ok(corrupt)
    }

    /// Rebuild every prefix's index from its pack files.
    pub fn rebuild_indexes(&self, compute_hash: impl Fn(&[u8]) -> Hash32 + Copy) -> Result<usize> {
        let engines: Vec<Arc<PackEngine>> = self
            .engines
            .read()
            .expect("engines lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut total = 0;
        for engine in engines {
            total += engine.rebuild_index(compute_hash)?;
        }
        Ok(total)
    }

    /// Repair every prefix's packs, then rebuild their indexes.
    pub fn repair(&self, compute_hash: impl Fn(&[u8]) -> Hash32 + Copy) -> Result<()> {
        let engines: Vec<Arc<PackEngine>> = self
            .engines
            .read()
            .expect("engines lock poisoned")
            .values()
            .cloned()
            .collect();
        for engine in engines {
            engine.rebuild_packs(compute_hash)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    #[test]
    fn shards_by_leading_byte_and_round_trips() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), PackOptions::default()).unwrap();
        let mut hashes = Vec::new();
        for i in 0..50u32 {
            let payload = i.to_le_bytes().repeat(100);
            let hash = Hash32::compute(&payload);
            store.write(&hash, &payload).unwrap();
            hashes.push((hash, payload));
        }
        for (hash, payload) in &hashes {
            assert_eq!(&store.read(hash).unwrap(), payload);
        }
        assert_eq!(store.chunk_count(), hashes.len());

        // Prefix directories exist and are two-hex-char named.
        let dirs: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().to_str().map(String::from))
            .collect();
        assert!(dirs.iter().all(|d| d.len() == 2));
        assert!(dirs.len() > 1, "50 random hashes should span prefixes");
    }

    #[test]
    fn reopen_sees_existing_prefixes() {
        let dir = tempdir().unwrap();
        let payload = b"persistent chunk".to_vec();
        let hash = Hash32::compute(&payload);
        {
            let store = ChunkStore::open(dir.path(), PackOptions::default()).unwrap();
            store.write(&hash, &payload).unwrap();
        }
        let store = ChunkStore::open(dir.path(), PackOptions::default()).unwrap();
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.read(&hash).unwrap(), payload);
    }

    #[test]
    fn missing_of_preserves_order() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), PackOptions::default()).unwrap();
        let present = Hash32::compute(b"present");
        store.write(&present, b"present").unwrap();
        let absent_a = Hash32::compute(b"absent-a");
        let absent_b = Hash32::compute(b"absent-b");
        let missing = store
            .missing_of(&[absent_a, present, absent_b])
            .unwrap();
        assert_eq!(missing, vec![absent_a, absent_b]);
    }

    #[test]
    fn read_of_unknown_hash_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path(), PackOptions::default()).unwrap();
        assert!(matches!(
            store.read(&Hash32::compute(b"ghost")),
            Err(Error::NotFound(_))
        ));
    }
}
