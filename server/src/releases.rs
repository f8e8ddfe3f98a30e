//! On-disk home of finalized release definitions.
//!
//! The catalog row carries metadata and a checksum; the `.rdef` bytes
//! themselves live here, written atomically via temp file + rename.

use stash_core::{Error, Hash32, Result};
use std::io::Write;
use std::path::PathBuf;

pub struct ReleaseStore {
    dir: PathBuf,
}

impl ReleaseStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = data_dir.into().join("releases");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, release_id: &str) -> Result<PathBuf> {
        validate_release_id(release_id)?;
        Ok(self.dir.join(format!("{release_id}.rdef")))
    }

    pub fn save(&self, release_id: &str, bytes: &[u8]) -> Result<Hash32> {
        let path = self.path_for(release_id)?;
        let tmp = path.with_extension("rdef.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        let checksum = Hash32::compute(bytes);
        tracing::debug!(release = release_id, bytes = bytes.len(), "stored release definition");
        Ok(checksum)
    }

    pub fn load(&self, release_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(release_id)?;
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "release definition {release_id} not on disk"
            )));
        }
        Ok(std::fs::read(&path)?)
    }
}

/// Release ids become file names; keep them boring.
fn validate_release_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid release id '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = ReleaseStore::new(dir.path()).unwrap();
        let checksum = store.save("rel-1", b"definition bytes").unwrap();
        assert_eq!(checksum, Hash32::compute(b"definition bytes"));
        assert_eq!(store.load("rel-1").unwrap(), b"definition bytes");
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let store = ReleaseStore::new(dir.path()).unwrap();
        for bad in ["../etc", "a/b", "", ".hidden", "x".repeat(200).as_str()] {
            assert!(store.save(bad, b"x").is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn missing_definition_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ReleaseStore::new(dir.path()).unwrap();
        assert!(matches!(store.load("ghost"), Err(Error::NotFound(_))));
    }
}
