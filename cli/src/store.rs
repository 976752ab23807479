//! Interaction store backed by one JSON file per key

use interaction_model::persist::{InteractionStore, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl InteractionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Written to a sibling file first, then renamed over the old one
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value)?;
        fs::rename(&staging, &path)?;
        log::debug!("wrote {}", path.display());
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = "interactions:devnet:8cUvGTFvSWx9WPebYYfDxwiJPdGx2EJUtpve6jP9SBma";

        assert_eq!(store.get(key).unwrap(), None);
        store.set(key, "[]").unwrap();
        assert_eq!(store.get(key).unwrap().as_deref(), Some("[]"));
        store.set(key, "[1]").unwrap();
        assert_eq!(store.get(key).unwrap().as_deref(), Some("[1]"));

        store.invalidate(key).unwrap();
        assert_eq!(store.get(key).unwrap(), None);
        store.invalidate(key).unwrap();
    }

    #[test]
    fn test_keys_map_to_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("nested")).unwrap();
        store.set("interactions:devnet:a", "devnet").unwrap();
        store.set("interactions:mainnet:a", "mainnet").unwrap();

        assert_eq!(store.get("interactions:devnet:a").unwrap().as_deref(), Some("devnet"));
        assert_eq!(store.get("interactions:mainnet:a").unwrap().as_deref(), Some("mainnet"));
        assert!(dir.path().join("nested/interactions_devnet_a.json").exists());
    }
}
