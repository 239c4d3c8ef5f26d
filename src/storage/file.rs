//! File-backed key-value store with owner-only permissions
//!
//! Each key lives in `{dir}/{key}.json`. Writes go to a temp file first and
//! are renamed into place.

use super::KeyValueStore;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Durable store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Store under the platform data directory
    pub fn default_location() -> Result<Self> {
        Self::new(Self::default_dir()?)
    }

    /// `~/.local/share/nowplaying/storage` or the platform equivalent
    pub fn default_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .context("Failed to determine data directory")?;

        Ok(data_dir.join("nowplaying").join("storage"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.is_empty() { "_".to_string() } else { name };
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, value).context("Failed to write temp storage file")?;

        // 0600 = owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&temp_path, perms)
                .context("Failed to set storage file permissions")?;
        }

        std::fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to save {}", path.display()))?;

        tracing::debug!("Saved storage key '{}' to {:?}", key, path);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            tracing::info!("Deleted storage key '{}' from {:?}", key, path);
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("file:{}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("storage")).unwrap();

        assert!(store.get("PkceHandler").unwrap().is_none());
        store.set("PkceHandler", r#"{"a":1}"#).unwrap();
        assert_eq!(
            store.get("PkceHandler").unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert!(!store.path_for("PkceHandler").with_extension("json.tmp").exists());

        store.remove("PkceHandler").unwrap();
        assert!(store.get("PkceHandler").unwrap().is_none());
        store.remove("PkceHandler").unwrap();
    }

    #[test]
    fn test_keys_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        let path = store.path_for("../evil/key");
        assert_eq!(path.parent(), Some(tmp.path()));
        assert_eq!(path.file_name().unwrap(), "___evil_key.json");
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        store.set("secret", "{}").unwrap();
        let mode = std::fs::metadata(store.path_for("secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
