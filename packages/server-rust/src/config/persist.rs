//! Loading and saving the configuration document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pulseha_core::ClusterConfig;

use crate::error::{DaemonError, DaemonResult};

/// Reads and writes the persisted configuration document.
pub trait ConfigPersistence: Send + Sync {
    /// Returns `None` when no document exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be read or parsed.
    fn load(&self) -> DaemonResult<Option<ClusterConfig>>;

    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    fn save(&self, config: &ClusterConfig) -> DaemonResult<()>;
}

// ---------------------------------------------------------------------------
// JsonFilePersistence
// ---------------------------------------------------------------------------

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigPersistence for JsonFilePersistence {
    fn load(&self) -> DaemonResult<Option<ClusterConfig>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&text).map_err(|e| {
            DaemonError::ConfigInvalid(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Some(config))
    }

    fn save(&self, config: &ClusterConfig) -> DaemonResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut body = serde_json::to_vec_pretty(config)?;
        body.push(b'\n');
        write_atomic(&self.path, &body)
    }
}

/// Writes `body` to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, body: &[u8]) -> DaemonResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryPersistence
// ---------------------------------------------------------------------------

/// Keeps the document in memory. Counts saves so tests can assert on them.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    document: Mutex<Option<ClusterConfig>>,
    saves: Mutex<usize>,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new(initial: Option<ClusterConfig>) -> Self {
        Self {
            document: Mutex::new(initial),
            saves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn saved(&self) -> Option<ClusterConfig> {
        self.document.lock().clone()
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ConfigPersistence for MemoryPersistence {
    fn load(&self) -> DaemonResult<Option<ClusterConfig>> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, config: &ClusterConfig) -> DaemonResult<()> {
        *self.document.lock() = Some(config.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pulseha_core::Node;

    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("config.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_yields_the_same_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("nested/config.json"));

        let mut config = ClusterConfig::default();
        config.pulseha.local_node = "uid-1".to_string();
        config
            .nodes
            .insert("uid-1".to_string(), Node::new("node-1", "10.0.0.1", 9000));
        config
            .floating_ip_groups
            .insert("web".to_string(), vec!["192.0.2.10/24".to_string()]);

        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), Some(config));
        assert!(!dir.path().join("nested/config.json.tmp").exists());
    }

    #[test]
    fn malformed_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = JsonFilePersistence::new(&path).load().unwrap_err();
        assert!(matches!(err, DaemonError::ConfigInvalid(_)));
    }

    #[test]
    fn memory_persistence_counts_saves() {
        let store = MemoryPersistence::default();
        store.save(&ClusterConfig::default()).unwrap();
        store.save(&ClusterConfig::default()).unwrap();
        assert_eq!(store.save_count(), 2);
        assert!(store.saved().is_some());
    }
}
