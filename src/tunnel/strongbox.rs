//! Tiny on-disk key/value file for cross-process discovery.
//!
//! The registry server picks an ephemeral port at start; sibling processes
//! find it by reading the strongbox instead of sharing memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::RemoteXpcError;

/// Well-known key the tunnel registry publishes its port under.
pub const REGISTRY_PORT_KEY: &str = "tunnel-registry-port";

const STRONGBOX_FILE: &str = "remotexpc-strongbox.json";

/// Handle to one strongbox file.
#[derive(Debug, Clone)]
pub struct Strongbox {
    path: PathBuf,
}

impl Strongbox {
    /// The conventional per-user location.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(STRONGBOX_FILE)
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, RemoteXpcError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, map: &BTreeMap<String, String>) -> Result<(), RemoteXpcError> {
        let bytes = serde_json::to_vec_pretty(map)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, RemoteXpcError> {
        Ok(self.load()?.get(key).cloned())
    }

    pub fn put(&self, key: &str, value: impl Into<String>) -> Result<(), RemoteXpcError> {
        let mut map = self.load()?;
        map.insert(key.to_string(), value.into());
        self.store(&map)
    }

    pub fn remove(&self, key: &str) -> Result<(), RemoteXpcError> {
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.store(&map)?;
        }
        Ok(())
    }
}
