//! On-disk persistence of reconciled bundles
//!
//! Layout: `<base>/<currency>/<network>/<entity_type>/<identifier>.json`, where the
//! identifier is the hex SHA-256 of the entity key. Each file carries the entity
//! type version; files of another version are skipped on load.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Serialize)]
struct StoredRef<'a, T> {
    version: u32,
    key: &'a str,
    entity: &'a T,
}

#[derive(Deserialize)]
struct Stored<T> {
    version: u32,
    key: String,
    entity: T,
}

/// Typed entity store for one wallet manager
#[derive(Debug)]
pub struct FileService {
    dir: PathBuf,
    entity_type: String,
    version: u32,
    /// identifier -> digest of the last content written or read
    digests: DashMap<String, [u8; 32]>,
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

impl FileService {
    pub fn create(
        base_path: &Path,
        currency: &str,
        network: &str,
        entity_type: &str,
        version: u32,
    ) -> Result<Self> {
        let dir = base_path.join(currency).join(network).join(entity_type);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::FileService(format!("{}: {}", dir.display(), e)))?;
        debug!(dir = %dir.display(), entity_type, version, "File service ready");

        Ok(Self {
            dir,
            entity_type: entity_type.to_string(),
            version,
            digests: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// File name stem for an entity key
    pub fn identifier(key: &str) -> String {
        hex::encode(digest(key.as_bytes()))
    }

    fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{}.json", identifier))
    }

    /// Write `entity` under `key`; returns false when identical content is already stored
    pub fn save<T: Serialize>(&self, key: &str, entity: &T) -> Result<bool> {
        let bytes = serde_json::to_vec_pretty(&StoredRef {
            version: self.version,
            key,
            entity,
        })?;
        let identifier = Self::identifier(key);
        let content = digest(&bytes);
        if self.digests.get(&identifier).is_some_and(|d| *d == content) {
            return Ok(false);
        }

        let path = self.path_for(&identifier);
        fs::write(&path, &bytes)
            .map_err(|e| Error::FileService(format!("{}: {}", path.display(), e)))?;
        self.digests.insert(identifier, content);
        Ok(true)
    }

    /// Every readable entity, ordered by key
    ///
    /// Unreadable or foreign-version files are logged and skipped.
    pub fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::FileService(format!("{}: {}", self.dir.display(), e)))?;

        let mut loaded = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable entity file");
                    continue;
                }
            };
            let stored: Stored<T> = match serde_json::from_slice(&bytes) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt entity file");
                    continue;
                }
            };
            if stored.version != self.version {
                warn!(
                    path = %path.display(),
                    found = stored.version,
                    expected = self.version,
                    "Skipping entity file of another version"
                );
                continue;
            }
            self.digests.insert(Self::identifier(&stored.key), digest(&bytes));
            loaded.push((stored.key, stored.entity));
        }

        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(entity_type = %self.entity_type, count = loaded.len(), "Entities loaded");
        Ok(loaded.into_iter().map(|(_, entity)| entity).collect())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let identifier = Self::identifier(key);
        self.digests.remove(&identifier);
        match fs::remove_file(self.path_for(&identifier)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileService(e.to_string())),
        }
    }

    /// Remove every stored entity of this type
    pub fn clear(&self) -> Result<()> {
        self.digests.clear();
        fs::remove_dir_all(&self.dir).map_err(|e| Error::FileService(e.to_string()))?;
        fs::create_dir_all(&self.dir).map_err(|e| Error::FileService(e.to_string()))?;
        Ok(())
    }
}
