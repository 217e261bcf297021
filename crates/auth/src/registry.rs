//! The API key registry and its persistence.
//!
//! Persisted as `config/api_keys.json` under the data folder: a JSON
//! object of key -> `{scope, deletable}`. The file is written via a
//! temp-file rename so a crash mid-write cannot leave a torn file that
//! bricks the next startup; a file that fails to parse is logged and
//! the registry starts clean.

use crate::scope::Scope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

const KEYS_FILE: &str = "api_keys.json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("API key must not be empty")]
    EmptyKey,
    #[error("unknown API key")]
    UnknownKey,
    #[error("API key is not deletable")]
    NotDeletable,
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub scope: Scope,
    pub deletable: bool,
}

/// All keys the server accepts.
#[derive(Debug)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, ApiKeyEntry>,
    master_key: String,
    /// `<data>/config`; `None` disables persistence.
    config_dir: Option<PathBuf>,
    dirty: bool,
}

impl ApiKeyRegistry {
    /// Create a registry with the master key installed. The master key
    /// always has full scope and is not deletable.
    pub fn new(
        master_key: impl Into<String>,
        config_dir: Option<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let master_key = master_key.into();
        if master_key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        let mut registry = Self {
            keys: HashMap::new(),
            master_key,
            config_dir,
            dirty: false,
        };
        registry.install_master();
        Ok(registry)
    }

    fn install_master(&mut self) {
        self.keys.insert(
            self.master_key.clone(),
            ApiKeyEntry {
                scope: Scope::ReadWriteDelete,
                deletable: false,
            },
        );
    }

    pub fn master_key(&self) -> &str {
        &self.master_key
    }

    pub fn is_master(&self, key: &str) -> bool {
        key == self.master_key
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn lookup(&self, key: &str) -> Option<&ApiKeyEntry> {
        self.keys.get(key)
    }

    pub fn scope_of(&self, key: &str) -> Option<Scope> {
        self.keys.get(key).map(|entry| entry.scope)
    }

    /// Insert or update a key. Registering the master key ignores the
    /// requested scope and deletability. `deletable` is one-way: once a
    /// key is marked non-deletable it stays that way across updates.
    /// Returns the scope actually stored.
    pub fn register(
        &mut self,
        key: &str,
        scope: Scope,
        deletable: bool,
    ) -> Result<Scope, RegistryError> {
        if key.is_empty() {
            return Err(RegistryError::EmptyKey);
        }
        if self.is_master(key) {
            self.install_master();
            return Ok(Scope::ReadWriteDelete);
        }

        let deletable = match self.keys.get(key) {
            Some(existing) if !existing.deletable => false,
            _ => deletable,
        };
        self.keys.insert(key.to_string(), ApiKeyEntry { scope, deletable });
        self.dirty = true;
        Ok(scope)
    }

    /// Remove a key. Fails for unknown keys and for keys (including the
    /// master key) marked non-deletable.
    pub fn remove(&mut self, key: &str) -> Result<(), RegistryError> {
        let entry = self.keys.get(key).ok_or(RegistryError::UnknownKey)?;
        if !entry.deletable {
            return Err(RegistryError::NotDeletable);
        }
        self.keys.remove(key);
        self.dirty = true;
        Ok(())
    }

    /// Load the persisted key set, then re-install the master key so
    /// its invariants hold no matter what the file contained. A file
    /// that fails to parse is logged and ignored.
    pub fn load(&mut self) {
        let Some(path) = self.keys_path() else {
            return;
        };
        if !path.is_file() {
            return;
        }
        match fs::read(&path).map_err(RegistryError::from).and_then(|raw| {
            serde_json::from_slice::<HashMap<String, ApiKeyEntry>>(&raw).map_err(Into::into)
        }) {
            Ok(persisted) => {
                let count = persisted.len();
                for (key, entry) in persisted {
                    if self.is_master(&key) {
                        continue;
                    }
                    self.keys.insert(key, entry);
                }
                tracing::info!("loaded {} persisted API key(s)", count);
            }
            Err(e) => {
                tracing::warn!("failed to load {}: {}; starting clean", path.display(), e);
            }
        }
        self.install_master();
    }

    /// Persist the non-master key set. Skipped when nothing changed or
    /// persistence is disabled; failures are logged and left dirty so
    /// the next flush retries.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(path) = self.keys_path() else {
            return;
        };
        match self.write_atomic(&path) {
            Ok(()) => {
                self.dirty = false;
                tracing::debug!("persisted {} API key(s)", self.keys.len() - 1);
            }
            Err(e) => tracing::warn!("failed to persist API keys: {}", e),
        }
    }

    fn write_atomic(&self, path: &std::path::Path) -> Result<(), RegistryError> {
        let persisted: HashMap<&String, &ApiKeyEntry> = self
            .keys
            .iter()
            .filter(|(key, _)| !self.is_master(key))
            .collect();
        let payload = serde_json::to_vec(&persisted)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn keys_path(&self) -> Option<PathBuf> {
        self.config_dir.as_ref().map(|d| d.join(KEYS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MASTER: &str = "master-secret";

    fn in_memory() -> ApiKeyRegistry {
        ApiKeyRegistry::new(MASTER, None).unwrap()
    }

    #[test]
    fn test_master_key_installed_at_startup() {
        let registry = in_memory();
        let entry = registry.lookup(MASTER).unwrap();
        assert_eq!(entry.scope, Scope::ReadWriteDelete);
        assert!(!entry.deletable);
    }

    #[test]
    fn test_empty_master_key_rejected() {
        assert!(matches!(
            ApiKeyRegistry::new("", None),
            Err(RegistryError::EmptyKey)
        ));
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = in_memory();
        registry.register("k1", Scope::ReadOnly, true).unwrap();
        assert_eq!(registry.scope_of("k1"), Some(Scope::ReadOnly));
        assert_eq!(registry.scope_of("nope"), None);
    }

    #[test]
    fn test_register_empty_key_fails() {
        let mut registry = in_memory();
        assert!(matches!(
            registry.register("", Scope::ReadOnly, true),
            Err(RegistryError::EmptyKey)
        ));
    }

    #[test]
    fn test_master_key_registration_forced() {
        let mut registry = in_memory();
        // Attempting to downgrade the master key has no effect.
        let stored = registry.register(MASTER, Scope::ReadOnly, true).unwrap();
        assert_eq!(stored, Scope::ReadWriteDelete);
        let entry = registry.lookup(MASTER).unwrap();
        assert_eq!(entry.scope, Scope::ReadWriteDelete);
        assert!(!entry.deletable);
    }

    #[test]
    fn test_master_key_not_removable() {
        let mut registry = in_memory();
        assert!(matches!(
            registry.remove(MASTER),
            Err(RegistryError::NotDeletable)
        ));
        assert!(registry.lookup(MASTER).is_some());
    }

    #[test]
    fn test_remove_unknown_key_fails() {
        let mut registry = in_memory();
        assert!(matches!(registry.remove("nope"), Err(RegistryError::UnknownKey)));
    }

    #[test]
    fn test_deletable_is_one_way() {
        let mut registry = in_memory();
        registry.register("k1", Scope::ReadOnly, false).unwrap();
        // A later update cannot flip it back to deletable.
        registry.register("k1", Scope::ReadWrite, true).unwrap();
        assert!(!registry.lookup("k1").unwrap().deletable);
        assert!(matches!(registry.remove("k1"), Err(RegistryError::NotDeletable)));
    }

    #[test]
    fn test_update_scope_in_place() {
        let mut registry = in_memory();
        registry.register("k1", Scope::ReadOnly, true).unwrap();
        registry.register("k1", Scope::ReadWriteDelete, true).unwrap();
        assert_eq!(registry.scope_of("k1"), Some(Scope::ReadWriteDelete));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_persist_roundtrip_excludes_master() {
        let dir = TempDir::new().unwrap();
        let config = Some(dir.path().to_path_buf());

        {
            let mut registry = ApiKeyRegistry::new(MASTER, config.clone()).unwrap();
            registry.register("k1", Scope::ReadOnly, true).unwrap();
            registry.register("k2", Scope::ReadWrite, false).unwrap();
            registry.flush();
        }

        // The file on disk must not contain the master key.
        let raw = fs::read_to_string(dir.path().join(KEYS_FILE)).unwrap();
        assert!(!raw.contains(MASTER));
        assert!(raw.contains("k1"));

        let mut reloaded = ApiKeyRegistry::new(MASTER, config).unwrap();
        reloaded.load();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.scope_of("k1"), Some(Scope::ReadOnly));
        assert_eq!(reloaded.scope_of("k2"), Some(Scope::ReadWrite));
        assert_eq!(reloaded.scope_of(MASTER), Some(Scope::ReadWriteDelete));
    }

    #[test]
    fn test_flush_skipped_when_clean() {
        let dir = TempDir::new().unwrap();
        let mut registry = ApiKeyRegistry::new(MASTER, Some(dir.path().to_path_buf())).unwrap();
        registry.flush();
        assert!(!dir.path().join(KEYS_FILE).exists());
    }

    #[test]
    fn test_flush_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let mut registry = ApiKeyRegistry::new(MASTER, Some(dir.path().to_path_buf())).unwrap();
        registry.register("k1", Scope::ReadOnly, true).unwrap();
        registry.flush();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![KEYS_FILE.to_string()]);
    }

    #[test]
    fn test_corrupt_key_file_starts_clean() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(KEYS_FILE), b"{ not json").unwrap();

        let mut registry = ApiKeyRegistry::new(MASTER, Some(dir.path().to_path_buf())).unwrap();
        registry.load();
        // Only the master key survives.
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(MASTER).is_some());
    }

    #[test]
    fn test_load_ignores_persisted_master_entry() {
        let dir = TempDir::new().unwrap();
        // A hand-edited file that illegally contains the master key with
        // a weak scope must not downgrade it.
        fs::write(
            dir.path().join(KEYS_FILE),
            format!(r#"{{"{MASTER}":{{"scope":"readonly","deletable":true}}}}"#),
        )
        .unwrap();

        let mut registry = ApiKeyRegistry::new(MASTER, Some(dir.path().to_path_buf())).unwrap();
        registry.load();
        let entry = registry.lookup(MASTER).unwrap();
        assert_eq!(entry.scope, Scope::ReadWriteDelete);
        assert!(!entry.deletable);
    }

    #[test]
    fn test_removed_key_gone_after_reload() {
        let dir = TempDir::new().unwrap();
        let config = Some(dir.path().to_path_buf());

        {
            let mut registry = ApiKeyRegistry::new(MASTER, config.clone()).unwrap();
            registry.register("k1", Scope::ReadOnly, true).unwrap();
            registry.flush();
            registry.remove("k1").unwrap();
            registry.flush();
        }

        let mut reloaded = ApiKeyRegistry::new(MASTER, config).unwrap();
        reloaded.load();
        assert_eq!(reloaded.scope_of("k1"), None);
    }
}
