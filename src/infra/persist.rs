//! Persistence of the auth slice.
//!
//! The slice is stored as one versioned JSON record under `persist:<key>`.
//! Rehydration never fails: a missing, unreadable, or incompatible record is
//! reported through [`RehydrateOutcome`] and the session starts signed out.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::cache::mutex_lock;
use crate::config::PersistenceSettings;
use crate::domain::auth::AuthState;

use super::error::InfraError;

pub const CURRENT_VERSION: u32 = 1;
pub const DEFAULT_KEY: &str = "root";
const KEY_PREFIX: &str = "persist:";
const SOURCE: &str = "infra::persist";

/// Key/value string storage.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), InfraError>;

    /// Remove an item. Missing items are treated as success.
    async fn remove_item(&self, key: &str) -> Result<(), InfraError>;
}

/// In-process storage, mainly for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with one item.
    pub fn with_item(key: impl Into<String>, value: impl Into<String>) -> Self {
        let storage = Self::new();
        mutex_lock(&storage.items, SOURCE, "with_item").insert(key.into(), value.into());
        storage
    }

    pub fn item(&self, key: &str) -> Option<String> {
        mutex_lock(&self.items, SOURCE, "item").get(key).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError> {
        Ok(self.item(key))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), InfraError> {
        mutex_lock(&self.items, SOURCE, "set_item").insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), InfraError> {
        mutex_lock(&self.items, SOURCE, "remove_item").remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File backing `key`. Characters outside `[A-Za-z0-9._-]` become `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.directory.join(format!("{name}.json"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, InfraError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(InfraError::Io(err)),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), InfraError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value).await?;
        if let Err(err) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(InfraError::Io(err));
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), InfraError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(InfraError::Io(err)),
        }
    }
}

/// Stored layout: `{ "version": u32, "auth": AuthState }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRecord {
    version: u32,
    auth: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RehydrateOutcome {
    Restored,
    Migrated { from: u32 },
    Missing,
    Discarded { reason: String },
}

/// Result of reading the persisted record at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Rehydration {
    pub auth: AuthState,
    pub outcome: RehydrateOutcome,
}

impl Rehydration {
    fn empty(outcome: RehydrateOutcome) -> Self {
        Self {
            auth: AuthState::default(),
            outcome,
        }
    }
}

/// Upgrades the `auth` value of a record by exactly one version.
pub type Migration = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Reads and writes the versioned auth record.
pub struct Persistor {
    storage: Arc<dyn Storage>,
    storage_key: String,
    version: u32,
    migrations: BTreeMap<u32, Migration>,
    writes: tokio::sync::Mutex<()>,
}

impl Persistor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            storage_key: format!("{KEY_PREFIX}{DEFAULT_KEY}"),
            version: CURRENT_VERSION,
            migrations: BTreeMap::new(),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// File-backed persistor configured from settings.
    pub fn from_settings(settings: &PersistenceSettings) -> Self {
        Self::new(Arc::new(FileStorage::new(settings.directory.clone())))
            .with_key(&settings.key)
            .with_version(settings.version)
    }

    /// Store under `persist:<key>`.
    pub fn with_key(mut self, key: &str) -> Self {
        self.storage_key = format!("{KEY_PREFIX}{key}");
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Register the upgrade from `from` to `from + 1`.
    pub fn with_migration<F>(mut self, from: u32, migration: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.migrations.insert(from, Box::new(migration));
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Write the auth slice returned by `snapshot`.
    ///
    /// Writes are serialized and `snapshot` runs only once this write holds
    /// the lock, so the last completed write always carries the latest state.
    pub async fn persist<F>(&self, snapshot: F) -> Result<(), InfraError>
    where
        F: FnOnce() -> AuthState,
    {
        let _guard = self.writes.lock().await;
        let auth = snapshot();
        let record = PersistedRecord {
            version: self.version,
            auth: serde_json::to_value(&auth)?,
        };
        let body = serde_json::to_string(&record)?;
        self.storage.set_item(&self.storage_key, body).await?;
        debug!(key = %self.storage_key, version = self.version, "auth state persisted");
        Ok(())
    }

    /// Read the persisted record.
    pub async fn rehydrate(&self) -> Rehydration {
        let raw = match self.storage.get_item(&self.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Rehydration::empty(RehydrateOutcome::Missing),
            Err(err) => return self.discard(format!("failed to read record: {err}")),
        };

        match self.decode(&raw) {
            Ok(rehydration) => rehydration,
            Err(reason) => self.discard(reason),
        }
    }

    /// Delete the persisted record.
    pub async fn purge(&self) -> Result<(), InfraError> {
        let _guard = self.writes.lock().await;
        self.storage.remove_item(&self.storage_key).await
    }

    /// Wait for any write in progress to complete.
    pub async fn flush(&self) {
        let _guard = self.writes.lock().await;
    }

    fn decode(&self, raw: &str) -> Result<Rehydration, String> {
        let record: PersistedRecord =
            serde_json::from_str(raw).map_err(|err| format!("corrupt record: {err}"))?;

        if record.version > self.version {
            return Err(format!(
                "record version {} is newer than supported version {}",
                record.version, self.version
            ));
        }

        let mut auth = record.auth;
        for version in record.version..self.version {
            let migration = self
                .migrations
                .get(&version)
                .ok_or_else(|| format!("no migration from version {version}"))?;
            auth = migration(auth)
                .map_err(|reason| format!("migration from version {version} failed: {reason}"))?;
        }

        let auth: AuthState = serde_json::from_value(auth)
            .map_err(|err| format!("auth state does not match current layout: {err}"))?;
        let outcome = if record.version == self.version {
            RehydrateOutcome::Restored
        } else {
            RehydrateOutcome::Migrated {
                from: record.version,
            }
        };
        Ok(Rehydration { auth, outcome })
    }

    fn discard(&self, reason: String) -> Rehydration {
        warn!(key = %self.storage_key, %reason, "discarding persisted auth state");
        Rehydration::empty(RehydrateOutcome::Discarded { reason })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::auth::User;

    fn signed_in() -> AuthState {
        AuthState {
            user: Some(User {
                id: "u-7".to_string(),
                email: None,
            }),
            access_token: Some("token-7".to_string()),
        }
    }

    fn seeded(record: Value) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::with_item("persist:root", record.to_string()))
    }

    #[tokio::test]
    async fn persisted_state_round_trips() {
        let storage = Arc::new(MemoryStorage::new());
        let persistor = Persistor::new(storage.clone());
        persistor.persist(signed_in).await.expect("persist");

        let stored: Value =
            serde_json::from_str(&storage.item("persist:root").expect("written")).expect("json");
        assert_eq!(stored["version"], 1);

        let rehydration = persistor.rehydrate().await;
        assert_eq!(rehydration.outcome, RehydrateOutcome::Restored);
        assert_eq!(rehydration.auth, signed_in());
    }

    #[tokio::test]
    async fn older_version_without_migration_is_discarded() {
        let storage = seeded(json!({"version": 0, "auth": {"access_token": "old"}}));
        let rehydration = Persistor::new(storage).rehydrate().await;
        assert!(matches!(rehydration.outcome, RehydrateOutcome::Discarded { .. }));
        assert!(!rehydration.auth.is_authenticated());
    }

    #[tokio::test]
    async fn older_version_is_migrated_through_chain() {
        let storage = seeded(json!({"version": 0, "auth": {"token": "old", "uid": "u-1"}}));
        let persistor = Persistor::new(storage).with_migration(0, |auth| {
            Ok(json!({
                "user": {"id": auth["uid"]},
                "access_token": auth["token"],
            }))
        });

        let rehydration = persistor.rehydrate().await;
        assert_eq!(rehydration.outcome, RehydrateOutcome::Migrated { from: 0 });
        assert_eq!(rehydration.auth.access_token.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn corrupt_and_newer_records_are_discarded() {
        let corrupt = Arc::new(MemoryStorage::with_item("persist:root", "{not json"));
        let outcome = Persistor::new(corrupt).rehydrate().await.outcome;
        assert!(matches!(outcome, RehydrateOutcome::Discarded { .. }));

        let newer = seeded(json!({"version": 9, "auth": {}}));
        let outcome = Persistor::new(newer).rehydrate().await.outcome;
        assert!(matches!(outcome, RehydrateOutcome::Discarded { .. }));
    }

    #[tokio::test]
    async fn missing_record_reports_missing() {
        let persistor = Persistor::new(Arc::new(MemoryStorage::new())).with_key("session");
        assert_eq!(persistor.storage_key(), "persist:session");
        assert_eq!(persistor.rehydrate().await.outcome, RehydrateOutcome::Missing);
    }

    #[tokio::test]
    async fn file_storage_writes_atomically_and_purges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(FileStorage::new(dir.path().join("state")));
        let persistor = Persistor::new(storage.clone());

        persistor.persist(signed_in).await.expect("persist");
        let path = storage.path_for("persist:root");
        assert!(path.ends_with("persist_root.json"));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(persistor.rehydrate().await.auth, signed_in());

        persistor.purge().await.expect("purge");
        assert!(!path.exists());
        persistor.purge().await.expect("purging twice is fine");
        assert_eq!(persistor.rehydrate().await.outcome, RehydrateOutcome::Missing);
    }
}
