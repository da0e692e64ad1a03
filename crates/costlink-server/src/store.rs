//! Whole-document store. The lock covers one load or save, so concurrent
//! read-modify-writes of the same document are last-write-wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use costlink_contracts::{SessionsDocument, SettingsDocument, TenantsDocument};
use costlink_kernel::trim_sessions;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialize {collection} failed: {message}")]
    Serialize {
        collection: &'static str,
        message: String,
    },
    #[error("write {collection} failed: {message}")]
    Write {
        collection: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Tenants,
    Settings,
    Sessions,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::Tenants => "tenants",
            Collection::Settings => "settings",
            Collection::Sessions => "sessions",
        }
    }

    fn file_name(self) -> String {
        format!("{}.json", self.name())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    documents: HashMap<Collection, Value>,
}

pub struct JsonFileStore {
    dir: PathBuf,
}

enum StoreBackend {
    Memory(MemoryStore),
    Json(JsonFileStore),
}

impl StoreBackend {
    async fn load_raw(&self, collection: Collection) -> Option<Value> {
        match self {
            StoreBackend::Memory(store) => store.documents.get(&collection).cloned(),
            StoreBackend::Json(store) => store.load_raw(collection).await,
        }
    }

    async fn save_raw(&mut self, collection: Collection, doc: Value) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store.documents.insert(collection, doc);
                Ok(())
            }
            StoreBackend::Json(store) => store.save_raw(collection, &doc).await,
        }
    }
}

impl JsonFileStore {
    async fn load_raw(&self, collection: Collection) -> Option<Value> {
        let path = self.dir.join(collection.file_name());
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "store read failed, using empty document");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed store document, using empty document");
                None
            }
        }
    }

    async fn save_raw(&self, collection: Collection, doc: &Value) -> Result<(), StoreError> {
        let write_err = |e: std::io::Error| StoreError::Write {
            collection: collection.name(),
            message: e.to_string(),
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;

        let text = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Serialize {
            collection: collection.name(),
            message: e.to_string(),
        })?;
        let path = self.dir.join(collection.file_name());
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", collection.name(), uuid::Uuid::new_v4().as_simple()));
        tokio::fs::write(&tmp, text).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)
    }
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<Mutex<StoreBackend>>,
    session_map_limit: usize,
}

impl Store {
    pub fn memory(session_map_limit: usize) -> Self {
        Self::with_backend(StoreBackend::Memory(MemoryStore::default()), session_map_limit)
    }

    pub fn json(dir: impl Into<PathBuf>, session_map_limit: usize) -> Self {
        Self::with_backend(
            StoreBackend::Json(JsonFileStore { dir: dir.into() }),
            session_map_limit,
        )
    }

    fn with_backend(backend: StoreBackend, session_map_limit: usize) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            session_map_limit: session_map_limit.max(1),
        }
    }

    /// Loads a document; missing or malformed content yields the default.
    pub async fn load<T: DeserializeOwned + Default>(&self, collection: Collection) -> T {
        let raw = { self.backend.lock().await.load_raw(collection).await };
        match raw {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(collection = collection.name(), error = %e, "store document has unexpected shape, using empty document");
                T::default()
            }),
            None => T::default(),
        }
    }

    pub async fn save<T: Serialize>(&self, collection: Collection, doc: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc).map_err(|e| StoreError::Serialize {
            collection: collection.name(),
            message: e.to_string(),
        })?;
        self.backend.lock().await.save_raw(collection, value).await
    }

    pub async fn tenants(&self) -> TenantsDocument {
        self.load(Collection::Tenants).await
    }

    /// Records violating `active => credential` are demoted before writing.
    pub async fn save_tenants(&self, mut doc: TenantsDocument) -> Result<(), StoreError> {
        for record in doc.values_mut() {
            record.normalize();
        }
        self.save(Collection::Tenants, &doc).await
    }

    pub async fn settings(&self) -> SettingsDocument {
        self.load(Collection::Settings).await
    }

    pub async fn save_settings(&self, doc: &SettingsDocument) -> Result<(), StoreError> {
        self.save(Collection::Settings, doc).await
    }

    pub async fn sessions(&self) -> SessionsDocument {
        self.load(Collection::Sessions).await
    }

    /// Applies the FIFO cap before writing.
    pub async fn save_sessions(&self, mut doc: SessionsDocument) -> Result<(), StoreError> {
        let evicted = trim_sessions(&mut doc, self.session_map_limit);
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "session map trimmed");
        }
        self.save(Collection::Sessions, &doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costlink_contracts::{SessionMapping, TenantRecord, TenantStatus};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("costlink-store-{tag}-{nanos}"))
    }

    fn tenant(id: &str, status: TenantStatus, token: Option<&str>) -> TenantRecord {
        TenantRecord {
            account_id: id.to_string(),
            app_id: "app".to_string(),
            account_name: id.to_uppercase(),
            status,
            access_token: token.map(str::to_string),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            activated_at: None,
            deactivated_at: None,
            tariff: None,
        }
    }

    #[tokio::test]
    async fn json_store_round_trips_and_creates_dir() {
        let dir = temp_dir("roundtrip");
        let store = Store::json(&dir, 10);
        let mut doc = TenantsDocument::new();
        doc.insert("a".to_string(), tenant("a", TenantStatus::Active, Some("tok")));
        store.save_tenants(doc).await.unwrap();

        let reopened = Store::json(&dir, 10);
        let loaded = reopened.tenants().await;
        assert_eq!(loaded["a"].access_token.as_deref(), Some("tok"));
        assert!(dir.join("tenants.json").exists());
    }

    #[tokio::test]
    async fn malformed_document_degrades_to_empty() {
        let dir = temp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sessions.json"), "{not json").unwrap();
        std::fs::write(dir.join("tenants.json"), "[1, 2, 3]").unwrap();

        let store = Store::json(&dir, 10);
        assert!(store.sessions().await.is_empty());
        assert!(store.tenants().await.is_empty());
    }

    #[tokio::test]
    async fn save_tenants_never_persists_active_without_credential() {
        let store = Store::memory(10);
        let mut doc = TenantsDocument::new();
        doc.insert("a".to_string(), tenant("a", TenantStatus::Active, None));
        store.save_tenants(doc).await.unwrap();

        let loaded = store.tenants().await;
        assert_eq!(loaded["a"].status, TenantStatus::Inactive);
    }

    #[tokio::test]
    async fn save_sessions_applies_fifo_cap() {
        let store = Store::memory(2);
        let mut doc = SessionsDocument::new();
        for (key, ts) in [
            ("s1", "2026-01-01T00:00:00+00:00"),
            ("s2", "2026-01-02T00:00:00+00:00"),
            ("s3", "2026-01-03T00:00:00+00:00"),
        ] {
            doc.insert(
                key.to_string(),
                SessionMapping {
                    account_id: "a".to_string(),
                    account_name: String::new(),
                    created_at: ts.to_string(),
                },
            );
        }
        store.save_sessions(doc).await.unwrap();
        let loaded = store.sessions().await;
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.contains_key("s1"));
    }

    #[tokio::test]
    async fn concurrent_read_modify_write_is_last_write_wins() {
        let store = Store::memory(10);
        let mut first = store.tenants().await;
        let mut second = store.tenants().await;

        first.insert("a".to_string(), tenant("a", TenantStatus::Active, Some("tok-a")));
        second.insert("b".to_string(), tenant("b", TenantStatus::Active, Some("tok-b")));
        store.save_tenants(first).await.unwrap();
        store.save_tenants(second).await.unwrap();

        let loaded = store.tenants().await;
        assert!(!loaded.contains_key("a"));
        assert!(loaded.contains_key("b"));
    }
}
