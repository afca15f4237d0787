//! Generic state storage traits and the bundled implementations.
//!
//! Stores are deliberately dumb key/value maps: ordering safety for
//! concurrent writers comes from the single-flight discipline layered on
//! top, not from the store itself. Writes are always full-object
//! replacements.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::Display;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Errors emitted by state stores.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StateStoreError {
    /// Filesystem or I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(selvage_common::store::io))]
    Io(#[from] std::io::Error),
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(selvage_common::store::serde))]
    Serde(#[from] serde_json::Error),
    /// The store does not implement this operation
    #[error("store does not support `{0}`")]
    #[diagnostic(code(selvage_common::store::unsupported))]
    Unsupported(&'static str),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(selvage_common::store::other))]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

/// Pluggable storage for arbitrary state records.
#[async_trait]
pub trait StateStore<K, V>: Send + Sync
where
    K: Eq + Hash,
    V: Clone,
{
    /// Get the current value if present.
    async fn get(&self, key: &K) -> Option<V>;
    /// Persist the given value, replacing any previous one.
    async fn set(&self, key: K, value: V) -> Result<(), StateStoreError>;
    /// Delete the given value.
    async fn del(&self, key: &K) -> Result<(), StateStoreError>;
    /// Remove every stored value.
    async fn clear(&self) -> Result<(), StateStoreError> {
        Err(StateStoreError::Unsupported("clear"))
    }
}

/// In-memory store suitable for ephemeral state and tests.
#[derive(Clone)]
pub struct MemoryStore<K, V>(Arc<RwLock<HashMap<K, V>>>);

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }
}

#[async_trait]
impl<K, V> StateStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        self.0.read().await.get(key).cloned()
    }
    async fn set(&self, key: K, value: V) -> Result<(), StateStoreError> {
        self.0.write().await.insert(key, value);
        Ok(())
    }
    async fn del(&self, key: &K) -> Result<(), StateStoreError> {
        self.0.write().await.remove(key);
        Ok(())
    }
    async fn clear(&self) -> Result<(), StateStoreError> {
        self.0.write().await.clear();
        Ok(())
    }
}

/// File-backed store using a single JSON file keyed by `key.to_string()`.
///
/// Writes go through a temp file and an atomic rename, so a crash mid-write
/// never leaves a truncated store behind. Durable across process restarts.
///
/// NOT hardened storage; suitable for development and CLI-style tools.
///
/// Example
/// ```ignore
/// use selvage_common::store::FileStore;
/// let store = FileStore::new("/tmp/selvage-sessions.json");
/// ```
#[derive(Clone, Debug)]
pub struct FileStore {
    /// Path to the JSON file.
    pub path: PathBuf,
}

impl FileStore {
    /// Create a new file store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read_map(&self) -> Result<serde_json::Map<String, Value>, StateStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => {
                let value: Value = serde_json::from_slice(&data)?;
                match value {
                    Value::Object(map) => Ok(map),
                    _ => Err(StateStoreError::Other("store file is not a JSON object".into())),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::Map::new()),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }

    async fn write_map(
        &self,
        map: &serde_json::Map<String, Value>,
    ) -> Result<(), StateStoreError> {
        let buf = serde_json::to_vec_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl<K, V> StateStore<K, V> for FileStore
where
    K: Eq + Hash + Display + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let map = self.read_map().await.ok()?;
        let value = map.get(&key.to_string())?;
        serde_json::from_value(value.clone()).ok()
    }

    async fn set(&self, key: K, value: V) -> Result<(), StateStoreError> {
        let mut map = self.read_map().await?;
        map.insert(key.to_string(), serde_json::to_value(&value)?);
        self.write_map(&map).await
    }

    async fn del(&self, key: &K) -> Result<(), StateStoreError> {
        let mut map = self.read_map().await?;
        map.remove(&key.to_string());
        self.write_map(&map).await
    }

    async fn clear(&self) -> Result<(), StateStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> FileStore {
        let mut path = std::env::temp_dir();
        path.push(format!("selvage-store-{tag}-{}.json", std::process::id()));
        FileStore::new(path)
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::<String, u32>::default();
        store.set("a".into(), 1).await.unwrap();
        assert_eq!(store.get(&"a".to_string()).await, Some(1));
        store.set("a".into(), 2).await.unwrap();
        assert_eq!(store.get(&"a".to_string()).await, Some(2));
        store.del(&"a".to_string()).await.unwrap();
        assert_eq!(store.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn file_store_round_trip_and_delete() {
        let store = temp_store("roundtrip");
        let _ = <FileStore as StateStore<String, String>>::clear(&store).await;

        StateStore::<String, String>::set(&store, "alice".into(), "token-1".into())
            .await
            .unwrap();
        StateStore::<String, String>::set(&store, "bob".into(), "token-2".into())
            .await
            .unwrap();
        assert_eq!(
            StateStore::<String, String>::get(&store, &"alice".to_string()).await,
            Some("token-1".to_string())
        );

        StateStore::<String, String>::del(&store, &"alice".to_string())
            .await
            .unwrap();
        assert_eq!(
            StateStore::<String, String>::get(&store, &"alice".to_string()).await,
            None
        );
        // other keys survive
        assert_eq!(
            StateStore::<String, String>::get(&store, &"bob".to_string()).await,
            Some("token-2".to_string())
        );

        <FileStore as StateStore<String, String>>::clear(&store)
            .await
            .unwrap();
        assert_eq!(
            StateStore::<String, String>::get(&store, &"bob".to_string()).await,
            None
        );
    }

    #[tokio::test]
    async fn file_store_missing_file_reads_as_empty() {
        let store = temp_store("missing");
        let _ = <FileStore as StateStore<String, u32>>::clear(&store).await;
        assert_eq!(
            StateStore::<String, u32>::get(&store, &"nope".to_string()).await,
            None
        );
    }
}
