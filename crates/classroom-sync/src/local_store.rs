//! Persistent on-device key/value store of JSON documents.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileStore`]: one JSON file per key, written atomically (temp file + rename)
//! - [`MemoryStore`]: a `DashMap`, with write-failure injection for tests

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::LocalStoreError;
use crate::records::PERSISTED_VERSION;
use crate::types::{ClassId, EntityRecord, EntityType};

/// Namespaced JSON document store that survives process restarts.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Read a document. Missing keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Value>, LocalStoreError>;

    /// Write a document, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> Result<(), LocalStoreError>;

    /// Delete a document. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), LocalStoreError>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, LocalStoreError>;
}

/// On-disk shape of one persisted collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCollection {
    pub version: u32,
    pub class_id: ClassId,
    pub entity_type: EntityType,
    pub saved_at: DateTime<Utc>,
    pub items: Vec<EntityRecord>,
}

impl PersistedCollection {
    pub fn new(class_id: ClassId, entity_type: EntityType, items: Vec<EntityRecord>) -> Self {
        Self {
            version: PERSISTED_VERSION,
            class_id,
            entity_type,
            saved_at: Utc::now(),
            items,
        }
    }

    pub fn local_only_count(&self) -> usize {
        self.items.iter().filter(|r| r.is_local_only()).count()
    }
}

/// File-backed store: `<dir>/<encoded key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, LocalStoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, LocalStoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), LocalStoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(key = %key, "wrote document");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, LocalStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(key) = decode_key(stem)
                && key.starts_with(prefix)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Filesystem-safe encoding: bytes outside `[A-Za-z0-9._-]` become `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<String, Value>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set`/`remove` fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn check_writable(&self) -> Result<(), LocalStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("memory store writes disabled").into());
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, LocalStoreError> {
        Ok(self.docs.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), LocalStoreError> {
        self.check_writable()?;
        self.docs.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        self.check_writable()?;
        self.docs.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, LocalStoreError> {
        let mut keys: Vec<String> = self
            .docs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("classroom:class-1:subjects" ; "plain")]
    #[test_case("classroom:school/7b:assignments" ; "slash")]
    #[test_case("classroom:Klasse ä:subjects" ; "unicode")]
    fn test_key_encoding_round_trip(key: &str) {
        let encoded = encode_key(key);
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains(':'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[test]
    fn test_decode_rejects_truncated_escape() {
        assert_eq!(decode_key("abc%4"), None);
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        store.set("ns:a:subjects", json!({"n": 1})).await.unwrap();
        store.set("ns:b:subjects", json!({"n": 2})).await.unwrap();

        assert_eq!(store.get("ns:a:subjects").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.keys("ns:a:").await.unwrap(), vec!["ns:a:subjects"]);

        store.remove("ns:a:subjects").await.unwrap();
        assert_eq!(store.get("ns:a:subjects").await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        assert!(matches!(
            store.set("k", json!(1)).await,
            Err(LocalStoreError::Io(_))
        ));
        store.fail_writes(false);
        store.set("k", json!(1)).await.unwrap();
    }
}
