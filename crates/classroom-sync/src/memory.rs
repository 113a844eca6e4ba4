//! In-memory remote store with scriptable failures.
//!
//! Used by the CLI walkthrough and the test suites. Listeners are retained
//! after release so a test can deliver a late event to a torn-down listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::RemoteError;
use crate::remote::{ChangeCallback, ListenerHandle, RemoteEvent, RemoteStore};
use crate::types::{ClassId, EntityRecord, EntityType};

type CollectionKey = (ClassId, EntityType);

struct Listener {
    id: u64,
    key: CollectionKey,
    callback: ChangeCallback,
    active: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`RemoteStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryRemote {
    docs: Mutex<HashMap<CollectionKey, Vec<EntityRecord>>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    failure: Mutex<Option<RemoteError>>,
    gates: Mutex<HashMap<ClassId, Arc<Semaphore>>>,
    next_listener: AtomicU64,
    next_doc: AtomicU64,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document directly, as another device would.
    pub fn insert_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        fields: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> String {
        let id = self.next_id();
        let record = EntityRecord {
            id: id.clone(),
            remote_id: Some(id.clone()),
            created_at,
            updated_at: created_at,
            created_by: None,
            updated_by: None,
            fields,
        };
        lock(&self.docs)
            .entry((class_id.clone(), entity_type.clone()))
            .or_default()
            .push(record);
        self.notify(class_id, entity_type);
        id
    }

    pub fn documents(&self, class_id: &ClassId, entity_type: &EntityType) -> Vec<EntityRecord> {
        lock(&self.docs)
            .get(&(class_id.clone(), entity_type.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Fail every subsequent call with `err` until [`recover`](Self::recover).
    pub fn fail_with(&self, err: RemoteError) {
        *lock(&self.failure) = Some(err);
    }

    pub fn recover(&self) {
        *lock(&self.failure) = None;
    }

    /// Hold every `get` for `class_id` until [`resume_loads`](Self::resume_loads).
    pub fn pause_loads(&self, class_id: &ClassId) {
        lock(&self.gates).insert(class_id.clone(), Arc::new(Semaphore::new(0)));
    }

    pub fn resume_loads(&self, class_id: &ClassId) {
        if let Some(gate) = lock(&self.gates).remove(class_id) {
            gate.close();
        }
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of unreleased listeners on a collection.
    pub fn active_listeners(&self, class_id: &ClassId, entity_type: &EntityType) -> usize {
        let key = (class_id.clone(), entity_type.clone());
        lock(&self.listeners)
            .iter()
            .filter(|l| l.active && l.key == key)
            .count()
    }

    /// Deliver the current snapshot to the active listeners of a collection.
    pub fn emit(&self, class_id: &ClassId, entity_type: &EntityType) {
        self.notify(class_id, entity_type);
    }

    /// Deliver `event` to every listener ever registered on a collection,
    /// released ones included.
    pub fn emit_to_all(&self, class_id: &ClassId, entity_type: &EntityType, event: RemoteEvent) {
        let key = (class_id.clone(), entity_type.clone());
        let callbacks: Vec<ChangeCallback> = lock(&self.listeners)
            .iter()
            .filter(|l| l.key == key)
            .map(|l| l.callback.clone())
            .collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Deliver a transport error to the active listeners of a collection.
    pub fn fail_listeners(&self, class_id: &ClassId, entity_type: &EntityType, err: RemoteError) {
        for callback in self.active_callbacks(class_id, entity_type) {
            callback(RemoteEvent::Error(err.clone()));
        }
    }

    fn next_id(&self) -> String {
        format!("doc-{:04}", self.next_doc.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check(&self) -> Result<(), RemoteError> {
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn active_callbacks(&self, class_id: &ClassId, entity_type: &EntityType) -> Vec<ChangeCallback> {
        let key = (class_id.clone(), entity_type.clone());
        lock(&self.listeners)
            .iter()
            .filter(|l| l.active && l.key == key)
            .map(|l| l.callback.clone())
            .collect()
    }

    /// Callbacks run with no lock held.
    fn notify(&self, class_id: &ClassId, entity_type: &EntityType) {
        let callbacks = self.active_callbacks(class_id, entity_type);
        if callbacks.is_empty() {
            return;
        }
        let snapshot = self.documents(class_id, entity_type);
        trace!(class_id = %class_id, entity_type = %entity_type, listeners = callbacks.len(), "delivering snapshot");
        for callback in callbacks {
            callback(RemoteEvent::Snapshot(snapshot.clone()));
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
    ) -> Result<Vec<EntityRecord>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.gates).get(class_id).cloned();
        if let Some(gate) = gate {
            // Closed on resume; the acquire error is the release signal.
            let _ = gate.acquire().await;
        }
        self.check()?;
        Ok(self.documents(class_id, entity_type))
    }

    async fn create_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        record: &EntityRecord,
    ) -> Result<String, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let id = self.next_id();
        let mut stored = record.clone();
        stored.promote(id.clone());
        lock(&self.docs)
            .entry((class_id.clone(), entity_type.clone()))
            .or_default()
            .push(stored);
        self.notify(class_id, entity_type);
        Ok(id)
    }

    async fn update_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        id: &str,
        record: &EntityRecord,
    ) -> Result<(), RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        {
            let mut docs = lock(&self.docs);
            let existing = docs
                .get_mut(&(class_id.clone(), entity_type.clone()))
                .and_then(|items| items.iter_mut().find(|r| r.id == id))
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            let mut stored = record.clone();
            stored.promote(id.to_string());
            *existing = stored;
        }
        self.notify(class_id, entity_type);
        Ok(())
    }

    async fn delete_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        id: &str,
    ) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        {
            let mut docs = lock(&self.docs);
            let items = docs
                .get_mut(&(class_id.clone(), entity_type.clone()))
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            let before = items.len();
            items.retain(|r| r.id != id);
            if items.len() == before {
                return Err(RemoteError::NotFound(id.to_string()));
            }
        }
        self.notify(class_id, entity_type);
        Ok(())
    }

    fn subscribe(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        on_change: ChangeCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push(Listener {
            id,
            key: (class_id.clone(), entity_type.clone()),
            callback: on_change.clone(),
            active: true,
        });

        let listeners = Arc::clone(&self.listeners);
        let handle = ListenerHandle::new(move || {
            if let Some(listener) = lock(&listeners).iter_mut().find(|l| l.id == id) {
                listener.active = false;
            }
        });

        // Initial delivery, like a live query's first snapshot.
        match self.check() {
            Ok(()) => on_change(RemoteEvent::Snapshot(self.documents(class_id, entity_type))),
            Err(err) => on_change(RemoteEvent::Error(err)),
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> (ClassId, EntityType) {
        (ClassId::from("class-a"), EntityType::from("subjects"))
    }

    fn fields(name: &str) -> Map<String, Value> {
        crate::types::to_fields(&json!({ "name": name })).unwrap()
    }

    #[tokio::test]
    async fn test_crud_and_counters() {
        let remote = MemoryRemote::new();
        let (class, ty) = key();

        let record = EntityRecord::new_local(fields("Math"), None, Utc::now());
        let id = remote.create_doc(&class, &ty, &record).await.unwrap();
        assert_eq!(id, "doc-0001");

        let docs = remote.get(&class, &ty).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].remote_id.as_deref(), Some("doc-0001"));

        remote.delete_doc(&class, &ty, &id).await.unwrap();
        assert!(matches!(
            remote.delete_doc(&class, &ty, &id).await,
            Err(RemoteError::NotFound(_))
        ));
        assert_eq!(remote.get_calls(), 1);
        assert_eq!(remote.create_calls(), 1);
        assert_eq!(remote.delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MemoryRemote::new();
        let (class, ty) = key();
        remote.fail_with(RemoteError::Timeout);
        assert_eq!(remote.get(&class, &ty).await, Err(RemoteError::Timeout));
        remote.recover();
        assert!(remote.get(&class, &ty).await.unwrap().is_empty());
    }

    #[test]
    fn test_released_listeners_are_retained() {
        let remote = MemoryRemote::new();
        let (class, ty) = key();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = remote
            .subscribe(
                &class,
                &ty,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        // initial snapshot
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(remote.active_listeners(&class, &ty), 1);

        handle.unsubscribe();
        assert_eq!(remote.active_listeners(&class, &ty), 0);

        remote.insert_doc(&class, &ty, fields("Math"), Utc::now());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        remote.emit_to_all(&class, &ty, RemoteEvent::Snapshot(Vec::new()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
