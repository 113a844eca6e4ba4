//! Single-writer actor for persisted collections.
//!
//! Every read-modify-write of a collection document goes through one task, so
//! mutation writes and subscription mirror writes for the same key land in
//! the order they were issued.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::LocalStoreError;
use crate::local_store::{LocalStore, PersistedCollection};
use crate::merge;
use crate::records::collection_key;
use crate::types::{ClassId, EntityRecord, EntityType};

/// Transformation applied to the stored items of one collection.
pub type Transform = Box<dyn FnOnce(Vec<EntityRecord>) -> Vec<EntityRecord> + Send>;

type Reply<T> = oneshot::Sender<Result<T, LocalStoreError>>;

/// Operations accepted by the [`PersistCoordinator`].
pub enum PersistOp {
    /// Read the stored items of a collection.
    Load {
        class_id: ClassId,
        entity_type: EntityType,
        response: Reply<Vec<EntityRecord>>,
    },
    /// Read, transform and write back a collection.
    Modify {
        class_id: ClassId,
        entity_type: EntityType,
        transform: Transform,
        response: Option<Reply<Vec<EntityRecord>>>,
    },
    /// Reply once every previously queued op has been applied.
    Flush { response: oneshot::Sender<()> },
    /// Stop the writer.
    Shutdown,
}

/// The actor owning all collection writes for one [`LocalStore`].
pub struct PersistCoordinator {
    store: Arc<dyn LocalStore>,
    namespace: String,
    op_rx: mpsc::UnboundedReceiver<PersistOp>,
}

impl PersistCoordinator {
    /// Create a coordinator and the handle that feeds it.
    ///
    /// The channel is unbounded: subscription callbacks enqueue mirror
    /// writes from synchronous code and must never block or drop.
    pub fn new(store: Arc<dyn LocalStore>, namespace: impl Into<String>) -> (Self, PersistHandle) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            store,
            namespace: namespace.into(),
            op_rx,
        };
        (coordinator, PersistHandle { op_tx })
    }

    pub async fn run(mut self) {
        debug!(namespace = %self.namespace, "persist coordinator started");

        while let Some(op) = self.op_rx.recv().await {
            match op {
                PersistOp::Load {
                    class_id,
                    entity_type,
                    response,
                } => {
                    let result = self.load(&class_id, &entity_type).await;
                    let _ = response.send(result);
                }
                PersistOp::Modify {
                    class_id,
                    entity_type,
                    transform,
                    response,
                } => {
                    let result = self.modify(&class_id, &entity_type, transform).await;
                    match response {
                        Some(response) => {
                            let _ = response.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                warn!(
                                    class_id = %class_id,
                                    entity_type = %entity_type,
                                    error = %e,
                                    "failed to mirror collection to local store"
                                );
                            }
                        }
                    }
                }
                PersistOp::Flush { response } => {
                    trace!("processing flush op");
                    let _ = response.send(());
                }
                PersistOp::Shutdown => {
                    debug!("persist coordinator received shutdown");
                    break;
                }
            }
        }

        debug!("persist coordinator stopped");
    }

    /// Spawn the coordinator on the current tokio runtime.
    pub fn spawn(store: Arc<dyn LocalStore>, namespace: impl Into<String>) -> PersistHandle {
        let (coordinator, handle) = Self::new(store, namespace);
        tokio::spawn(async move {
            coordinator.run().await;
        });
        handle
    }

    async fn load(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
    ) -> Result<Vec<EntityRecord>, LocalStoreError> {
        let key = collection_key(&self.namespace, class_id, entity_type);
        let value = match self.store.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Vec::new()),
            // A corrupt document must not lock the collection; the next
            // write replaces it.
            Err(LocalStoreError::Json(e)) => {
                warn!(key = %key, error = %e, "corrupt persisted collection, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        match serde_json::from_value::<PersistedCollection>(value) {
            Ok(doc) => {
                let mut items = doc.items;
                merge::sort_records(&mut items);
                Ok(items)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable persisted collection, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn modify(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        transform: Transform,
    ) -> Result<Vec<EntityRecord>, LocalStoreError> {
        let current = self.load(class_id, entity_type).await?;
        let mut items = transform(current);
        merge::sort_records(&mut items);

        let key = collection_key(&self.namespace, class_id, entity_type);
        let doc = PersistedCollection::new(class_id.clone(), entity_type.clone(), items);
        self.store.set(&key, serde_json::to_value(&doc)?).await?;
        trace!(key = %key, items = doc.items.len(), "persisted collection");
        Ok(doc.items)
    }
}

/// Cheaply cloneable handle to the [`PersistCoordinator`].
#[derive(Clone)]
pub struct PersistHandle {
    op_tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistHandle {
    /// Stored items of a collection, sorted. Missing or undecodable
    /// documents read as empty.
    pub async fn load(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
    ) -> Result<Vec<EntityRecord>, LocalStoreError> {
        let (response, rx) = oneshot::channel();
        self.send(PersistOp::Load {
            class_id: class_id.clone(),
            entity_type: entity_type.clone(),
            response,
        })?;
        rx.await.map_err(|_| LocalStoreError::WriterStopped)?
    }

    /// Read-modify-write a collection and wait for the result.
    pub async fn modify<F>(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        transform: F,
    ) -> Result<Vec<EntityRecord>, LocalStoreError>
    where
        F: FnOnce(Vec<EntityRecord>) -> Vec<EntityRecord> + Send + 'static,
    {
        let (response, rx) = oneshot::channel();
        self.send(PersistOp::Modify {
            class_id: class_id.clone(),
            entity_type: entity_type.clone(),
            transform: Box::new(transform),
            response: Some(response),
        })?;
        rx.await.map_err(|_| LocalStoreError::WriterStopped)?
    }

    /// Queue an authoritative remote set for persistence, keeping any
    /// local-only records already stored. Does not wait.
    pub fn mirror(&self, class_id: &ClassId, entity_type: &EntityType, remote: Vec<EntityRecord>) {
        let result = self.send(PersistOp::Modify {
            class_id: class_id.clone(),
            entity_type: entity_type.clone(),
            transform: Box::new(move |stored| {
                merge::merge_with_local_only(remote, merge::local_only(&stored))
            }),
            response: None,
        });
        if result.is_err() {
            warn!(class_id = %class_id, entity_type = %entity_type, "persist coordinator stopped, mirror write dropped");
        }
    }

    /// Wait until every previously queued write has been applied.
    pub async fn flush(&self) -> Result<(), LocalStoreError> {
        let (response, rx) = oneshot::channel();
        self.send(PersistOp::Flush { response })?;
        rx.await.map_err(|_| LocalStoreError::WriterStopped)
    }

    /// Stop the coordinator after the already queued ops.
    pub fn shutdown(&self) {
        if self.op_tx.send(PersistOp::Shutdown).is_err() {
            debug!("persist coordinator already stopped");
        }
    }

    fn send(&self, op: PersistOp) -> Result<(), LocalStoreError> {
        self.op_tx.send(op).map_err(|_| LocalStoreError::WriterStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryStore;
    use chrono::Utc;
    use serde_json::{Map, json};

    fn local_record() -> EntityRecord {
        EntityRecord::new_local(Map::new(), None, Utc::now())
    }

    fn remote_record(id: &str) -> EntityRecord {
        let mut record = local_record();
        record.promote(id.to_string());
        record
    }

    #[tokio::test]
    async fn test_modify_then_load() {
        let store = Arc::new(MemoryStore::new());
        let handle = PersistCoordinator::spawn(store.clone(), "ns");
        let class = ClassId::from("c1");
        let ty = EntityType::from("subjects");

        let record = local_record();
        let id = record.id.clone();
        handle
            .modify(&class, &ty, move |mut items| {
                items.push(record);
                items
            })
            .await
            .unwrap();

        let items = handle.load(&class, &ty).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);

        let raw = store.get("ns:c1:subjects").await.unwrap().unwrap();
        assert_eq!(raw["version"], json!(1));
        assert_eq!(raw["classId"], json!("c1"));
        assert_eq!(raw["entityType"], json!("subjects"));
    }

    #[tokio::test]
    async fn test_mirror_keeps_stored_local_only() {
        let store = Arc::new(MemoryStore::new());
        let handle = PersistCoordinator::spawn(store, "ns");
        let class = ClassId::from("c1");
        let ty = EntityType::from("subjects");

        let offline = local_record();
        let offline_id = offline.id.clone();
        handle
            .modify(&class, &ty, move |_| vec![offline, remote_record("doc-old")])
            .await
            .unwrap();

        handle.mirror(&class, &ty, vec![remote_record("doc-1")]);
        handle.flush().await.unwrap();

        let mut ids: Vec<String> = handle
            .load(&class, &ty)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        let mut expected = vec!["doc-1".to_string(), offline_id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_undecodable_document_reads_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set("ns:c1:subjects", json!({"garbage": true})).await.unwrap();
        let handle = PersistCoordinator::spawn(store, "ns");

        let items = handle
            .load(&ClassId::from("c1"), &EntityType::from("subjects"))
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let handle = PersistCoordinator::spawn(store, "ns");

        let result = handle
            .modify(&ClassId::from("c1"), &EntityType::from("subjects"), |items| items)
            .await;
        assert!(matches!(result, Err(LocalStoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_writer() {
        let handle = PersistCoordinator::spawn(Arc::new(MemoryStore::new()), "ns");
        handle.shutdown();
        let result = handle.flush().await;
        assert!(matches!(result, Err(LocalStoreError::WriterStopped)));
    }
}
