//! The remote authoritative store and its live listener contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::types::{ClassId, EntityRecord, EntityType};

/// Callback invoked for every event of a live subscription.
///
/// May be called from any thread, including synchronously from inside
/// [`RemoteStore::subscribe`].
pub type ChangeCallback = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// An event delivered by a live subscription.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// The complete current remote set of the subscribed collection.
    Snapshot(Vec<EntityRecord>),
    /// The subscription failed; no further events are guaranteed.
    Error(RemoteError),
}

/// Releases a live listener. Released on drop as well.
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// The remote authoritative document store, partitioned by class and
/// entity type.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every document of a collection. Returned records carry their
    /// server id in `id`.
    async fn get(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
    ) -> Result<Vec<EntityRecord>, RemoteError>;

    /// Create a document and return its server-assigned id. `record.id` is
    /// ignored.
    async fn create_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        record: &EntityRecord,
    ) -> Result<String, RemoteError>;

    /// Replace the document `id` with `record`.
    async fn update_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        id: &str,
        record: &EntityRecord,
    ) -> Result<(), RemoteError>;

    async fn delete_doc(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        id: &str,
    ) -> Result<(), RemoteError>;

    /// Open a live listener on a collection.
    ///
    /// Implementations must not hold internal locks while invoking
    /// `on_change`: the callback takes the coordinator's commit guard.
    fn subscribe(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        on_change: ChangeCallback,
    ) -> Result<ListenerHandle, RemoteError>;
}
