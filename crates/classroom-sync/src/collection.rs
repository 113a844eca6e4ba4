//! Typed, stable accessor for one entity collection of the active class.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::LoadOutcome;
use crate::error::{SyncError, SyncResult};
use crate::refresh::RefreshCursor;
use crate::subscription::SubscriptionState;
use crate::sync::SyncCore;
use crate::types::{
    ClassIdentity, Entity, EntityKind, EntityRecord, EntityType, MutationOutcome, SyncState,
    to_fields,
};

/// Point-in-time view of a collection, as a list screen renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionView<T> {
    pub items: Vec<Entity<T>>,
    pub loading: bool,
    pub synced_with_cloud: bool,
    pub sync_state: Option<SyncState>,
}

/// Accessor for the `T` collection of whichever class is active.
///
/// Reads never return data of a previously active class.
pub struct Collection<T> {
    core: Arc<SyncCore>,
    entity_type: EntityType,
    cursor: Arc<RefreshCursor>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            cursor: Arc::clone(&self.cursor),
            _kind: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("entity_type", &self.entity_type)
            .finish()
    }
}

impl<T: EntityKind> Collection<T> {
    pub(crate) fn new(core: Arc<SyncCore>) -> Self {
        Self {
            core,
            entity_type: T::entity_type(),
            cursor: Arc::new(RefreshCursor::new()),
            _kind: PhantomData,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    fn active(&self) -> Option<ClassIdentity> {
        self.core.coordinator.capture()
    }

    /// Raw records of the active class, in display order.
    pub fn records(&self) -> Vec<EntityRecord> {
        self.active()
            .and_then(|identity| self.core.cache.get(&identity.id, &self.entity_type))
            .map(|collection| collection.items)
            .unwrap_or_default()
    }

    /// Decoded items of the active class. Records that do not decode as `T`
    /// are skipped.
    pub fn items(&self) -> Vec<Entity<T>> {
        self.records()
            .iter()
            .filter_map(|record| match Entity::<T>::from_record(record) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(entity_type = %self.entity_type, id = %record.id, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect()
    }

    /// Whether the active class's collection has not been loaded yet.
    pub fn loading(&self) -> bool {
        self.active()
            .is_some_and(|identity| !self.core.cache.contains(&identity.id, &self.entity_type))
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        let identity = self.active()?;
        self.core
            .cache
            .get(&identity.id, &self.entity_type)
            .map(|collection| collection.sync_state)
    }

    pub fn synced_with_cloud(&self) -> bool {
        self.sync_state().is_some_and(SyncState::is_synced)
    }

    pub fn view(&self) -> CollectionView<T> {
        CollectionView {
            items: self.items(),
            loading: self.loading(),
            synced_with_cloud: self.synced_with_cloud(),
            sync_state: self.sync_state(),
        }
    }

    /// Load the active class's collection if it is not cached.
    pub async fn ensure_loaded(&self) -> SyncResult<LoadOutcome> {
        self.core.engine.ensure_loaded(&self.entity_type).await
    }

    /// Load before a write so the optimistic cache update is visible.
    /// Load failures other than a missing class are left to the write.
    async fn prime(&self) -> SyncResult<()> {
        match self.ensure_loaded().await {
            Ok(_) => Ok(()),
            Err(SyncError::NoActiveClass) => Err(SyncError::NoActiveClass),
            Err(e) => {
                warn!(entity_type = %self.entity_type, error = %e, "load before write failed");
                Ok(())
            }
        }
    }

    pub async fn add(&self, payload: &T) -> SyncResult<MutationOutcome> {
        let fields = to_fields(payload)?;
        self.prime().await?;
        self.core.engine.create(&self.entity_type, fields).await
    }

    /// Replace the fields present in `payload`.
    pub async fn update(&self, id: &str, payload: &T) -> SyncResult<MutationOutcome> {
        let fields = to_fields(payload)?;
        self.prime().await?;
        self.core.engine.update(&self.entity_type, id, fields).await
    }

    /// Shallow-merge arbitrary fields into a record.
    pub async fn patch(&self, id: &str, fields: Map<String, Value>) -> SyncResult<MutationOutcome> {
        self.prime().await?;
        self.core.engine.update(&self.entity_type, id, fields).await
    }

    pub async fn remove(&self, id: &str) -> SyncResult<MutationOutcome> {
        self.prime().await?;
        self.core.engine.remove(&self.entity_type, id).await
    }

    /// Invalidate and reload the active class's collection.
    pub async fn refresh(&self) -> SyncResult<LoadOutcome> {
        let identity = self.active().ok_or(SyncError::NoActiveClass)?;
        self.core.cache.invalidate(&identity.id, &self.entity_type);
        self.core.engine.reload(&self.entity_type).await
    }

    /// Open the live listener for the active class.
    pub async fn listen(&self) -> SyncResult<SubscriptionState> {
        self.core.subscriptions.listen(&self.entity_type).await
    }

    pub fn unlisten(&self) {
        self.core.subscriptions.unlisten(&self.entity_type);
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        match self.active() {
            Some(identity) => self
                .core
                .subscriptions
                .status(&identity.id, &self.entity_type),
            None => SubscriptionState::Idle,
        }
    }

    /// Reload once for every refresh-timestamp transition not yet handled.
    ///
    /// Returns the number of reloads performed. A caller that finds a reload
    /// already running returns `0`; the running caller folds the newer
    /// timestamp into one follow-up reload.
    pub async fn apply_refresh_signals(&self) -> SyncResult<usize> {
        let mut reloads = 0;
        loop {
            let Some(identity) = self.active() else {
                return Ok(reloads);
            };
            let latest = self.core.refresh.latest(&identity.id);
            let Some(target) = self.cursor.claim(&identity.id, latest) else {
                return Ok(reloads);
            };

            debug!(class_id = %identity.id, entity_type = %self.entity_type, timestamp = target, "refresh signal, reloading");
            self.core.cache.invalidate(&identity.id, &self.entity_type);
            match self.core.engine.reload(&self.entity_type).await {
                Ok(_) => self.cursor.complete(&identity.id, target),
                Err(e) => {
                    self.cursor.abandon(&identity.id, target);
                    return Err(e);
                }
            }
            reloads += 1;
        }
    }

    /// Spawn a task that applies refresh signals for whichever class is
    /// active until `shutdown` turns `true`.
    pub fn watch_refresh(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let collection = self.clone();
        tokio::spawn(async move {
            'outer: loop {
                let mut resets = collection.core.coordinator.subscribe();
                let Some(identity) = collection.active() else {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break 'outer;
                            }
                        }
                        _ = resets.recv() => {}
                    }
                    continue;
                };

                let mut stamps = collection.core.refresh.subscribe(&identity.id);
                // Records the class's current timestamp as the baseline.
                if let Err(e) = collection.apply_refresh_signals().await {
                    warn!(error = %e, "refresh failed");
                }

                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break 'outer;
                            }
                        }
                        _ = resets.recv() => continue 'outer,
                        changed = stamps.changed() => {
                            if changed.is_err() {
                                break 'outer;
                            }
                            if let Err(e) = collection.apply_refresh_signals().await {
                                warn!(class_id = %identity.id, error = %e, "refresh failed");
                            }
                        }
                    }
                }
            }
            debug!(entity_type = %collection.entity_type, "refresh watcher stopped");
        })
    }
}
