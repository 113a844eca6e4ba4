//! Remote-first mutations with local fallback, and full reloads with merge.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::cache::EntityCacheManager;
use crate::config::SyncConfig;
use crate::coordinator::ClassSwitchCoordinator;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::identity::IdentityProvider;
use crate::merge;
use crate::persist::PersistHandle;
use crate::remote::RemoteStore;
use crate::types::{
    ClassId, ClassIdentity, EntityRecord, EntityType, Generation, MutationKind, MutationOutcome,
    PendingMutation, SyncState,
};

type LoadKey = (ClassId, EntityType);

/// What a load did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The collection was already cached; nothing was fetched.
    Cached,
    /// The collection was (re)loaded and committed to the cache.
    Loaded { len: usize, sync_state: SyncState },
    /// The active class changed while loading; the result was dropped.
    Discarded {
        started: Generation,
        current: Generation,
    },
}

/// Remote-first CRUD and reload for every entity type.
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    persist: PersistHandle,
    cache: Arc<EntityCacheManager>,
    coordinator: Arc<ClassSwitchCoordinator>,
    identity: Arc<dyn IdentityProvider>,
    promote_local_on_reload: bool,
    max_pending: usize,
    load_locks: DashMap<LoadKey, Arc<Mutex<()>>>,
    /// Promoted records keyed by their local id, kept until the local store
    /// has been rewritten without the local copy.
    promotions: DashMap<String, EntityRecord>,
    pending: Mutex<VecDeque<PendingMutation>>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        persist: PersistHandle,
        cache: Arc<EntityCacheManager>,
        coordinator: Arc<ClassSwitchCoordinator>,
        identity: Arc<dyn IdentityProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            remote,
            persist,
            cache,
            coordinator,
            identity,
            promote_local_on_reload: config.promote_local_on_reload,
            max_pending: config.max_pending_mutations.max(1),
            load_locks: DashMap::new(),
            promotions: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn active(&self) -> SyncResult<ClassIdentity> {
        self.coordinator.capture().ok_or(SyncError::NoActiveClass)
    }

    fn load_lock(&self, class_id: &ClassId, entity_type: &EntityType) -> Arc<Mutex<()>> {
        self.load_locks
            .entry((class_id.clone(), entity_type.clone()))
            .or_default()
            .clone()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load the collection for the active class unless it is already cached.
    ///
    /// Concurrent callers for the same key share one load.
    pub async fn ensure_loaded(&self, entity_type: &EntityType) -> SyncResult<LoadOutcome> {
        let identity = self.active()?;
        if self.cache.contains(&identity.id, entity_type) {
            return Ok(LoadOutcome::Cached);
        }

        let lock = self.load_lock(&identity.id, entity_type);
        let _guard = lock.lock().await;
        if self.cache.contains(&identity.id, entity_type) {
            trace!(class_id = %identity.id, entity_type = %entity_type, "loaded by a concurrent caller");
            return Ok(LoadOutcome::Cached);
        }
        self.load_locked(&identity, entity_type).await
    }

    /// Full reload of the active class's collection, merging local-only
    /// records with the remote set.
    pub async fn reload(&self, entity_type: &EntityType) -> SyncResult<LoadOutcome> {
        let identity = self.active()?;
        let lock = self.load_lock(&identity.id, entity_type);
        let _guard = lock.lock().await;
        self.load_locked(&identity, entity_type).await
    }

    async fn load_locked(
        &self,
        identity: &ClassIdentity,
        entity_type: &EntityType,
    ) -> SyncResult<LoadOutcome> {
        let class_id = &identity.id;
        debug!(class_id = %class_id, entity_type = %entity_type, generation = %identity.generation, "loading collection");

        let stored = self.persist.load(class_id, entity_type).await?;

        let (items, sync_state) = match self.remote.get(class_id, entity_type).await {
            Ok(docs) => {
                let remote: Vec<EntityRecord> =
                    docs.into_iter().map(EntityRecord::into_remote).collect();
                let items = self
                    .merge_remote(class_id, entity_type, remote, merge::local_only(&stored))
                    .await?;
                let state = merge::loaded_state(&items);
                (items, state)
            }
            Err(e) if e.is_recoverable() => {
                warn!(
                    class_id = %class_id,
                    entity_type = %entity_type,
                    error = %e,
                    "remote unavailable, serving local copy"
                );
                (stored, SyncState::Stale)
            }
            Err(e) => return Err(e.into()),
        };

        let len = items.len();
        let committed = self.coordinator.commit_if_current(identity.generation, || {
            self.cache.set(class_id, entity_type, items, sync_state);
        });
        if committed.is_none() {
            let (started, current) = (identity.generation, self.coordinator.generation());
            let discard = SyncError::StaleGenerationDiscard { started, current };
            trace!(class_id = %class_id, entity_type = %entity_type, error = %discard, "load result dropped");
            return Ok(LoadOutcome::Discarded { started, current });
        }

        debug!(class_id = %class_id, entity_type = %entity_type, len, ?sync_state, "collection loaded");
        Ok(LoadOutcome::Loaded { len, sync_state })
    }

    /// Union the remote set with surviving local-only records, promoting
    /// them when enabled, and persist the result.
    async fn merge_remote(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        mut remote: Vec<EntityRecord>,
        local_only: Vec<EntityRecord>,
    ) -> SyncResult<Vec<EntityRecord>> {
        let survivors = merge::merge_with_local_only(Vec::new(), local_only)
            .into_iter()
            .filter(|r| !remote.iter().any(|doc| doc.matches_id(&r.id)))
            .collect::<Vec<_>>();

        let mut promoted_ids = Vec::new();
        if self.promote_local_on_reload {
            for record in &survivors {
                // Created remotely by an earlier reload whose store rewrite failed.
                let earlier = self.promotions.get(&record.id).map(|p| p.value().clone());
                if let Some(promoted) = earlier {
                    debug!(local_id = %record.id, remote_id = %promoted.id, "reusing earlier promotion");
                    promoted_ids.push(record.id.clone());
                    if !remote.iter().any(|doc| doc.matches_id(&promoted.id)) {
                        remote.push(promoted);
                    }
                    continue;
                }

                match self.remote.create_doc(class_id, entity_type, record).await {
                    Ok(remote_id) => {
                        let mut promoted = record.clone();
                        promoted.promote(remote_id.clone());
                        self.promotions.insert(record.id.clone(), promoted.clone());
                        self.persist_promotion(class_id, entity_type, &record.id, &promoted)
                            .await;
                        info!(
                            class_id = %class_id,
                            entity_type = %entity_type,
                            local_id = %record.id,
                            remote_id = %remote_id,
                            "promoted local record"
                        );
                        promoted_ids.push(record.id.clone());
                        // The create may already be visible in a fresh listing.
                        if !remote.iter().any(|doc| doc.matches_id(&remote_id)) {
                            remote.push(promoted);
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        debug!(error = %e, "remote refused promotion, keeping records local");
                        break;
                    }
                    Err(e) => {
                        warn!(local_id = %record.id, error = %e, "local record rejected by remote, keeping it local");
                    }
                }
            }
        }

        // Re-read inside the writer: offline creates may have landed since
        // `stored` was read.
        let forget = promoted_ids.clone();
        let merged = self
            .persist
            .modify(class_id, entity_type, move |stored_now| {
                let local = merge::local_only(&stored_now)
                    .into_iter()
                    .filter(|r| !promoted_ids.contains(&r.id));
                merge::merge_with_local_only(remote, local)
            })
            .await?;
        for id in &forget {
            self.promotions.remove(id);
        }
        Ok(merged)
    }

    /// Replace the local copy of a freshly promoted record in the store.
    async fn persist_promotion(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        local_id: &str,
        promoted: &EntityRecord,
    ) {
        let local_id = local_id.to_string();
        let stored = promoted.clone();
        let result = self
            .persist
            .modify(class_id, entity_type, move |mut items| {
                items.retain(|r| r.id != local_id && !r.matches_id(&stored.id));
                items.push(stored);
                items
            })
            .await;
        if let Err(e) = result {
            warn!(class_id = %class_id, entity_type = %entity_type, remote_id = %promoted.id, error = %e, "failed to persist promotion, keeping it in memory");
        }
    }

    /// Server id of a record, including promotions not yet persisted.
    fn remote_id_of(&self, record: &EntityRecord) -> Option<String> {
        record.remote_id.clone().or_else(|| {
            self.promotions
                .get(&record.id)
                .and_then(|p| p.remote_id.clone())
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a record in the active class.
    pub async fn create(
        &self,
        entity_type: &EntityType,
        fields: Map<String, Value>,
    ) -> SyncResult<MutationOutcome> {
        let identity = self.active()?;
        let mut record =
            EntityRecord::new_local(fields, self.identity.current_user_id(), Utc::now());

        match self.remote.create_doc(&identity.id, entity_type, &record).await {
            Ok(remote_id) => {
                record.promote(remote_id);
                self.apply_upsert(&identity, entity_type, record, true).await
            }
            Err(e) if e.is_recoverable() => {
                self.record_pending(&identity.id, entity_type, MutationKind::Create, &record, &e)
                    .await;
                self.apply_upsert(&identity, entity_type, record, false).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shallow-merge `patch` into the record addressed by `id`.
    pub async fn update(
        &self,
        entity_type: &EntityType,
        id: &str,
        patch: Map<String, Value>,
    ) -> SyncResult<MutationOutcome> {
        let identity = self.active()?;
        let existing = self.find_record(&identity, entity_type, id).await?;
        let mut updated = existing.clone();
        updated.apply_patch(patch, self.identity.current_user_id(), Utc::now());

        // Local-only records have nothing remote to update yet.
        let Some(remote_id) = self.remote_id_of(&existing) else {
            return self.apply_upsert(&identity, entity_type, updated, false).await;
        };

        match self
            .remote
            .update_doc(&identity.id, entity_type, &remote_id, &updated)
            .await
        {
            Ok(()) => self.apply_upsert(&identity, entity_type, updated, true).await,
            Err(RemoteError::NotFound(_)) => Err(SyncError::EntityNotFound {
                entity_type: entity_type.clone(),
                id: id.to_string(),
            }),
            Err(e) if e.is_recoverable() => {
                self.record_pending(&identity.id, entity_type, MutationKind::Update, &updated, &e)
                    .await;
                self.apply_upsert(&identity, entity_type, updated, false).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record addressed by `id`.
    pub async fn remove(&self, entity_type: &EntityType, id: &str) -> SyncResult<MutationOutcome> {
        let identity = self.active()?;
        let existing = self.find_record(&identity, entity_type, id).await?;

        let Some(remote_id) = self.remote_id_of(&existing) else {
            // Never reached the remote, so nothing is left to sync.
            return self.apply_removal(&identity, entity_type, &existing, true).await;
        };

        match self
            .remote
            .delete_doc(&identity.id, entity_type, &remote_id)
            .await
        {
            Ok(()) | Err(RemoteError::NotFound(_)) => {
                self.apply_removal(&identity, entity_type, &existing, true).await
            }
            Err(e) if e.is_recoverable() => {
                self.record_pending(&identity.id, entity_type, MutationKind::Delete, &existing, &e)
                    .await;
                self.apply_removal(&identity, entity_type, &existing, false).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look a record up in the cache, then in the local store.
    async fn find_record(
        &self,
        identity: &ClassIdentity,
        entity_type: &EntityType,
        id: &str,
    ) -> SyncResult<EntityRecord> {
        if let Some(record) = self
            .cache
            .get(&identity.id, entity_type)
            .and_then(|c| c.find(id).cloned())
        {
            return Ok(record);
        }

        self.persist
            .load(&identity.id, entity_type)
            .await?
            .into_iter()
            .find(|r| r.matches_id(id))
            .ok_or_else(|| SyncError::EntityNotFound {
                entity_type: entity_type.clone(),
                id: id.to_string(),
            })
    }

    async fn apply_upsert(
        &self,
        identity: &ClassIdentity,
        entity_type: &EntityType,
        record: EntityRecord,
        synced: bool,
    ) -> SyncResult<MutationOutcome> {
        let id = record.id.clone();

        let stored = record.clone();
        let persisted = self
            .persist
            .modify(&identity.id, entity_type, move |mut items| {
                items.retain(|r| !r.matches_id(&stored.id));
                items.push(stored);
                items
            })
            .await;
        self.check_persisted(&identity.id, entity_type, persisted.map(|_| ()), synced)?;

        self.apply_to_cache(identity, entity_type, !synced, |items| {
            merge::upsert_record(items, record);
        });
        Ok(MutationOutcome { id, synced })
    }

    async fn apply_removal(
        &self,
        identity: &ClassIdentity,
        entity_type: &EntityType,
        existing: &EntityRecord,
        synced: bool,
    ) -> SyncResult<MutationOutcome> {
        let id = existing.id.clone();

        let target = id.clone();
        let persisted = self
            .persist
            .modify(&identity.id, entity_type, move |mut items| {
                merge::remove_record(&mut items, &target);
                items
            })
            .await;
        self.check_persisted(&identity.id, entity_type, persisted.map(|_| ()), synced)?;

        self.apply_to_cache(identity, entity_type, !synced, |items| {
            merge::remove_record(items, &id);
        });
        Ok(MutationOutcome { id: existing.id.clone(), synced })
    }

    /// A local write failure is fatal only when the remote did not accept
    /// the change either.
    fn check_persisted(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        persisted: Result<(), crate::error::LocalStoreError>,
        synced: bool,
    ) -> SyncResult<()> {
        match persisted {
            Ok(()) => Ok(()),
            Err(e) if synced => {
                warn!(class_id = %class_id, entity_type = %entity_type, error = %e, "remote accepted change but local persist failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Optimistic cache write, guarded by the captured generation. Skipped
    /// when the collection is not loaded: the next load picks the change up
    /// from the local store.
    fn apply_to_cache(
        &self,
        identity: &ClassIdentity,
        entity_type: &EntityType,
        fallback: bool,
        f: impl FnOnce(&mut Vec<EntityRecord>),
    ) {
        let applied = self.coordinator.commit_if_current(identity.generation, || {
            self.cache.update_with(&identity.id, entity_type, |collection| {
                f(&mut collection.items);
                collection.sync_state = if fallback {
                    SyncState::LocalOnly
                } else {
                    merge::derive_state(&collection.items, collection.sync_state)
                };
            })
        });
        match applied {
            None => trace!(class_id = %identity.id, entity_type = %entity_type, "class switched mid-mutation, cache untouched"),
            Some(false) => trace!(class_id = %identity.id, entity_type = %entity_type, "collection not loaded, cache untouched"),
            Some(true) => {}
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    async fn record_pending(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        operation: MutationKind,
        record: &EntityRecord,
        err: &RemoteError,
    ) {
        warn!(
            class_id = %class_id,
            entity_type = %entity_type,
            ?operation,
            error = %err,
            "remote write failed, falling back to local store"
        );
        let mutation = PendingMutation {
            entity_type: entity_type.clone(),
            operation,
            record_id: record.id.clone(),
            payload: Value::Object(record.fields.clone()),
            target_class_id: class_id.clone(),
            attempted_at: Utc::now(),
            reason: err.to_string(),
        };

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            pending.pop_front();
        }
        pending.push_back(mutation);
    }

    /// Mutations that fell back to the local store, oldest first.
    pub async fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.pending.lock().await.iter().cloned().collect()
    }
}
