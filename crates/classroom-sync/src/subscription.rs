//! Live remote subscriptions for the active class.
//!
//! Each (class, entity type) has at most one listener. Every event carries the
//! generation captured when the listener was opened; events from an older
//! generation are dropped even if they race with teardown.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::cache::EntityCacheManager;
use crate::coordinator::{ClassReset, ClassSwitchCoordinator, ResetObserver};
use crate::error::{SyncError, SyncResult};
use crate::merge;
use crate::persist::PersistHandle;
use crate::remote::{ChangeCallback, ListenerHandle, RemoteEvent, RemoteStore};
use crate::types::{ClassId, EntityRecord, EntityType, Generation, SyncState};

type SlotKey = (ClassId, EntityType);

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Never opened for this key.
    Idle,
    /// Opened, waiting for the first snapshot.
    Subscribing,
    /// Receiving snapshots.
    Active,
    /// The transport failed; the last-known-good collection is kept as stale.
    Error,
    /// Released by a class switch or by the consumer.
    TornDown,
}

struct Slot {
    generation: Generation,
    state: SubscriptionState,
    handle: Option<ListenerHandle>,
    /// Local-only records read from the store when the listener opened,
    /// used when the collection is not cached yet.
    seed: Vec<EntityRecord>,
}

/// Opens and tears down live listeners and applies their events.
pub struct SubscriptionManager {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<EntityCacheManager>,
    coordinator: Arc<ClassSwitchCoordinator>,
    persist: PersistHandle,
    slots: DashMap<SlotKey, Slot>,
}

impl SubscriptionManager {
    /// Create the manager and register it for class resets.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<EntityCacheManager>,
        coordinator: Arc<ClassSwitchCoordinator>,
        persist: PersistHandle,
    ) -> Self {
        let inner = Arc::new(SubscriptionInner {
            remote,
            cache,
            coordinator: coordinator.clone(),
            persist,
            slots: DashMap::new(),
        });
        let observer: Weak<dyn ResetObserver> = Arc::downgrade(&inner) as Weak<dyn ResetObserver>;
        coordinator.register(observer);
        Self { inner }
    }

    /// Open a listener on `entity_type` for the active class.
    ///
    /// Idempotent while a listener of the current generation is open.
    pub async fn listen(&self, entity_type: &EntityType) -> SyncResult<SubscriptionState> {
        let identity = self
            .inner
            .coordinator
            .capture()
            .ok_or(SyncError::NoActiveClass)?;
        let key = (identity.id.clone(), entity_type.clone());

        if let Some(slot) = self.inner.slots.get(&key)
            && slot.generation == identity.generation
            && matches!(
                slot.state,
                SubscriptionState::Subscribing | SubscriptionState::Active
            )
        {
            return Ok(slot.state);
        }

        let seed = merge::local_only(&self.inner.persist.load(&identity.id, entity_type).await?);

        // The class may have switched while reading the store.
        if !self.inner.coordinator.is_current(identity.generation) {
            return Ok(SubscriptionState::TornDown);
        }

        if let Some((_, old)) = self.inner.slots.remove(&key) {
            release(old);
        }
        self.inner.slots.insert(
            key.clone(),
            Slot {
                generation: identity.generation,
                state: SubscriptionState::Subscribing,
                handle: None,
                seed,
            },
        );
        // A switch between the check above and the insert has already run
        // its teardown; the slot just inserted would outlive it.
        if !self.inner.coordinator.is_current(identity.generation) {
            self.inner
                .slots
                .remove_if(&key, |_, slot| slot.generation == identity.generation);
            return Ok(SubscriptionState::TornDown);
        }

        let weak = Arc::downgrade(&self.inner);
        let (class_id, ty, generation) =
            (identity.id.clone(), entity_type.clone(), identity.generation);
        let callback: ChangeCallback = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(&class_id, &ty, generation, event);
            }
        });

        // No slot guard may be held here: the first snapshot can arrive
        // synchronously.
        match self.inner.remote.subscribe(&identity.id, entity_type, callback) {
            Ok(handle) => {
                let mut handle = Some(handle);
                if let Some(mut slot) = self.inner.slots.get_mut(&key)
                    && slot.generation == identity.generation
                    && slot.state != SubscriptionState::TornDown
                {
                    slot.handle = handle.take();
                }
                if let Some(orphan) = handle {
                    // Torn down while subscribing.
                    orphan.unsubscribe();
                    return Ok(SubscriptionState::TornDown);
                }
                info!(class_id = %identity.id, entity_type = %entity_type, generation = %identity.generation, "subscribed");
                Ok(self.status(&identity.id, entity_type))
            }
            Err(e) => {
                warn!(class_id = %identity.id, entity_type = %entity_type, error = %e, "subscribe failed");
                if let Some(mut slot) = self.inner.slots.get_mut(&key) {
                    slot.state = SubscriptionState::Error;
                }
                Err(e.into())
            }
        }
    }

    /// Release the active class's listener on `entity_type`.
    pub fn unlisten(&self, entity_type: &EntityType) {
        if let Some(class_id) = self.inner.coordinator.current_class_id() {
            self.inner
                .tear_down_key(&(class_id, entity_type.clone()));
        }
    }

    /// Release every listener.
    pub fn unlisten_all(&self) {
        self.inner.tear_down_all();
    }

    pub fn status(&self, class_id: &ClassId, entity_type: &EntityType) -> SubscriptionState {
        self.inner
            .slots
            .get(&(class_id.clone(), entity_type.clone()))
            .map(|slot| slot.state)
            .unwrap_or(SubscriptionState::Idle)
    }

    /// Number of listeners currently held open.
    pub fn open_listeners(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.handle.is_some())
            .count()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.inner.tear_down_all();
    }
}

fn release(mut slot: Slot) {
    if let Some(handle) = slot.handle.take() {
        handle.unsubscribe();
    }
}

impl SubscriptionInner {
    fn handle_event(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        generation: Generation,
        event: RemoteEvent,
    ) {
        if !self.coordinator.is_current(generation) {
            trace!(class_id = %class_id, entity_type = %entity_type, generation = %generation, "dropping event from stale generation");
            return;
        }
        let key = (class_id.clone(), entity_type.clone());

        match event {
            RemoteEvent::Snapshot(docs) => {
                let remote: Vec<EntityRecord> =
                    docs.into_iter().map(EntityRecord::into_remote).collect();
                let seed = self
                    .slots
                    .get(&key)
                    .filter(|slot| slot.generation == generation)
                    .map(|slot| slot.seed.clone())
                    .unwrap_or_default();

                let applied = self.coordinator.commit_if_current(generation, || {
                    let local_only = self
                        .cache
                        .get(class_id, entity_type)
                        .map(|c| c.local_only_items())
                        .unwrap_or(seed);
                    let merged = merge::merge_with_local_only(remote.clone(), local_only);
                    let len = merged.len();
                    let state = merge::loaded_state(&merged);
                    self.cache.set(class_id, entity_type, merged, state);
                    len
                });

                match applied {
                    Some(len) => {
                        self.set_state(&key, generation, SubscriptionState::Active);
                        self.persist.mirror(class_id, entity_type, remote);
                        debug!(class_id = %class_id, entity_type = %entity_type, len, "applied snapshot");
                    }
                    None => {
                        trace!(class_id = %class_id, entity_type = %entity_type, "snapshot raced a class switch, dropped");
                    }
                }
            }
            RemoteEvent::Error(err) => {
                warn!(class_id = %class_id, entity_type = %entity_type, error = %err, "subscription error, keeping last-known-good data");
                let applied = self.coordinator.commit_if_current(generation, || {
                    self.cache
                        .set_sync_state(class_id, entity_type, SyncState::Stale);
                });
                if applied.is_some() {
                    self.set_state(&key, generation, SubscriptionState::Error);
                }
            }
        }
    }

    fn set_state(&self, key: &SlotKey, generation: Generation, state: SubscriptionState) {
        if let Some(mut slot) = self.slots.get_mut(key)
            && slot.generation == generation
            && slot.state != SubscriptionState::TornDown
        {
            slot.state = state;
        }
    }

    fn tear_down_key(&self, key: &SlotKey) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.state = SubscriptionState::TornDown;
            if let Some(handle) = slot.handle.take() {
                handle.unsubscribe();
            }
            debug!(class_id = %key.0, entity_type = %key.1, "subscription torn down");
        }
    }

    fn tear_down_all(&self) {
        // Slots torn down by an earlier reset are forgotten.
        self.slots
            .retain(|_, slot| slot.state != SubscriptionState::TornDown);
        let mut released = 0;
        for mut slot in self.slots.iter_mut() {
            slot.state = SubscriptionState::TornDown;
            if let Some(handle) = slot.handle.take() {
                handle.unsubscribe();
                released += 1;
            }
            slot.seed.clear();
        }
        if released > 0 {
            debug!(released, "released listeners");
        }
    }
}

impl ResetObserver for SubscriptionInner {
    fn on_class_reset(&self, reset: &ClassReset) {
        trace!(generation = %reset.generation, "tearing down subscriptions for class switch");
        self.tear_down_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::MemoryStore;
    use crate::memory::MemoryRemote;
    use crate::persist::PersistCoordinator;
    use pretty_assertions::assert_eq;

    struct Harness {
        remote: Arc<MemoryRemote>,
        coordinator: Arc<ClassSwitchCoordinator>,
        manager: Arc<SubscriptionManager>,
    }

    fn harness() -> Harness {
        let remote = Arc::new(MemoryRemote::new());
        let cache = EntityCacheManager::new(64);
        let coordinator = Arc::new(ClassSwitchCoordinator::new(64));
        let persist = PersistCoordinator::spawn(Arc::new(MemoryStore::new()), "ns");
        let manager = Arc::new(SubscriptionManager::new(
            remote.clone(),
            cache,
            coordinator.clone(),
            persist,
        ));
        Harness {
            remote,
            coordinator,
            manager,
        }
    }

    fn subjects() -> EntityType {
        EntityType::from("subjects")
    }

    #[tokio::test]
    async fn test_switch_tears_down_listener() {
        let h = harness();
        let a = h.coordinator.set_active_class("a").id;
        assert_eq!(
            h.manager.listen(&subjects()).await.unwrap(),
            SubscriptionState::Active
        );
        assert_eq!(h.manager.open_listeners(), 1);

        h.coordinator.set_active_class("b");
        assert_eq!(h.manager.status(&a, &subjects()), SubscriptionState::TornDown);
        assert_eq!(h.manager.open_listeners(), 0);
        assert_eq!(h.remote.active_listeners(&a, &subjects()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_listen_racing_switches_leaves_no_stale_listener() {
        let h = harness();
        let classes = ["a", "b", "c"];
        h.coordinator.set_active_class("a");

        let mut tasks = Vec::new();
        for n in 0..200 {
            let manager = h.manager.clone();
            tasks.push(tokio::spawn(async move {
                let _ = manager.listen(&subjects()).await;
            }));
            if n % 3 == 0 {
                let coordinator = h.coordinator.clone();
                tasks.push(tokio::spawn(async move {
                    coordinator.set_active_class(classes[(n / 3) % classes.len()]);
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        let active = h.coordinator.current_class_id().unwrap();
        for class in classes {
            let class = ClassId::from(class);
            let open = h.remote.active_listeners(&class, &subjects());
            if class == active {
                assert!(open <= 1, "{open} listeners open on the active class");
            } else {
                assert_eq!(open, 0, "listener leaked on {class}");
            }
        }
        assert!(h.manager.open_listeners() <= 1);
    }
}
