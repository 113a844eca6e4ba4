//! In-memory cache of class-scoped entity collections.
//!
//! Pure storage: no networking and no generation checks. Writers go through
//! [`ClassSwitchCoordinator::commit_if_current`](crate::ClassSwitchCoordinator::commit_if_current)
//! before touching it.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::coordinator::{ClassReset, ResetObserver};
use crate::merge;
use crate::types::{CachedCollection, ClassId, EntityRecord, EntityType, SyncState};

/// Default capacity of the update broadcast channel.
pub const DEFAULT_UPDATE_CAPACITY: usize = 1024;

type CacheKey = (ClassId, EntityType);

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A collection was written (load, mutation or subscription event).
    Replaced {
        class_id: ClassId,
        entity_type: EntityType,
        len: usize,
        sync_state: SyncState,
    },
    /// A collection was dropped so the next read reloads it.
    Invalidated {
        class_id: ClassId,
        entity_type: EntityType,
    },
    /// Collections were evicted wholesale (class reset or explicit eviction).
    Evicted { count: usize },
}

/// Thread-safe map of `(class, entity type) -> CachedCollection`.
pub struct EntityCacheManager {
    collections: DashMap<CacheKey, CachedCollection>,
    update_tx: broadcast::Sender<CacheUpdate>,
}

impl EntityCacheManager {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            collections: DashMap::new(),
            update_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.update_tx.subscribe()
    }

    pub fn get(&self, class_id: &ClassId, entity_type: &EntityType) -> Option<CachedCollection> {
        self.collections
            .get(&(class_id.clone(), entity_type.clone()))
            .map(|c| c.clone())
    }

    pub fn contains(&self, class_id: &ClassId, entity_type: &EntityType) -> bool {
        self.collections
            .contains_key(&(class_id.clone(), entity_type.clone()))
    }

    /// Replace a collection wholesale. Items are sorted on the way in.
    pub fn set(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        mut items: Vec<EntityRecord>,
        sync_state: SyncState,
    ) {
        merge::sort_records(&mut items);
        let len = items.len();
        self.collections.insert(
            (class_id.clone(), entity_type.clone()),
            CachedCollection {
                class_id: class_id.clone(),
                entity_type: entity_type.clone(),
                items,
                sync_state,
                last_loaded_at: Utc::now(),
            },
        );
        trace!(class_id = %class_id, entity_type = %entity_type, len, ?sync_state, "cache set");
        let _ = self.update_tx.send(CacheUpdate::Replaced {
            class_id: class_id.clone(),
            entity_type: entity_type.clone(),
            len,
            sync_state,
        });
    }

    /// Read-modify-write one collection. Returns `false` (and does nothing)
    /// when the collection is not loaded.
    pub fn update_with<F>(&self, class_id: &ClassId, entity_type: &EntityType, f: F) -> bool
    where
        F: FnOnce(&mut CachedCollection),
    {
        let (len, sync_state) = {
            let Some(mut entry) = self
                .collections
                .get_mut(&(class_id.clone(), entity_type.clone()))
            else {
                return false;
            };
            f(entry.value_mut());
            merge::sort_records(&mut entry.items);
            (entry.items.len(), entry.sync_state)
        };
        let _ = self.update_tx.send(CacheUpdate::Replaced {
            class_id: class_id.clone(),
            entity_type: entity_type.clone(),
            len,
            sync_state,
        });
        true
    }

    pub fn set_sync_state(
        &self,
        class_id: &ClassId,
        entity_type: &EntityType,
        sync_state: SyncState,
    ) -> bool {
        self.update_with(class_id, entity_type, |c| c.sync_state = sync_state)
    }

    /// Drop one collection. Returns whether it was loaded.
    pub fn invalidate(&self, class_id: &ClassId, entity_type: &EntityType) -> bool {
        let removed = self
            .collections
            .remove(&(class_id.clone(), entity_type.clone()))
            .is_some();
        if removed {
            debug!(class_id = %class_id, entity_type = %entity_type, "cache invalidated");
            let _ = self.update_tx.send(CacheUpdate::Invalidated {
                class_id: class_id.clone(),
                entity_type: entity_type.clone(),
            });
        }
        removed
    }

    /// Drop every collection not belonging to `class_id`.
    pub fn evict_except(&self, class_id: &ClassId) -> usize {
        let before = self.collections.len();
        self.collections.retain(|(class, _), _| class == class_id);
        let count = before.saturating_sub(self.collections.len());
        if count > 0 {
            let _ = self.update_tx.send(CacheUpdate::Evicted { count });
        }
        count
    }

    pub fn clear(&self) -> usize {
        let count = self.collections.len();
        self.collections.clear();
        if count > 0 {
            let _ = self.update_tx.send(CacheUpdate::Evicted { count });
        }
        count
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Keys of every loaded collection.
    pub fn keys(&self) -> Vec<(ClassId, EntityType)> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }
}

impl ResetObserver for EntityCacheManager {
    fn on_class_reset(&self, reset: &ClassReset) {
        let count = self.clear();
        debug!(generation = %reset.generation, evicted = count, "cache reset for class switch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Generation;
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use std::thread;

    fn class(id: &str) -> ClassId {
        ClassId::from(id)
    }

    fn subjects() -> EntityType {
        EntityType::from("subjects")
    }

    fn record(id: &str) -> EntityRecord {
        let mut record = EntityRecord::new_local(Map::new(), None, Utc::now());
        record.promote(id.to_string());
        record
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = EntityCacheManager::new(16);
        assert!(cache.get(&class("a"), &subjects()).is_none());

        cache.set(&class("a"), &subjects(), vec![record("doc-1")], SyncState::Synced);
        let collection = cache.get(&class("a"), &subjects()).unwrap();
        assert_eq!(collection.items.len(), 1);
        assert_eq!(collection.sync_state, SyncState::Synced);

        assert!(cache.invalidate(&class("a"), &subjects()));
        assert!(!cache.invalidate(&class("a"), &subjects()));
        assert!(cache.get(&class("a"), &subjects()).is_none());
    }

    #[test]
    fn test_update_with_requires_loaded_collection() {
        let cache = EntityCacheManager::new(16);
        assert!(!cache.update_with(&class("a"), &subjects(), |c| c.items.clear()));

        cache.set(&class("a"), &subjects(), vec![record("doc-1")], SyncState::Synced);
        assert!(cache.set_sync_state(&class("a"), &subjects(), SyncState::Stale));
        assert_eq!(
            cache.get(&class("a"), &subjects()).unwrap().sync_state,
            SyncState::Stale
        );
    }

    #[test]
    fn test_evict_except() {
        let cache = EntityCacheManager::new(16);
        cache.set(&class("a"), &subjects(), vec![], SyncState::Synced);
        cache.set(&class("b"), &subjects(), vec![], SyncState::Synced);
        cache.set(&class("b"), &EntityType::from("assignments"), vec![], SyncState::Synced);

        assert_eq!(cache.evict_except(&class("a")), 2);
        assert_eq!(cache.keys(), vec![(class("a"), subjects())]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let cache = EntityCacheManager::new(16);
        cache.set(&class("a"), &subjects(), vec![], SyncState::Synced);
        cache.on_class_reset(&ClassReset {
            previous: Some(class("a")),
            current: Some(class("a")),
            generation: Generation(2),
        });
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let cache = EntityCacheManager::new(16);
        let mut rx = cache.subscribe();

        cache.set(&class("a"), &subjects(), vec![record("doc-1")], SyncState::Synced);
        cache.invalidate(&class("a"), &subjects());

        assert_eq!(
            rx.recv().await.unwrap(),
            CacheUpdate::Replaced {
                class_id: class("a"),
                entity_type: subjects(),
                len: 1,
                sync_state: SyncState::Synced,
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CacheUpdate::Invalidated {
                class_id: class("a"),
                entity_type: subjects(),
            }
        );
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = EntityCacheManager::new(16);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let ty = EntityType::new(format!("type-{i}"));
                    for n in 0..50 {
                        cache.set(&class("a"), &ty, vec![record(&format!("doc-{n}"))], SyncState::Synced);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 8);
    }
}
