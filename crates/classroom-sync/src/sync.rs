//! The owned sync layer: one coordinator, one cache, one engine, one
//! subscription manager and one refresh bus, wired together.

use std::sync::Arc;

use tracing::info;

use crate::cache::EntityCacheManager;
use crate::collection::Collection;
use crate::config::SyncConfig;
use crate::coordinator::{ClassReset, ClassSwitchCoordinator, ResetObserver};
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::local_store::LocalStore;
use crate::persist::{PersistCoordinator, PersistHandle};
use crate::refresh::RefreshTriggerBus;
use crate::remote::RemoteStore;
use crate::subscription::SubscriptionManager;
use crate::types::{ClassId, ClassIdentity, EntityKind, Generation};

pub(crate) struct SyncCore {
    pub(crate) config: SyncConfig,
    pub(crate) coordinator: Arc<ClassSwitchCoordinator>,
    pub(crate) cache: Arc<EntityCacheManager>,
    pub(crate) engine: SyncEngine,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) refresh: Arc<RefreshTriggerBus>,
    pub(crate) persist: PersistHandle,
}

/// Entry point of the sync layer.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ClassroomSync {
    core: Arc<SyncCore>,
}

impl ClassroomSync {
    pub fn builder(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
    ) -> ClassroomSyncBuilder {
        ClassroomSyncBuilder::new(remote, local)
    }

    /// Switch the active class. Every cached collection and live listener
    /// is reset before this returns.
    pub fn set_active_class(&self, class_id: impl Into<ClassId>) -> ClassIdentity {
        self.core.coordinator.set_active_class(class_id)
    }

    /// Drop the active class (sign-out).
    pub fn clear_active_class(&self) -> Generation {
        self.core.coordinator.clear_active_class()
    }

    pub fn active_class(&self) -> Option<ClassIdentity> {
        self.core.coordinator.capture()
    }

    /// Typed accessor for one entity collection of the active class.
    pub fn collection<T: EntityKind>(&self) -> Collection<T> {
        Collection::new(Arc::clone(&self.core))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    pub fn coordinator(&self) -> &Arc<ClassSwitchCoordinator> {
        &self.core.coordinator
    }

    pub fn cache(&self) -> &Arc<EntityCacheManager> {
        &self.core.cache
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.core.engine
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.core.subscriptions
    }

    pub fn refresh_bus(&self) -> &Arc<RefreshTriggerBus> {
        &self.core.refresh
    }

    /// Register an additional synchronous reset observer.
    pub fn register_observer(&self, observer: &Arc<dyn ResetObserver>) {
        self.core.coordinator.register(Arc::downgrade(observer));
    }

    /// Async class switch notifications.
    pub fn subscribe_resets(&self) -> tokio::sync::broadcast::Receiver<ClassReset> {
        self.core.coordinator.subscribe()
    }

    /// Wait for every queued local store write.
    pub async fn flush(&self) -> SyncResult<()> {
        self.core.persist.flush().await?;
        Ok(())
    }

    /// Release all listeners and stop the local store writer once queued
    /// writes are done.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.core.subscriptions.unlisten_all();
        self.core.persist.flush().await?;
        self.core.persist.shutdown();
        info!("classroom sync shut down");
        Ok(())
    }
}

/// Builder for [`ClassroomSync`].
pub struct ClassroomSyncBuilder {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
    config: Option<SyncConfig>,
}

impl ClassroomSyncBuilder {
    pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>) -> Self {
        Self {
            remote,
            local,
            identity: None,
            config: None,
        }
    }

    /// Provider of the acting user id. Defaults to anonymous.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the sync layer. Spawns the local store writer, so this must
    /// run inside a tokio runtime.
    pub fn build(self) -> ClassroomSync {
        let config = self.config.unwrap_or_default();
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(StaticIdentity::anonymous()));

        let coordinator = Arc::new(ClassSwitchCoordinator::new(config.update_channel_capacity));
        let cache = EntityCacheManager::new(config.update_channel_capacity);
        let cache_observer: Arc<dyn ResetObserver> = cache.clone();
        coordinator.register(Arc::downgrade(&cache_observer));

        let persist = PersistCoordinator::spawn(self.local, config.namespace.clone());
        let engine = SyncEngine::new(
            self.remote.clone(),
            persist.clone(),
            cache.clone(),
            coordinator.clone(),
            identity,
            &config,
        );
        let subscriptions = SubscriptionManager::new(
            self.remote,
            cache.clone(),
            coordinator.clone(),
            persist.clone(),
        );

        info!(namespace = %config.namespace, "classroom sync ready");
        ClassroomSync {
            core: Arc::new(SyncCore {
                config,
                coordinator,
                cache,
                engine,
                subscriptions,
                refresh: RefreshTriggerBus::new(),
                persist,
            }),
        }
    }
}
