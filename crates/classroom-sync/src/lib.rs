//! Class-scoped, offline-first sync and cache layer for the classroom client.
//!
//! Keeps per-class entity collections (subjects, assignments, ...) in memory,
//! mirrors them to an on-device store, and reconciles them with a remote
//! authoritative store. Switching the active class never leaks the previous
//! class's data into readers.
//!
//! ## Features
//!
//! - **Coordinator**: active class plus a generation counter guarding every cache write
//! - **Cache**: thread-safe map of `(class, entity type)` collections with update broadcast
//! - **Engine**: remote-first mutations with local fallback, reloads that merge local-only records
//! - **Subscriptions**: live listeners per (class, entity type), torn down on class switch
//! - **Refresh bus**: per-class timestamps for out-of-band invalidation
//! - **Stores**: file-backed and in-memory local stores, an in-memory remote

pub mod cache;
pub mod collection;
mod config;
pub mod coordinator;
pub mod engine;
mod error;
mod identity;
pub mod local_store;
pub mod memory;
pub mod merge;
pub mod persist;
pub mod records;
pub mod refresh;
pub mod remote;
pub mod subscription;
mod sync;
mod types;

pub use cache::{CacheUpdate, EntityCacheManager};
pub use collection::{Collection, CollectionView};
pub use config::{DEFAULT_NAMESPACE, SyncConfig};
pub use coordinator::{ClassReset, ClassSwitchCoordinator, ResetObserver};
pub use engine::{LoadOutcome, SyncEngine};
pub use error::{LocalStoreError, RemoteError, SyncError, SyncResult};
pub use identity::{IdentityProvider, StaticIdentity};
pub use local_store::{FileStore, LocalStore, MemoryStore, PersistedCollection};
pub use memory::MemoryRemote;
pub use persist::{PersistCoordinator, PersistHandle};
pub use records::{ASSIGNMENT_COLLECTION, LOCAL_ID_PREFIX, SUBJECT_COLLECTION};
pub use refresh::{RefreshCursor, RefreshTriggerBus};
pub use remote::{ChangeCallback, ListenerHandle, RemoteEvent, RemoteStore};
pub use subscription::{SubscriptionManager, SubscriptionState};
pub use sync::{ClassroomSync, ClassroomSyncBuilder};
pub use types::*;
