//! Active class ownership and the generation guard.
//!
//! The coordinator owns the active class and a monotonic generation counter.
//! A switch bumps the generation and resets every registered observer before
//! it returns, so no loader can populate the new class with data started
//! under the old one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::types::{ClassId, ClassIdentity, Generation};

/// Notification that the active class changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassReset {
    pub previous: Option<ClassId>,
    pub current: Option<ClassId>,
    /// Generation now in effect.
    pub generation: Generation,
}

/// A dependent that must drop per-class state on every switch.
///
/// Invoked synchronously while the switch holds the coordinator's write
/// guard: implementations must not call back into the coordinator.
pub trait ResetObserver: Send + Sync {
    fn on_class_reset(&self, reset: &ClassReset);
}

#[derive(Debug, Default)]
struct ActiveClass {
    class_id: Option<ClassId>,
    generation: Generation,
}

/// Owner of the active class and its generation.
pub struct ClassSwitchCoordinator {
    state: RwLock<ActiveClass>,
    /// Mirror of `state.generation` for lock-free reads.
    generation: AtomicU64,
    observers: RwLock<Vec<Weak<dyn ResetObserver>>>,
    reset_tx: broadcast::Sender<ClassReset>,
}

impl ClassSwitchCoordinator {
    pub fn new(capacity: usize) -> Self {
        let (reset_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(ActiveClass::default()),
            generation: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
            reset_tx,
        }
    }

    /// Register a synchronous reset observer. Dropped observers are pruned
    /// on the next switch.
    pub fn register(&self, observer: Weak<dyn ResetObserver>) {
        write(&self.observers).push(observer);
    }

    /// Async notification channel for class switches.
    pub fn subscribe(&self) -> broadcast::Receiver<ClassReset> {
        self.reset_tx.subscribe()
    }

    pub fn current_class_id(&self) -> Option<ClassId> {
        read(&self.state).class_id.clone()
    }

    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    /// Snapshot of (class, generation) for an operation about to start.
    pub fn capture(&self) -> Option<ClassIdentity> {
        let state = read(&self.state);
        state.class_id.as_ref().map(|id| ClassIdentity {
            id: id.clone(),
            generation: state.generation,
        })
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation() == generation
    }

    /// Run `f` only if `generation` is still current.
    ///
    /// The check and `f` happen under the read guard, so a concurrent switch
    /// waits for `f` to finish and no commit starts after a switch. `f` must
    /// not switch classes.
    pub fn commit_if_current<R>(&self, generation: Generation, f: impl FnOnce() -> R) -> Option<R> {
        let state = read(&self.state);
        if state.generation != generation {
            trace!(
                started = %generation,
                current = %state.generation,
                "discarding result from stale generation"
            );
            return None;
        }
        Some(f())
    }

    /// Make `class_id` active. Bumps the generation even when `class_id` is
    /// already active.
    pub fn set_active_class(&self, class_id: impl Into<ClassId>) -> ClassIdentity {
        let class_id = class_id.into();
        let generation = self.switch(Some(class_id.clone()));
        ClassIdentity {
            id: class_id,
            generation,
        }
    }

    /// Drop the active class (sign-out).
    pub fn clear_active_class(&self) -> Generation {
        self.switch(None)
    }

    fn switch(&self, next: Option<ClassId>) -> Generation {
        let reset = {
            let mut state = write(&self.state);
            let previous = std::mem::replace(&mut state.class_id, next.clone());
            state.generation = state.generation.next();
            self.generation.store(state.generation.0, Ordering::SeqCst);

            let reset = ClassReset {
                previous,
                current: next,
                generation: state.generation,
            };
            self.notify_observers(&reset);
            reset
        };

        info!(
            previous = ?reset.previous,
            current = ?reset.current,
            generation = %reset.generation,
            "active class changed"
        );
        // No receivers is fine.
        let _ = self.reset_tx.send(reset.clone());
        reset.generation
    }

    fn notify_observers(&self, reset: &ClassReset) {
        let mut observers = write(&self.observers);
        observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                observer.on_class_reset(reset);
                true
            }
            None => false,
        });
        debug!(observers = observers.len(), generation = %reset.generation, "reset delivered");
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
