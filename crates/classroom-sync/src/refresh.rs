//! Per-class refresh timestamps for out-of-band invalidation.
//!
//! Any collaborator may advance a class's timestamp (e.g. after a push
//! notification). Consumers compare against the last value they handled and
//! reload at most once per transition.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::types::ClassId;

/// Monotonic per-class refresh timestamps (milliseconds).
#[derive(Default)]
pub struct RefreshTriggerBus {
    stamps: DashMap<ClassId, Arc<watch::Sender<u64>>>,
}

impl RefreshTriggerBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sender(&self, class_id: &ClassId) -> Arc<watch::Sender<u64>> {
        self.stamps
            .entry(class_id.clone())
            .or_insert_with(|| Arc::new(watch::channel(0).0))
            .clone()
    }

    /// Latest timestamp for `class_id`; `0` if never signalled.
    pub fn latest(&self, class_id: &ClassId) -> u64 {
        self.stamps
            .get(class_id)
            .map(|sender| *sender.borrow())
            .unwrap_or(0)
    }

    /// Advance to `max(now, latest + 1)` and return the new value. Saturates
    /// at `u64::MAX`.
    pub fn bump(&self, class_id: &ClassId) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let sender = self.sender(class_id);
        let mut value = 0;
        sender.send_modify(|current| {
            *current = now.max(current.saturating_add(1));
            value = *current;
        });
        debug!(class_id = %class_id, timestamp = value, "refresh bumped");
        value
    }

    /// Move forward to `timestamp`. Lower or equal values are ignored.
    pub fn advance(&self, class_id: &ClassId, timestamp: u64) -> bool {
        let advanced = self.sender(class_id).send_if_modified(|current| {
            if timestamp > *current {
                *current = timestamp;
                true
            } else {
                false
            }
        });
        trace!(class_id = %class_id, timestamp, advanced, "refresh advance");
        advanced
    }

    /// Watch a class's timestamp. Rapid advances coalesce into one wakeup.
    pub fn subscribe(&self, class_id: &ClassId) -> watch::Receiver<u64> {
        self.sender(class_id).subscribe()
    }
}

#[derive(Debug, Default)]
struct CursorState {
    class_id: Option<ClassId>,
    handled: u64,
    in_flight: Option<u64>,
}

/// Consumer-side bookkeeping: which timestamp was last handled, and whether
/// a reload is running.
#[derive(Debug, Default)]
pub struct RefreshCursor {
    state: Mutex<CursorState>,
}

impl RefreshCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reload for `latest` if it is newer than what was handled and
    /// no reload is running. Returns the timestamp to pass to
    /// [`complete`](Self::complete).
    ///
    /// The first observation of a class only records its timestamp: the
    /// initial load already reflects it.
    pub fn claim(&self, class_id: &ClassId, latest: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.class_id.as_ref() != Some(class_id) {
            *state = CursorState {
                class_id: Some(class_id.clone()),
                handled: latest,
                in_flight: None,
            };
            return None;
        }
        if state.in_flight.is_some() || latest <= state.handled {
            return None;
        }
        state.in_flight = Some(latest);
        Some(latest)
    }

    /// Record a finished reload of `class_id`. Ignored once the cursor has
    /// moved to another class.
    pub fn complete(&self, class_id: &ClassId, timestamp: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.class_id.as_ref() != Some(class_id) {
            trace!(class_id = %class_id, timestamp, "completion for a previous class ignored");
            return;
        }
        state.handled = state.handled.max(timestamp);
        if state.in_flight == Some(timestamp) {
            state.in_flight = None;
        }
    }

    /// Give up a claimed reload without advancing.
    pub fn abandon(&self, class_id: &ClassId, timestamp: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.class_id.as_ref() == Some(class_id) && state.in_flight == Some(timestamp) {
            state.in_flight = None;
        }
    }

    pub fn handled(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_is_strictly_monotonic() {
        let bus = RefreshTriggerBus::new();
        let class = ClassId::from("a");
        let first = bus.bump(&class);
        let second = bus.bump(&class);
        assert!(second > first);
        assert_eq!(bus.latest(&class), second);
    }

    #[test]
    fn test_bump_saturates_at_max() {
        let bus = RefreshTriggerBus::new();
        let class = ClassId::from("a");
        assert!(bus.advance(&class, u64::MAX));
        assert_eq!(bus.bump(&class), u64::MAX);
        assert_eq!(bus.latest(&class), u64::MAX);
    }

    #[test]
    fn test_advance_ignores_lower_values() {
        let bus = RefreshTriggerBus::new();
        let class = ClassId::from("a");
        assert!(bus.advance(&class, 10));
        assert!(!bus.advance(&class, 5));
        assert!(!bus.advance(&class, 10));
        assert_eq!(bus.latest(&class), 10);
        assert_eq!(bus.latest(&ClassId::from("b")), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_coalesced_value() {
        let bus = RefreshTriggerBus::new();
        let class = ClassId::from("a");
        let mut rx = bus.subscribe(&class);
        bus.advance(&class, 1);
        bus.advance(&class, 2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_cursor_one_reload_per_transition() {
        let cursor = RefreshCursor::new();
        let class = ClassId::from("a");

        // First sight of the class records without reloading.
        assert_eq!(cursor.claim(&class, 5), None);
        assert_eq!(cursor.claim(&class, 5), None);

        assert_eq!(cursor.claim(&class, 6), Some(6));
        // Advances during the reload are folded.
        assert_eq!(cursor.claim(&class, 7), None);
        assert_eq!(cursor.claim(&class, 8), None);
        cursor.complete(&class, 6);

        assert_eq!(cursor.claim(&class, 8), Some(8));
        cursor.complete(&class, 8);
        assert_eq!(cursor.claim(&class, 8), None);
        assert_eq!(cursor.handled(), 8);
    }

    #[test]
    fn test_cursor_resets_on_class_change() {
        let cursor = RefreshCursor::new();
        cursor.claim(&ClassId::from("a"), 1);
        assert_eq!(cursor.claim(&ClassId::from("a"), 2), Some(2));
        cursor.abandon(&ClassId::from("a"), 2);
        assert_eq!(cursor.claim(&ClassId::from("b"), 50), None);
        assert_eq!(cursor.handled(), 50);
    }

    #[test]
    fn test_late_completion_for_previous_class_is_ignored() {
        let cursor = RefreshCursor::new();
        let (a, b) = (ClassId::from("a"), ClassId::from("b"));
        cursor.claim(&a, 1);
        let running = cursor.claim(&a, 100).unwrap();

        // The consumer moves on while class a's reload is still running.
        assert_eq!(cursor.claim(&b, 0), None);
        cursor.complete(&a, running);
        cursor.abandon(&a, running);
        assert_eq!(cursor.handled(), 0);

        assert_eq!(cursor.claim(&b, 50), Some(50));
        // Still in flight for b.
        assert_eq!(cursor.claim(&b, 60), None);
        cursor.complete(&b, 50);
        assert_eq!(cursor.claim(&b, 60), Some(60));
    }
}
