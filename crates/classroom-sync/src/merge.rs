//! Ordering and merge rules shared by loads, mutations and subscription events.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::{EntityRecord, SyncState};

/// Newest first; ties broken by id ascending.
pub fn compare_records(a: &EntityRecord, b: &EntityRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_records(items: &mut [EntityRecord]) {
    items.sort_by(compare_records);
}

pub fn local_only(items: &[EntityRecord]) -> Vec<EntityRecord> {
    items.iter().filter(|r| r.is_local_only()).cloned().collect()
}

/// Union an authoritative remote set with local-only records.
///
/// A local-only record is dropped only when its id is among the remote ids;
/// remote records always win. The result is sorted.
pub fn merge_with_local_only(
    remote: Vec<EntityRecord>,
    local: impl IntoIterator<Item = EntityRecord>,
) -> Vec<EntityRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    for record in &remote {
        seen.insert(record.id.clone());
        if let Some(remote_id) = &record.remote_id {
            seen.insert(remote_id.clone());
        }
    }

    let mut merged = remote;
    for record in local {
        if record.is_local_only() && seen.insert(record.id.clone()) {
            merged.push(record);
        }
    }
    sort_records(&mut merged);
    merged
}

/// Replace the record with the same id, or insert it. Keeps order.
pub fn upsert_record(items: &mut Vec<EntityRecord>, record: EntityRecord) {
    match items.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => items.push(record),
    }
    sort_records(items);
}

/// Remove the record addressed by `id`. Returns whether anything was removed.
pub fn remove_record(items: &mut Vec<EntityRecord>, id: &str) -> bool {
    let before = items.len();
    items.retain(|r| !r.matches_id(id));
    items.len() != before
}

/// State of a collection after a remote-confirmed change.
pub fn derive_state(items: &[EntityRecord], previous: SyncState) -> SyncState {
    if items.iter().any(EntityRecord::is_local_only) {
        SyncState::LocalOnly
    } else if previous == SyncState::Stale {
        SyncState::Stale
    } else {
        SyncState::Synced
    }
}

/// State of a freshly loaded authoritative set.
pub fn loaded_state(items: &[EntityRecord]) -> SyncState {
    derive_state(items, SyncState::Synced)
}
