//! Core types for class-scoped entity collections.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::records::{ASSIGNMENT_COLLECTION, LOCAL_ID_PREFIX, SUBJECT_COLLECTION};

/// Identifier of a class, the tenant every cached collection is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub String);

impl ClassId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClassId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Name of an entity collection, e.g. `subjects`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Monotonic tenant epoch. Bumped on every class switch, including a switch
/// back to the same class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The active class together with the generation it was activated under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIdentity {
    pub id: ClassId,
    pub generation: Generation,
}

/// Synchronization state of a cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Matches the remote as of the last load or subscription event.
    Synced,
    /// Holds changes not yet confirmed by the remote.
    LocalOnly,
    /// Last-known-good data served after a failed load or transport error.
    Stale,
}

impl SyncState {
    pub fn is_synced(self) -> bool {
        self == SyncState::Synced
    }
}

/// A record as stored in the cache, the local store and the remote store.
///
/// Domain payloads live in `fields`; typed access goes through [`Entity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    /// Server-assigned id. `None` means the record only exists on this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// Build a record that has not reached the remote yet.
    ///
    /// The id is client-reserved (`local-<uuid>`) so it can never match a
    /// server id of unrelated provenance.
    pub fn new_local(fields: Map<String, Value>, actor: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            remote_id: None,
            created_at: now,
            updated_at: now,
            created_by: actor.clone(),
            updated_by: actor,
            fields,
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_none()
    }

    /// Whether `id` addresses this record, by local or remote id.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id == id || self.remote_id.as_deref() == Some(id)
    }

    /// Assign the server id, making the record authoritative.
    pub fn promote(&mut self, remote_id: String) {
        self.id = remote_id.clone();
        self.remote_id = Some(remote_id);
    }

    /// Normalize a document read from the remote store.
    pub fn into_remote(mut self) -> Self {
        if self.remote_id.is_none() {
            self.remote_id = Some(self.id.clone());
        }
        self
    }

    /// Shallow-merge `patch` into the fields and stamp the update.
    pub fn apply_patch(
        &mut self,
        patch: Map<String, Value>,
        actor: Option<String>,
        now: DateTime<Utc>,
    ) {
        for (key, value) in patch {
            self.fields.insert(key, value);
        }
        self.updated_at = now;
        if actor.is_some() {
            self.updated_by = actor;
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// An entity collection cached for one class.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCollection {
    pub class_id: ClassId,
    pub entity_type: EntityType,
    /// Kept in display order (see [`crate::merge::sort_records`]).
    pub items: Vec<EntityRecord>,
    pub sync_state: SyncState,
    pub last_loaded_at: DateTime<Utc>,
}

impl CachedCollection {
    pub fn local_only_items(&self) -> Vec<EntityRecord> {
        crate::merge::local_only(&self.items)
    }

    pub fn find(&self, id: &str) -> Option<&EntityRecord> {
        self.items.iter().find(|r| r.matches_id(id))
    }
}

/// Kind of mutation recorded in the diagnostics ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A mutation that could not reach the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub entity_type: EntityType,
    pub operation: MutationKind,
    pub record_id: String,
    pub payload: Value,
    pub target_class_id: ClassId,
    pub attempted_at: DateTime<Utc>,
    pub reason: String,
}

/// Result of an accepted mutation. An `Ok` outcome always means success;
/// `synced == false` is advisory (the change is only on this device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    pub id: String,
    pub synced: bool,
}

/// A domain payload stored in one entity collection.
pub trait EntityKind: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name used for cache and store keys.
    const ENTITY_TYPE: &'static str;

    fn entity_type() -> EntityType {
        EntityType::new(Self::ENTITY_TYPE)
    }
}

/// A decoded record of kind `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<T> {
    pub id: String,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub data: T,
}

impl<T: EntityKind> Entity<T> {
    pub fn from_record(record: &EntityRecord) -> Result<Self, serde_json::Error> {
        let data = serde_json::from_value(Value::Object(record.fields.clone()))?;
        Ok(Self {
            id: record.id.clone(),
            remote_id: record.remote_id.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            created_by: record.created_by.clone(),
            data,
        })
    }

    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_none()
    }
}

/// Serialize a payload into record fields. Payloads must be JSON objects.
pub fn to_fields<T: Serialize>(payload: &T) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "entity payload must serialize to an object, got {other}"
        ))),
    }
}

/// A subject taught in a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Display color, e.g. `#4f46e5`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Subject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            color: None,
        }
    }
}

impl EntityKind for Subject {
    const ENTITY_TYPE: &'static str = SUBJECT_COLLECTION;
}

/// Homework or classwork handed out to a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Id of the subject this assignment belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
}

impl EntityKind for Assignment {
    const ENTITY_TYPE: &'static str = ASSIGNMENT_COLLECTION;
}
