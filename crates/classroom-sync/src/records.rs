//! Collection names and local store key helpers.

use crate::types::{ClassId, EntityType};

/// Collection name for subject records.
pub const SUBJECT_COLLECTION: &str = "subjects";

/// Collection name for assignment records.
pub const ASSIGNMENT_COLLECTION: &str = "assignments";

/// Prefix of client-reserved ids for records created while offline.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Version written into every persisted collection document.
pub const PERSISTED_VERSION: u32 = 1;

/// Local store key of one (class, entity type) collection.
pub fn collection_key(namespace: &str, class_id: &ClassId, entity_type: &EntityType) -> String {
    format!("{}:{}:{}", namespace, class_id, entity_type)
}

/// Key prefix matching every collection of a class.
pub fn class_prefix(namespace: &str, class_id: &ClassId) -> String {
    format!("{}:{}:", namespace, class_id)
}

/// Split a collection key back into its class and entity type.
///
/// Class ids may contain `:`; the namespace and entity type may not.
pub fn parse_collection_key(namespace: &str, key: &str) -> Option<(ClassId, EntityType)> {
    let rest = key.strip_prefix(namespace)?.strip_prefix(':')?;
    let (class, entity_type) = rest.rsplit_once(':')?;
    if class.is_empty() || entity_type.is_empty() {
        return None;
    }
    Some((ClassId::from(class), EntityType::from(entity_type)))
}
