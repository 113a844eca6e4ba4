//! Read-only inspection and cleanup of the on-device store.

use std::path::Path;

use miette::Result;
use tracing::{info, warn};

use classroom_sync::records::{class_prefix, parse_collection_key};
use classroom_sync::{ClassId, FileStore, LocalStore, PersistedCollection, SyncConfig};

async fn open(store_dir: &Path) -> Result<FileStore> {
    FileStore::open(store_dir)
        .await
        .map_err(|e| miette::miette!("failed to open store {}: {}", store_dir.display(), e))
}

fn prefix_for(config: &SyncConfig, class: Option<&str>) -> String {
    match class {
        Some(class) => class_prefix(&config.namespace, &ClassId::from(class)),
        None => format!("{}:", config.namespace),
    }
}

/// Collection keys of `class`, or of every class. Class ids may contain `:`,
/// so a prefix match alone would also pick up `school:7b` for `school`.
async fn collection_keys(
    store: &FileStore,
    config: &SyncConfig,
    class: Option<&str>,
) -> Result<Vec<String>> {
    let keys = store
        .keys(&prefix_for(config, class))
        .await
        .map_err(|e| miette::miette!("failed to list keys: {}", e))?;
    Ok(keys
        .into_iter()
        .filter(|key| match class {
            Some(class) => parse_collection_key(&config.namespace, key)
                .is_some_and(|(class_id, _)| class_id.as_str() == class),
            None => true,
        })
        .collect())
}

pub async fn run_inspect(config: &SyncConfig, store_dir: &Path, class: Option<&str>) -> Result<()> {
    let store = open(store_dir).await?;
    let keys = collection_keys(&store, config, class).await?;

    if keys.is_empty() {
        println!("No cached collections under '{}'.", prefix_for(config, class));
        return Ok(());
    }

    println!("{} cached collection(s) in {}:\n", keys.len(), store_dir.display());
    for key in keys {
        let Some((class_id, entity_type)) = parse_collection_key(&config.namespace, &key) else {
            warn!(key = %key, "skipping unrecognized key");
            continue;
        };
        let raw = store
            .get(&key)
            .await
            .map_err(|e| miette::miette!("failed to read {}: {}", key, e))?;
        let Some(raw) = raw else { continue };

        match serde_json::from_value::<PersistedCollection>(raw) {
            Ok(collection) => println!(
                "  {:<24} {:<14} {:>4} items  {:>3} local-only  saved {}",
                class_id.as_str(),
                entity_type.as_str(),
                collection.items.len(),
                collection.local_only_count(),
                collection.saved_at.to_rfc3339(),
            ),
            Err(e) => println!(
                "  {:<24} {:<14} unreadable: {}",
                class_id.as_str(),
                entity_type.as_str(),
                e
            ),
        }
    }
    Ok(())
}

pub async fn run_clear(
    config: &SyncConfig,
    store_dir: &Path,
    class: &str,
    dry_run: bool,
) -> Result<()> {
    let store = open(store_dir).await?;
    let keys = collection_keys(&store, config, Some(class)).await?;

    if dry_run {
        println!("Would remove {} collection(s):", keys.len());
        for key in &keys {
            println!("  {}", key);
        }
        return Ok(());
    }

    for key in &keys {
        store
            .remove(key)
            .await
            .map_err(|e| miette::miette!("failed to remove {}: {}", key, e))?;
    }
    info!(class_id = %class, removed = keys.len(), "cleared cached collections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use classroom_sync::{EntityType, records::collection_key};

    #[tokio::test]
    async fn clear_removes_only_the_class() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::default();
        let store = FileStore::open(dir.path()).await.unwrap();
        for class in ["class-a", "class-b"] {
            let key = collection_key(
                &config.namespace,
                &ClassId::from(class),
                &EntityType::from("subjects"),
            );
            let doc = PersistedCollection::new(class.into(), "subjects".into(), Vec::new());
            store
                .set(&key, serde_json::to_value(doc).unwrap())
                .await
                .unwrap();
        }

        run_clear(&config, dir.path(), "class-a", true).await.unwrap();
        assert_eq!(store.keys("classroom:").await.unwrap().len(), 2);

        run_clear(&config, dir.path(), "class-a", false).await.unwrap();
        assert_eq!(
            store.keys("classroom:").await.unwrap(),
            vec!["classroom:class-b:subjects".to_string()]
        );
        run_inspect(&config, dir.path(), None).await.unwrap();
    }

    #[tokio::test]
    async fn clear_matches_class_id_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::default();
        let store = FileStore::open(dir.path()).await.unwrap();
        for class in ["school", "school:7b"] {
            let key = collection_key(
                &config.namespace,
                &ClassId::from(class),
                &EntityType::from("subjects"),
            );
            store.set(&key, serde_json::json!({})).await.unwrap();
        }

        assert_eq!(
            collection_keys(&store, &config, Some("school")).await.unwrap(),
            vec!["classroom:school:subjects".to_string()]
        );

        run_clear(&config, dir.path(), "school", false).await.unwrap();
        assert_eq!(
            store.keys("classroom:").await.unwrap(),
            vec!["classroom:school:7b:subjects".to_string()]
        );
    }
}
