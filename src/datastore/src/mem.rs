// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The default, purely in-memory data store.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use beacon_data_model::{Collection, DataKind, ItemDescriptor, KeyedItemDescriptor};

use crate::types::{DataStore, StoreError};

/// A thread-safe map of maps: `DataKind → (key → ItemDescriptor)`.
///
/// Reads take the reader lock and clone descriptors (an `Arc` bump per
/// item); writes take the writer lock. Never fails, so status monitoring is
/// disabled.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    data: RwLock<BTreeMap<DataKind, BTreeMap<String, ItemDescriptor>>>,
    initialized: AtomicBool,
}

impl InMemoryDataStore {
    pub fn new() -> InMemoryDataStore {
        InMemoryDataStore::default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
        let mut new_data = BTreeMap::new();
        for collection in all_data {
            let items: BTreeMap<String, ItemDescriptor> = collection
                .items
                .into_iter()
                .map(|keyed| (keyed.key, keyed.item))
                .collect();
            new_data.insert(collection.kind, items);
        }
        *self.data.write().expect("lock poisoned") = new_data;
        // Set once, never cleared.
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<ItemDescriptor, StoreError> {
        let data = self.data.read().expect("lock poisoned");
        Ok(data
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned()
            .unwrap_or(ItemDescriptor::NOT_FOUND))
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItemDescriptor>, StoreError> {
        let data = self.data.read().expect("lock poisoned");
        Ok(data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| KeyedItemDescriptor {
                        key: key.clone(),
                        item: item.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.write().expect("lock poisoned");
        let items = data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                items.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    async fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use beacon_data_model::{FEATURES, FeatureFlag, SEGMENTS, StoreItem};

    use super::*;

    fn flag(key: &str, version: i64) -> ItemDescriptor {
        ItemDescriptor::new(StoreItem::Flag(FeatureFlag {
            version,
            ..serde_json::from_value(serde_json::json!({"key": key})).unwrap()
        }))
    }

    fn keyed(key: &str, item: ItemDescriptor) -> KeyedItemDescriptor {
        KeyedItemDescriptor {
            key: key.to_string(),
            item,
        }
    }

    #[tokio::test]
    async fn init_replaces_everything() {
        let store = InMemoryDataStore::new();
        assert!(!store.is_initialized().await);

        store
            .init(vec![Collection {
                kind: FEATURES,
                items: vec![keyed("a", flag("a", 1)), keyed("b", flag("b", 1))],
            }])
            .await
            .unwrap();
        assert!(store.is_initialized().await);

        store
            .init(vec![Collection {
                kind: FEATURES,
                items: vec![keyed("c", flag("c", 5))],
            }])
            .await
            .unwrap();

        assert!(store.get(FEATURES, "a").await.unwrap().is_not_found());
        assert_eq!(store.get(FEATURES, "c").await.unwrap().version, 5);
    }

    #[tokio::test]
    async fn empty_init_still_initializes() {
        let store = InMemoryDataStore::new();
        store.init(vec![]).await.unwrap();
        assert!(store.is_initialized().await);
        assert!(store.get_all(FEATURES).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_is_version_gated() {
        let store = InMemoryDataStore::new();
        store.init(vec![]).await.unwrap();

        assert!(store.upsert(FEATURES, "f", flag("f", 2)).await.unwrap());
        // Same and older versions have no effect.
        assert!(!store.upsert(FEATURES, "f", flag("f", 2)).await.unwrap());
        assert!(!store.upsert(FEATURES, "f", flag("f", 1)).await.unwrap());
        assert!(store.upsert(FEATURES, "f", flag("f", 3)).await.unwrap());
        assert_eq!(store.get(FEATURES, "f").await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn tombstones_defeat_stale_writes() {
        let store = InMemoryDataStore::new();
        store.init(vec![]).await.unwrap();

        store.upsert(FEATURES, "f", flag("f", 2)).await.unwrap();
        assert!(
            store
                .upsert(FEATURES, "f", ItemDescriptor::tombstone(4))
                .await
                .unwrap()
        );
        // The tombstone's version gates later writes.
        assert!(!store.upsert(FEATURES, "f", flag("f", 3)).await.unwrap());

        let got = store.get(FEATURES, "f").await.unwrap();
        assert!(got.is_deleted());
        assert_eq!(got.version, 4);

        // Tombstones show up in getAll.
        let all = store.get_all(FEATURES).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].item.is_deleted());
    }

    #[tokio::test]
    async fn get_unknown_key_is_not_found() {
        let store = InMemoryDataStore::new();
        store.init(vec![]).await.unwrap();
        let got = store.get(SEGMENTS, "nope").await.unwrap();
        assert_eq!(got, ItemDescriptor::NOT_FOUND);
        assert_eq!(got.version, -1);
    }
}
