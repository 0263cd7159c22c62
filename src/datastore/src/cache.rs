// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The write-through cache behind [`PersistentStoreWrapper`].
//!
//! Two tables: per-item entries keyed `(kind, key)` and per-kind "all items"
//! entries. With a finite TTL, entries expire and are dropped on read; with
//! an infinite TTL, entries never expire and the cache doubles as the
//! snapshot used to repopulate a persistent store after an outage.
//!
//! [`PersistentStoreWrapper`]: crate::PersistentStoreWrapper

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use beacon_data_model::{Collection, DataKind, ItemDescriptor, KeyedItemDescriptor};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub(crate) enum CacheTtl {
    Finite(Duration),
    Infinite,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stamped: Instant,
}

impl<V> Entry<V> {
    fn new(value: V) -> Entry<V> {
        Entry {
            value,
            stamped: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StoreCache {
    ttl: CacheTtl,
    items: Mutex<BTreeMap<(DataKind, String), Entry<ItemDescriptor>>>,
    all: Mutex<BTreeMap<DataKind, Entry<Vec<KeyedItemDescriptor>>>>,
}

impl StoreCache {
    pub fn new(ttl: CacheTtl) -> StoreCache {
        StoreCache {
            ttl,
            items: Mutex::new(BTreeMap::new()),
            all: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self.ttl, CacheTtl::Infinite)
    }

    fn fresh<V>(&self, entry: &Entry<V>) -> bool {
        match self.ttl {
            CacheTtl::Infinite => true,
            CacheTtl::Finite(ttl) => entry.stamped.elapsed() < ttl,
        }
    }

    pub fn get_item(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        let mut items = self.items.lock().expect("lock poisoned");
        let lookup = (kind, key.to_string());
        match items.get(&lookup) {
            Some(entry) if self.fresh(entry) => Some(entry.value.clone()),
            Some(_) => {
                items.remove(&lookup);
                None
            }
            None => None,
        }
    }

    pub fn put_item(&self, kind: DataKind, key: &str, item: ItemDescriptor) {
        let mut items = self.items.lock().expect("lock poisoned");
        items.insert((kind, key.to_string()), Entry::new(item));
    }

    pub fn invalidate_item(&self, kind: DataKind, key: &str) {
        let mut items = self.items.lock().expect("lock poisoned");
        items.remove(&(kind, key.to_string()));
    }

    pub fn get_all(&self, kind: DataKind) -> Option<Vec<KeyedItemDescriptor>> {
        let mut all = self.all.lock().expect("lock poisoned");
        match all.get(&kind) {
            Some(entry) if self.fresh(entry) => Some(entry.value.clone()),
            Some(_) => {
                all.remove(&kind);
                None
            }
            None => None,
        }
    }

    pub fn put_all(&self, kind: DataKind, items: Vec<KeyedItemDescriptor>) {
        let mut all = self.all.lock().expect("lock poisoned");
        all.insert(kind, Entry::new(items));
    }

    pub fn invalidate_all(&self, kind: DataKind) {
        let mut all = self.all.lock().expect("lock poisoned");
        all.remove(&kind);
    }

    /// Patches one key in the cached "all items" entry in place, preserving
    /// the entry's stamp. Used in infinite-TTL mode, where a full reload to
    /// repair the entry will never happen.
    pub fn patch_all(&self, kind: DataKind, key: &str, item: ItemDescriptor) {
        let mut all = self.all.lock().expect("lock poisoned");
        let Some(entry) = all.get_mut(&kind) else {
            return;
        };
        match entry.value.iter_mut().find(|keyed| keyed.key == key) {
            Some(keyed) => keyed.item = item,
            None => entry.value.push(KeyedItemDescriptor {
                key: key.to_string(),
                item,
            }),
        }
    }

    /// Replaces the entire cache contents with a full data set.
    pub fn replace_everything(&self, all_data: &[Collection]) {
        let mut items = self.items.lock().expect("lock poisoned");
        let mut all = self.all.lock().expect("lock poisoned");
        items.clear();
        all.clear();
        for collection in all_data {
            for keyed in &collection.items {
                items.insert(
                    (collection.kind, keyed.key.clone()),
                    Entry::new(keyed.item.clone()),
                );
            }
            all.insert(collection.kind, Entry::new(collection.items.clone()));
        }
    }

    /// Clones the cached "all items" entries as collections, for
    /// repopulating a recovered store from an infinite cache.
    pub fn snapshot_all(&self) -> Vec<Collection> {
        let all = self.all.lock().expect("lock poisoned");
        all.iter()
            .map(|(kind, entry)| Collection {
                kind: *kind,
                items: entry.value.clone(),
            })
            .collect()
    }
}
