// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The persistent-store wrapper.
//!
//! [`PersistentStoreWrapper`] turns a bare [`PersistentDataStore`] plugin
//! into the full [`DataStore`] contract. The wrapper owns everything the
//! plugins should not have to get right: (de)serialization through the
//! [`DataKind`] registry, a write-through cache with finite or infinite TTL,
//! single-flight coalescing of concurrent cache misses, and an availability
//! poller that watches a failed store until it comes back.
//!
//! The cache-TTL sign convention from the configuration surface maps onto
//! [`CacheMode`]: zero disables caching, a positive TTL expires entries, and
//! a negative TTL means entries live forever. Infinite caching changes the
//! failure story: writes that the store rejects are still cached, and on
//! recovery the whole cached snapshot is flushed back into the store.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_data_model::{
    Collection, DataKind, ItemDescriptor, KeyedItemDescriptor, KeyedSerializedItemDescriptor,
    SerializedCollection,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cache::{CacheTtl, StoreCache};
use crate::status::DataStoreStatusManager;
use crate::types::{DataStore, DataStoreStatus, PersistentDataStore, StoreError};

/// How often an unavailable store is probed for recovery.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a negative `is_initialized` answer is remembered before the
/// store is asked again.
const INIT_CHECK_TTL: Duration = Duration::from_millis(500);

/// Caching behavior of a [`PersistentStoreWrapper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Every operation hits the underlying store.
    Off,
    /// Entries expire after the given TTL. A zero TTL is equivalent to
    /// [`CacheMode::Off`].
    Ttl(Duration),
    /// Entries never expire; the cache can repopulate the store after an
    /// outage.
    Infinite,
}

/// Adapts a [`PersistentDataStore`] plugin into the [`DataStore`] contract.
pub struct PersistentStoreWrapper {
    core: Arc<WrapperCore>,
}

struct WrapperCore {
    store: Box<dyn PersistentDataStore>,
    cache: Option<StoreCache>,
    get_flights: SingleFlight<Result<ItemDescriptor, StoreError>>,
    all_flights: SingleFlight<Result<Vec<KeyedItemDescriptor>, StoreError>>,
    initialized: AtomicBool,
    init_checked: Mutex<Option<Instant>>,
    status: Arc<DataStoreStatusManager>,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PersistentStoreWrapper {
    pub fn new(store: Box<dyn PersistentDataStore>, cache_mode: CacheMode) -> PersistentStoreWrapper {
        let cache = match cache_mode {
            CacheMode::Off => None,
            CacheMode::Ttl(ttl) if ttl.is_zero() => None,
            CacheMode::Ttl(ttl) => Some(StoreCache::new(CacheTtl::Finite(ttl))),
            CacheMode::Infinite => Some(StoreCache::new(CacheTtl::Infinite)),
        };
        PersistentStoreWrapper {
            core: Arc::new(WrapperCore {
                store,
                cache,
                get_flights: SingleFlight::new(),
                all_flights: SingleFlight::new(),
                initialized: AtomicBool::new(false),
                init_checked: Mutex::new(None),
                status: Arc::new(DataStoreStatusManager::new()),
                poller: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The status manager through which this wrapper reports outages and
    /// recoveries.
    pub fn status_manager(&self) -> Arc<DataStoreStatusManager> {
        Arc::clone(&self.core.status)
    }
}

#[async_trait]
impl DataStore for PersistentStoreWrapper {
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
        self.core.init(all_data).await
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<ItemDescriptor, StoreError> {
        self.core.get(kind, key).await
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItemDescriptor>, StoreError> {
        self.core.get_all(kind).await
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        self.core.upsert(kind, key, item).await
    }

    async fn is_initialized(&self) -> bool {
        self.core.is_initialized().await
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.core.close().await
    }
}

impl WrapperCore {
    async fn init(self: &Arc<Self>, all_data: Vec<Collection>) -> Result<(), StoreError> {
        let serialized = serialize_all(&all_data)?;
        match self.store.init(serialized).await {
            Ok(()) => {
                if let Some(cache) = &self.cache {
                    cache.replace_everything(&all_data);
                }
                self.initialized.store(true, Ordering::SeqCst);
                *self.init_checked.lock().expect("lock poisoned") = None;
                Ok(())
            }
            Err(err) => {
                self.note_unavailable(&err);
                if let Some(cache) = &self.cache
                    && cache.is_infinite()
                {
                    // The data is not lost: serve it from cache and flush it
                    // back into the store once the poller sees it recover.
                    cache.replace_everything(&all_data);
                    self.initialized.store(true, Ordering::SeqCst);
                }
                Err(StoreError::persistent(&err))
            }
        }
    }

    async fn get(self: &Arc<Self>, kind: DataKind, key: &str) -> Result<ItemDescriptor, StoreError> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get_item(kind, key)
        {
            return Ok(hit);
        }
        let flight_key = format!("get:{}:{}", kind.name(), key);
        let core = Arc::clone(self);
        let key = key.to_string();
        self.get_flights
            .run(&flight_key, move || async move {
                match core.store.get(kind, &key).await {
                    Ok(serialized) => {
                        let descriptor = match &serialized {
                            Some(s) => kind.deserialize_from_store(s).map_err(StoreError::from)?,
                            // Not-found is cached too, so a key that is asked
                            // for repeatedly does not hammer the store.
                            None => ItemDescriptor::NOT_FOUND,
                        };
                        if let Some(cache) = &core.cache {
                            cache.put_item(kind, &key, descriptor.clone());
                        }
                        Ok(descriptor)
                    }
                    Err(err) => {
                        core.note_unavailable(&err);
                        Err(StoreError::persistent(&err))
                    }
                }
            })
            .await
    }

    async fn get_all(
        self: &Arc<Self>,
        kind: DataKind,
    ) -> Result<Vec<KeyedItemDescriptor>, StoreError> {
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get_all(kind)
        {
            return Ok(hit);
        }
        let flight_key = format!("all:{}", kind.name());
        let core = Arc::clone(self);
        self.all_flights
            .run(&flight_key, move || async move {
                match core.store.get_all(kind).await {
                    Ok(serialized) => {
                        let mut items = Vec::with_capacity(serialized.len());
                        for keyed in &serialized {
                            items.push(KeyedItemDescriptor {
                                key: keyed.key.clone(),
                                item: kind
                                    .deserialize_from_store(&keyed.item)
                                    .map_err(StoreError::from)?,
                            });
                        }
                        if let Some(cache) = &core.cache {
                            cache.put_all(kind, items.clone());
                        }
                        Ok(items)
                    }
                    Err(err) => {
                        core.note_unavailable(&err);
                        Err(StoreError::persistent(&err))
                    }
                }
            })
            .await
    }

    async fn upsert(
        self: &Arc<Self>,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let serialized = kind.serialize_item(key, &item)?;
        match self.store.upsert(kind, key, serialized).await {
            Ok(true) => {
                if let Some(cache) = &self.cache {
                    cache.put_item(kind, key, item.clone());
                    if cache.is_infinite() {
                        cache.patch_all(kind, key, item);
                    } else {
                        // The next getAll reloads from the store.
                        cache.invalidate_all(kind);
                    }
                }
                Ok(true)
            }
            Ok(false) => {
                // The store already had a newer version. Whatever we have
                // cached may be stale either way; reload to reconcile.
                if let Some(cache) = &self.cache {
                    cache.invalidate_item(kind, key);
                    cache.invalidate_all(kind);
                    let _ = self.get(kind, key).await;
                }
                Ok(false)
            }
            Err(err) => {
                self.note_unavailable(&err);
                if let Some(cache) = &self.cache
                    && cache.is_infinite()
                {
                    cache.put_item(kind, key, item.clone());
                    cache.patch_all(kind, key, item);
                }
                Err(StoreError::persistent(&err))
            }
        }
    }

    async fn is_initialized(self: &Arc<Self>) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(stamp) = *self.init_checked.lock().expect("lock poisoned")
            && stamp.elapsed() < INIT_CHECK_TTL
        {
            return false;
        }
        if self.store.is_initialized().await {
            self.initialized.store(true, Ordering::SeqCst);
            true
        } else {
            if self.cache.is_some() {
                *self.init_checked.lock().expect("lock poisoned") = Some(Instant::now());
            }
            false
        }
    }

    async fn close(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.poller.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        self.status.close();
        self.store
            .close()
            .await
            .map_err(|err| StoreError::persistent(&err))
    }

    /// Marks the store unavailable and, on the transition, starts the
    /// recovery poller.
    fn note_unavailable(self: &Arc<Self>, err: &anyhow::Error) {
        let transitioned = self.status.update(DataStoreStatus {
            available: false,
            needs_refresh: false,
        });
        if transitioned {
            warn!(
                "persistent store is unavailable, caching updates until it recovers: {:#}",
                err
            );
            self.start_status_poll();
        }
    }

    fn start_status_poll(self: &Arc<Self>) {
        let mut poller = self.poller.lock().expect("lock poisoned");
        if let Some(handle) = &*poller
            && !handle.is_finished()
        {
            return;
        }
        let core = Arc::clone(self);
        *poller = Some(tokio::spawn(core.run_status_poll()));
    }

    async fn run_status_poll(self: Arc<Self>) {
        let mut ticks = tokio::time::interval_at(
            Instant::now() + STATUS_POLL_INTERVAL,
            STATUS_POLL_INTERVAL,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if !self.store.is_store_available().await {
                continue;
            }
            let needs_refresh = match &self.cache {
                Some(cache) if cache.is_infinite() => match self.flush_cache(cache).await {
                    Ok(()) => false,
                    Err(err) => {
                        error!(
                            "persistent store recovered but repopulating it from cache failed: {}",
                            err
                        );
                        continue;
                    }
                },
                // Without a full snapshot on hand, the streaming source has
                // to re-request one.
                _ => true,
            };
            info!("persistent store is available again");
            self.status.update(DataStoreStatus {
                available: true,
                needs_refresh,
            });
            return;
        }
    }

    async fn flush_cache(&self, cache: &StoreCache) -> Result<(), StoreError> {
        let serialized = serialize_all(&cache.snapshot_all())?;
        self.store
            .init(serialized)
            .await
            .map_err(|err| StoreError::persistent(&err))
    }
}

fn serialize_all(all_data: &[Collection]) -> Result<Vec<SerializedCollection>, StoreError> {
    let mut out = Vec::with_capacity(all_data.len());
    for collection in all_data {
        let mut items = Vec::with_capacity(collection.items.len());
        for keyed in &collection.items {
            items.push(KeyedSerializedItemDescriptor {
                key: keyed.key.clone(),
                item: collection.kind.serialize_item(&keyed.key, &keyed.item)?,
            });
        }
        out.push(SerializedCollection {
            kind: collection.kind,
            items,
        });
    }
    Ok(out)
}

/// Coalesces concurrent identical operations: the first caller in runs the
/// work, everyone who arrives while it is in flight receives a clone of the
/// same outcome. If the winner is cancelled mid-flight, one of the waiters
/// takes over.
struct SingleFlight<V> {
    flights: Mutex<BTreeMap<String, watch::Receiver<Option<V>>>>,
}

impl<V: Clone> SingleFlight<V> {
    fn new() -> SingleFlight<V> {
        SingleFlight {
            flights: Mutex::new(BTreeMap::new()),
        }
    }

    async fn run<F, Fut>(&self, key: &str, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        enum Role<V> {
            Winner(watch::Sender<Option<V>>),
            Waiter(watch::Receiver<Option<V>>),
        }

        let mut work = Some(work);
        loop {
            let role = {
                let mut flights = self.flights.lock().expect("lock poisoned");
                match flights.get(key) {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        flights.insert(key.to_string(), rx);
                        Role::Winner(tx)
                    }
                }
            };
            match role {
                Role::Winner(tx) => {
                    // The guard unregisters the flight even if the winning
                    // future is dropped mid-run, so waiters can take over.
                    let _guard = FlightGuard {
                        flights: &self.flights,
                        key,
                    };
                    let work = work.take().expect("winner role is taken at most once");
                    let value = work().await;
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Role::Waiter(mut rx) => loop {
                    let published = rx.borrow().clone();
                    if let Some(value) = published {
                        return value;
                    }
                    if rx.changed().await.is_err() {
                        // Winner vanished without publishing; contend again.
                        break;
                    }
                },
            }
        }
    }
}

struct FlightGuard<'a, V> {
    flights: &'a Mutex<BTreeMap<String, watch::Receiver<Option<V>>>>,
    key: &'a str,
}

impl<V> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        self.flights.lock().expect("lock poisoned").remove(self.key);
    }
}
