// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The store contracts.

use async_trait::async_trait;
use beacon_data_model::{
    Collection, DataKind, ItemDescriptor, KeyedItemDescriptor, KeyedSerializedItemDescriptor,
    ModelError, SerializedCollection, SerializedItemDescriptor,
};
use thiserror::Error;

/// An error from a store operation.
///
/// Carries rendered messages rather than source errors so that a single
/// outcome can be shared with every caller coalesced onto one read.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An item could not be (de)serialized.
    #[error("data model: {0}")]
    Model(String),
    /// The underlying persistent store failed.
    #[error("persistent store: {0}")]
    Persistent(String),
}

impl From<ModelError> for StoreError {
    fn from(err: ModelError) -> StoreError {
        StoreError::Model(err.to_string())
    }
}

impl StoreError {
    pub(crate) fn persistent(err: &anyhow::Error) -> StoreError {
        StoreError::Persistent(format!("{:#}", err))
    }
}

/// The store contract the rest of the SDK programs against.
///
/// Writes come only from the update sink; reads come from evaluation code
/// and may be arbitrarily concurrent with writes.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Atomically replaces the entire store contents. Afterwards
    /// [`DataStore::is_initialized`] reports `true`, even for an empty
    /// payload.
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError>;

    /// Returns the descriptor for `(kind, key)`, which may be a tombstone.
    /// Unknown keys return [`ItemDescriptor::NOT_FOUND`], not an error.
    ///
    /// [`ItemDescriptor::NOT_FOUND`]: beacon_data_model::ItemDescriptor::NOT_FOUND
    async fn get(&self, kind: DataKind, key: &str) -> Result<ItemDescriptor, StoreError>;

    /// Returns a snapshot of every item of `kind`, tombstones included.
    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItemDescriptor>, StoreError>;

    /// Inserts or updates an item if `item.version` is newer than what is
    /// stored. Returns whether the store changed.
    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError>;

    /// Whether the store has ever received a full data set.
    async fn is_initialized(&self) -> bool;

    /// Whether this store reports outages through a
    /// [`DataStoreStatusManager`](crate::DataStoreStatusManager).
    fn is_status_monitoring_enabled(&self) -> bool;

    async fn close(&self) -> Result<(), StoreError>;
}

/// The plugin contract for durable stores.
///
/// Implementations provide durable storage and a namespacing scheme (for
/// example, prefixed keys); all caching and (de)serialization is handled by
/// [`PersistentStoreWrapper`](crate::PersistentStoreWrapper). Versions travel
/// out-of-band in [`SerializedItemDescriptor`] so that stores which keep the
/// version in their own metadata need not parse the payload.
#[async_trait]
pub trait PersistentDataStore: Send + Sync {
    /// Atomically (as far as the backend allows) replaces all contents.
    /// Implementations must surface transactional failures instead of
    /// silently continuing.
    async fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), anyhow::Error>;

    /// Reads one item; `None` if absent. Deleted items are returned as
    /// descriptors, not `None`.
    async fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<SerializedItemDescriptor>, anyhow::Error>;

    /// Reads every item of `kind`, deleted items included.
    async fn get_all(
        &self,
        kind: DataKind,
    ) -> Result<Vec<KeyedSerializedItemDescriptor>, anyhow::Error>;

    /// Writes `item` if its version is newer than the stored one. Returns
    /// whether the store changed.
    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItemDescriptor,
    ) -> Result<bool, anyhow::Error>;

    /// Whether this store has ever been initialized, by any process.
    async fn is_initialized(&self) -> bool;

    /// A cheap liveness probe, polled during outages to detect recovery.
    async fn is_store_available(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The health of a persistent data store as observed by the wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// Whether the store is believed reachable.
    pub available: bool,
    /// Set when the store has recovered but its contents may be stale; the
    /// streaming source reacts by re-requesting a full snapshot.
    pub needs_refresh: bool,
}

impl DataStoreStatus {
    pub(crate) const HEALTHY: DataStoreStatus = DataStoreStatus {
        available: true,
        needs_refresh: false,
    };
}
