// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The update sink: the single choke-point between data sources and the
//! data store.
//!
//! Every payload a source receives flows through here. The sink orders full
//! data sets so dependencies land first, keeps the flag/segment dependency
//! graph current, works out which flags are affected by each update and
//! broadcasts a [`FlagChangeEvent`] per affected flag, publishes
//! [`DataSourceStatus`] transitions, and escalates prolonged interruptions
//! to one error-level summary via the outage tracker.
//!
//! The sink holds its locks only for bookkeeping; it never holds one across
//! a store call or a broadcast.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_broadcast::{Broadcaster, Subscriber};
use beacon_data_model::{Collection, DataKind, FEATURES, ItemDescriptor};
use beacon_datastore::{DataStore, StoreError};
use chrono::Utc;
use tracing::{error, warn};

use crate::deps::{DependencyTracker, Vertex};
use crate::sort::sort_collections;
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus};

/// Announces that a flag's configuration (or that of something it depends
/// on) changed, so cached evaluations of it are stale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagChangeEvent {
    pub key: String,
}

/// Mediates between data sources and the data store. See the module docs.
pub struct UpdateSink {
    store: Arc<dyn DataStore>,
    status: Mutex<DataSourceStatus>,
    status_broadcaster: Broadcaster<DataSourceStatus>,
    flag_broadcaster: Broadcaster<FlagChangeEvent>,
    deps: Mutex<DependencyTracker>,
    last_store_op_failed: AtomicBool,
    outage: OutageTracker,
}

impl UpdateSink {
    pub fn new(store: Arc<dyn DataStore>, outage_logging_threshold: Option<Duration>) -> UpdateSink {
        UpdateSink {
            store,
            status: Mutex::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            status_broadcaster: Broadcaster::new(),
            flag_broadcaster: Broadcaster::new(),
            deps: Mutex::new(DependencyTracker::new()),
            last_store_op_failed: AtomicBool::new(false),
            outage: OutageTracker::new(outage_logging_threshold),
        }
    }

    /// Replaces the store contents with a full data set. Returns whether the
    /// store accepted it; on failure the source status is set to
    /// `Interrupted` with a [`DataSourceErrorKind::StoreError`].
    pub async fn init(&self, all_data: Vec<Collection>) -> bool {
        // Snapshot the old contents first so changes can be computed, but
        // only if someone is listening; read errors mean "no previous data".
        let old_data = if self.flag_broadcaster.has_listeners() {
            self.snapshot(&all_data).await
        } else {
            None
        };

        let sorted = sort_collections(all_data);
        if let Err(err) = self.store.init(sorted.clone()).await {
            self.note_store_error(&err);
            return false;
        }
        self.note_store_success();

        {
            let mut deps = self.deps.lock().expect("lock poisoned");
            deps.reset();
            for collection in &sorted {
                for keyed in &collection.items {
                    deps.update_dependencies_from(collection.kind, &keyed.key, &keyed.item);
                }
            }
        }

        if let Some(old_data) = old_data {
            self.send_change_events(self.changed_since(&old_data, &sorted));
        }
        true
    }

    /// Applies one delta. Returns whether the store accepted it (a write
    /// that loses the version race still counts as accepted).
    pub async fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let updated = match self.store.upsert(kind, key, item.clone()).await {
            Ok(updated) => updated,
            Err(err) => {
                self.note_store_error(&err);
                return false;
            }
        };
        self.note_store_success();

        if updated {
            let affected = {
                let mut deps = self.deps.lock().expect("lock poisoned");
                deps.update_dependencies_from(kind, key, &item);
                if self.flag_broadcaster.has_listeners() {
                    let mut affected = BTreeSet::new();
                    deps.add_affected(&mut affected, &(kind, key.to_string()));
                    Some(affected)
                } else {
                    None
                }
            };
            if let Some(affected) = affected {
                self.send_change_events(affected);
            }
        }
        true
    }

    /// Publishes a status transition, deduplicating repeats and remapping
    /// startup interruptions back to `Initializing`.
    pub fn update_status(
        &self,
        new_state: DataSourceState,
        new_error: Option<DataSourceErrorInfo>,
    ) {
        let broadcastable = {
            let mut status = self.status.lock().expect("lock poisoned");
            // An error during startup does not make the source Interrupted;
            // it never got going in the first place.
            let effective = if new_state == DataSourceState::Interrupted
                && status.state == DataSourceState::Initializing
            {
                DataSourceState::Initializing
            } else {
                new_state
            };
            if effective == status.state && new_error.is_none() {
                None
            } else {
                if effective != status.state {
                    status.state_since = Utc::now();
                }
                status.state = effective;
                if let Some(error) = &new_error {
                    status.last_error = Some(error.clone());
                }
                Some(status.clone())
            }
        };
        if let Some(status) = broadcastable {
            self.status_broadcaster.broadcast(status);
        }
        // The tracker sees the state as reported, not the remapped one, so
        // outages that begin during startup are still measured.
        self.outage.track(new_state, new_error.as_ref());
    }

    /// The current status snapshot.
    pub fn status(&self) -> DataSourceStatus {
        self.status.lock().expect("lock poisoned").clone()
    }

    pub fn subscribe_status(&self) -> Subscriber<DataSourceStatus> {
        self.status_broadcaster.subscribe()
    }

    pub fn unsubscribe_status(&self, subscriber: Subscriber<DataSourceStatus>) {
        self.status_broadcaster.unsubscribe(subscriber)
    }

    pub fn subscribe_flag_changes(&self) -> Subscriber<FlagChangeEvent> {
        self.flag_broadcaster.subscribe()
    }

    pub fn unsubscribe_flag_changes(&self, subscriber: Subscriber<FlagChangeEvent>) {
        self.flag_broadcaster.unsubscribe(subscriber)
    }

    /// Blocks until the source reaches `desired`; `false` on timeout, on the
    /// terminal `Off` state, or if the sink is closed.
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> bool {
        let mut sub = self.status_broadcaster.subscribe();
        {
            let status = self.status.lock().expect("lock poisoned");
            if status.state == desired {
                self.status_broadcaster.unsubscribe(sub);
                return true;
            }
            if status.state == DataSourceState::Off {
                self.status_broadcaster.unsubscribe(sub);
                return false;
            }
        }
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match sub.recv().await {
                    Some(status) if status.state == desired => return true,
                    Some(status) if status.state == DataSourceState::Off => return false,
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        self.status_broadcaster.unsubscribe(sub);
        outcome
    }

    /// Shuts down event delivery. Status and flag-change listeners are
    /// closed; pending outage timers are cancelled.
    pub fn close(&self) {
        self.outage.cancel();
        self.status_broadcaster.close();
        self.flag_broadcaster.close();
    }

    async fn snapshot(
        &self,
        all_data: &[Collection],
    ) -> Option<BTreeMap<DataKind, BTreeMap<String, i64>>> {
        let mut snapshot = BTreeMap::new();
        for collection in all_data {
            match self.store.get_all(collection.kind).await {
                Ok(items) => {
                    snapshot.insert(
                        collection.kind,
                        items
                            .into_iter()
                            .map(|keyed| (keyed.key, keyed.item.version))
                            .collect(),
                    );
                }
                Err(_) => return None,
            }
        }
        Some(snapshot)
    }

    /// Everything whose version changed between `old_data` and `new_data`,
    /// expanded through the reverse dependency edges.
    fn changed_since(
        &self,
        old_data: &BTreeMap<DataKind, BTreeMap<String, i64>>,
        new_data: &[Collection],
    ) -> BTreeSet<Vertex> {
        let mut new_versions: BTreeMap<DataKind, BTreeMap<&str, i64>> = BTreeMap::new();
        for collection in new_data {
            let versions = new_versions.entry(collection.kind).or_default();
            for keyed in &collection.items {
                versions.insert(&keyed.key, keyed.item.version);
            }
        }

        let mut affected = BTreeSet::new();
        let deps = self.deps.lock().expect("lock poisoned");
        let empty = BTreeMap::new();
        let kinds: BTreeSet<DataKind> = old_data
            .keys()
            .copied()
            .chain(new_versions.keys().copied())
            .collect();
        for kind in kinds {
            let old = old_data.get(&kind).unwrap_or(&empty);
            let new = new_versions.get(&kind);
            for (key, old_version) in old {
                match new.and_then(|n| n.get(key.as_str())) {
                    Some(new_version) if new_version == old_version => {}
                    // Changed or removed.
                    _ => deps.add_affected(&mut affected, &(kind, key.clone())),
                }
            }
            if let Some(new) = new {
                for key in new.keys() {
                    if !old.contains_key(*key) {
                        deps.add_affected(&mut affected, &(kind, key.to_string()));
                    }
                }
            }
        }
        affected
    }

    fn send_change_events(&self, affected: BTreeSet<Vertex>) {
        for (kind, key) in affected {
            // Segment changes propagate to the flags that reference them but
            // do not produce events of their own.
            if kind == FEATURES {
                self.flag_broadcaster.broadcast(FlagChangeEvent { key });
            }
        }
    }

    fn note_store_error(&self, err: &StoreError) {
        // Log the transition into failure, not every repeat.
        if !self.last_store_op_failed.swap(true, Ordering::SeqCst) {
            warn!("failed to update data store: {}", err);
        }
        self.update_status(
            DataSourceState::Interrupted,
            Some(DataSourceErrorInfo::new(
                DataSourceErrorKind::StoreError,
                err.to_string(),
            )),
        );
    }

    fn note_store_success(&self) {
        self.last_store_op_failed.store(false, Ordering::SeqCst);
    }
}

/// Measures how long the source has been interrupted and, once a configured
/// threshold is crossed, logs one error-level summary of every error seen
/// during the outage.
struct OutageTracker {
    threshold: Option<Duration>,
    state: Arc<Mutex<OutageState>>,
}

type ErrorKey = (DataSourceErrorKind, Option<u16>);

#[derive(Default)]
struct OutageState {
    in_outage: bool,
    /// Bumped whenever an outage starts or ends; a timer only fires if the
    /// outage it was armed for is still the current one.
    epoch: u64,
    errors: BTreeMap<ErrorKey, usize>,
}

impl OutageTracker {
    fn new(threshold: Option<Duration>) -> OutageTracker {
        OutageTracker {
            threshold,
            state: Arc::new(Mutex::new(OutageState::default())),
        }
    }

    fn track(&self, state: DataSourceState, error: Option<&DataSourceErrorInfo>) {
        let Some(threshold) = self.threshold else {
            return;
        };
        let mut outage = self.state.lock().expect("lock poisoned");
        if state == DataSourceState::Interrupted {
            if !outage.in_outage {
                outage.in_outage = true;
                outage.epoch += 1;
                outage.errors.clear();
                let epoch = outage.epoch;
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    tokio::time::sleep(threshold).await;
                    let outage = state.lock().expect("lock poisoned");
                    if outage.in_outage && outage.epoch == epoch {
                        error!("{}", outage_message(threshold, &outage.errors));
                    }
                });
            }
            if let Some(error) = error {
                *outage
                    .errors
                    .entry((error.kind, error.status_code))
                    .or_insert(0) += 1;
            }
        } else if outage.in_outage {
            outage.in_outage = false;
            outage.epoch += 1;
        }
    }

    fn cancel(&self) {
        let mut outage = self.state.lock().expect("lock poisoned");
        outage.in_outage = false;
        outage.epoch += 1;
    }
}

fn outage_message(threshold: Duration, errors: &BTreeMap<ErrorKey, usize>) -> String {
    let descriptions: Vec<String> = errors
        .iter()
        .map(|((kind, status_code), count)| {
            let name = match status_code {
                Some(code) => format!("{}({})", kind, code),
                None => kind.to_string(),
            };
            let times = if *count == 1 { "time" } else { "times" };
            format!("{} ({} {})", name, count, times)
        })
        .collect();
    format!(
        "Data source outage - updates have been unavailable for at least {} with the following errors: {}",
        humantime::format_duration(threshold),
        descriptions.join(", ")
    )
}
