// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end wiring of the data system: a streaming source feeding an
//! update sink over a persistent-store wrapper, with a store outage in the
//! middle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_data_model::{
    DataKind, FEATURES, KeyedSerializedItemDescriptor, SerializedCollection,
    SerializedItemDescriptor,
};
use beacon_datasource::{
    ByteStream, DataSourceErrorKind, DataSourceState, DataSourceStatusProvider,
    DiagnosticsRecorder, StreamingConnector, StreamingDataSource, TransportError, UpdateSink,
};
use beacon_datastore::{CacheMode, DataStore, PersistentDataStore, PersistentStoreWrapper};
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;

/// An in-memory stand-in for a database-backed store plugin.
#[derive(Clone, Default)]
struct FakeDatabase {
    state: Arc<Mutex<FakeDatabaseState>>,
}

#[derive(Default)]
struct FakeDatabaseState {
    data: BTreeMap<(DataKind, String), SerializedItemDescriptor>,
    inited: bool,
    failing: bool,
    init_count: usize,
}

impl FakeDatabase {
    fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn version_of(&self, kind: DataKind, key: &str) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .data
            .get(&(kind, key.to_string()))
            .map(|item| item.version)
    }

    fn init_count(&self) -> usize {
        self.state.lock().unwrap().init_count
    }
}

#[async_trait]
impl PersistentDataStore for FakeDatabase {
    async fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        state.init_count += 1;
        if state.failing {
            anyhow::bail!("database down");
        }
        state.data.clear();
        for collection in all_data {
            for item in collection.items {
                state.data.insert((collection.kind, item.key), item.item);
            }
        }
        state.inited = true;
        Ok(())
    }

    async fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<SerializedItemDescriptor>, anyhow::Error> {
        let state = self.state.lock().unwrap();
        if state.failing {
            anyhow::bail!("database down");
        }
        Ok(state.data.get(&(kind, key.to_string())).cloned())
    }

    async fn get_all(
        &self,
        kind: DataKind,
    ) -> Result<Vec<KeyedSerializedItemDescriptor>, anyhow::Error> {
        let state = self.state.lock().unwrap();
        if state.failing {
            anyhow::bail!("database down");
        }
        Ok(state
            .data
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, key), item)| KeyedSerializedItemDescriptor {
                key: key.clone(),
                item: item.clone(),
            })
            .collect())
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItemDescriptor,
    ) -> Result<bool, anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            anyhow::bail!("database down");
        }
        let slot = (kind, key.to_string());
        match state.data.get(&slot) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                state.data.insert(slot, item);
                Ok(true)
            }
        }
    }

    async fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.inited && !state.failing
    }

    async fn is_store_available(&self) -> bool {
        !self.state.lock().unwrap().failing
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

enum ConnectOutcome {
    Events(&'static str),
    Channel(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
}

#[derive(Default)]
struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Mutex<usize>,
}

impl ScriptedConnector {
    fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl StreamingConnector for ScriptedConnector {
    async fn connect(&self) -> Result<ByteStream, TransportError> {
        *self.attempts.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ConnectOutcome::Events(text)) => {
                let chunks = vec![Ok(Bytes::from_static(text.as_bytes()))];
                Ok(Box::pin(
                    futures::stream::iter(chunks).chain(futures::stream::pending()),
                ))
            }
            Some(ConnectOutcome::Channel(rx)) => Ok(Box::pin(rx)),
            None => std::future::pending().await,
        }
    }
}

async fn eventually(mut condition: impl AsyncFnMut() -> bool) {
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

const PUT_V1: &str = "event: put\ndata: {\"path\":\"/\",\"data\":{\"flags\":{\"f\":{\"key\":\"f\",\"version\":1}},\"segments\":{}}}\n\n";
const PATCH_V2: &str = "event: patch\ndata: {\"path\":\"/flags/f\",\"data\":{\"key\":\"f\",\"version\":2}}\n\n";
const PUT_V3: &str = "event: put\ndata: {\"path\":\"/\",\"data\":{\"flags\":{\"f\":{\"key\":\"f\",\"version\":3}},\"segments\":{}}}\n\n";

#[tokio::test(start_paused = true)]
async fn stream_survives_a_persistent_store_outage() {
    let database = FakeDatabase::default();
    let wrapper = PersistentStoreWrapper::new(
        Box::new(database.clone()),
        CacheMode::Ttl(Duration::from_secs(30)),
    );
    let store_status = wrapper.status_manager();
    let store: Arc<dyn DataStore> = Arc::new(wrapper);
    let sink = Arc::new(UpdateSink::new(Arc::clone(&store), None));
    let provider = DataSourceStatusProvider::new(Arc::clone(&sink));

    let connector = Arc::new(ScriptedConnector::default());
    let (tx, rx) = mpsc::unbounded();
    connector
        .script
        .lock()
        .unwrap()
        .push_back(ConnectOutcome::Channel(rx));
    // The reconnect after the outage delivers a fresh snapshot.
    connector
        .script
        .lock()
        .unwrap()
        .push_back(ConnectOutcome::Events(PUT_V3));

    let source = StreamingDataSource::new(
        Arc::clone(&connector) as _,
        Arc::clone(&sink),
        Some(store_status),
        Arc::new(DiagnosticsRecorder::new()),
        Duration::from_secs(1),
    );

    let ready = source.start();
    tx.unbounded_send(Ok(Bytes::from_static(PUT_V1.as_bytes())))
        .unwrap();
    ready.await.unwrap();
    assert!(
        provider
            .wait_for(DataSourceState::Valid, Duration::from_secs(1))
            .await
    );

    // The snapshot reached the durable layer.
    assert_eq!(database.version_of(FEATURES, "f"), Some(1));
    assert_eq!(store.get(FEATURES, "f").await.unwrap().version, 1);

    // Outage: the patch cannot be written.
    database.set_failing(true);
    tx.unbounded_send(Ok(Bytes::from_static(PATCH_V2.as_bytes())))
        .unwrap();
    eventually(async || {
        provider.status().last_error.map(|e| e.kind) == Some(DataSourceErrorKind::StoreError)
    })
    .await;
    // The stream stayed open and the stale value is still served (from
    // cache).
    assert_eq!(connector.attempts(), 1);
    assert_eq!(store.get(FEATURES, "f").await.unwrap().version, 1);

    // Recovery: the wrapper's poller notices, flags needsRefresh, and the
    // source restarts to fetch a fresh snapshot that repairs the store.
    database.set_failing(false);
    eventually(async || database.version_of(FEATURES, "f") == Some(3)).await;
    assert_eq!(connector.attempts(), 2);
    eventually(async || store.get(FEATURES, "f").await.unwrap().version == 3).await;
    assert!(
        provider
            .wait_for(DataSourceState::Valid, Duration::from_secs(1))
            .await
    );

    source.close().await;
    assert_eq!(provider.status().state, DataSourceState::Off);
    // The reconnect re-initialized the durable layer exactly once more.
    assert_eq!(database.init_count(), 2);
}
