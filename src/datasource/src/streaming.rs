// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The streaming data source.
//!
//! Holds one long-lived SSE connection and feeds its events into the
//! [`UpdateSink`]: `put` carries a full snapshot, `patch` and `delete` carry
//! single-item deltas. Failures are classified: service-side and network
//! problems reconnect with jittered exponential backoff, while statuses like
//! 401 shut the source down for good. A data store that fails mid-stream is
//! handled according to whether it can report recovery (see
//! [`consume_stream`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_broadcast::Subscriber;
use beacon_datastore::{DataStoreStatus, DataStoreStatusManager};
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::diagnostics::DiagnosticsRecorder;
use crate::protocol::{parse_delete, parse_patch, parse_put};
use crate::sink::UpdateSink;
use crate::sse::{SseDecoder, SseEvent};
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::transport::{ByteStream, StreamingConnector};

/// Reconnect delays double up to here.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A connection that stays healthy this long earns a backoff reset.
const BACKOFF_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// The service sends keep-alive comments roughly every three minutes; a
/// connection silent for this long is presumed dead.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// The streaming receiver. See the module docs.
pub struct StreamingDataSource {
    inner: Arc<StreamingInner>,
}

struct StreamingInner {
    connector: Arc<dyn StreamingConnector>,
    sink: Arc<UpdateSink>,
    /// Present when the store can report outages and recoveries; drives the
    /// keep-stream-open behavior on store failures.
    store_status: Option<Arc<DataStoreStatusManager>>,
    diagnostics: Arc<DiagnosticsRecorder>,
    initial_reconnect_delay: Duration,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingDataSource {
    pub fn new(
        connector: Arc<dyn StreamingConnector>,
        sink: Arc<UpdateSink>,
        store_status: Option<Arc<DataStoreStatusManager>>,
        diagnostics: Arc<DiagnosticsRecorder>,
        initial_reconnect_delay: Duration,
    ) -> StreamingDataSource {
        let (shutdown, _) = watch::channel(false);
        StreamingDataSource {
            inner: Arc::new(StreamingInner {
                connector,
                sink,
                store_status,
                diagnostics,
                initial_reconnect_delay,
                shutdown,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts the consumer task. The returned channel resolves once the
    /// source has received its first full snapshot, or has failed
    /// permanently; either way, callers blocked on startup get unblocked.
    pub fn start(&self) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        if self.inner.started.swap(true, Ordering::SeqCst) {
            // Already running; dropping the sender unblocks the caller.
            return ready_rx;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run(inner, ready_tx));
        *self.inner.task.lock().expect("lock poisoned") = Some(handle);
        ready_rx
    }

    /// Stops the source and reports [`DataSourceState::Off`]. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.sink.update_status(DataSourceState::Off, None);
        let task = self.inner.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run(inner: Arc<StreamingInner>, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut shutdown = inner.shutdown.subscribe();
    let mut backoff = Backoff::new(inner.initial_reconnect_delay, MAX_RECONNECT_DELAY);
    loop {
        if *shutdown.borrow() {
            return;
        }
        let attempt_time = Utc::now();
        let attempt_started = Instant::now();
        let connected = tokio::select! {
            connected = inner.connector.connect() => connected,
            _ = shutdown.changed() => return,
        };
        match connected {
            Err(err) => {
                inner
                    .diagnostics
                    .record_stream_init(attempt_time, attempt_started.elapsed(), true);
                if err.is_recoverable() {
                    warn!("streaming connection failed, will retry: {}", err);
                    inner
                        .sink
                        .update_status(DataSourceState::Interrupted, Some(err.error_info()));
                    if !sleep_backoff(&mut backoff, &mut shutdown).await {
                        return;
                    }
                } else {
                    error!("streaming connection failed permanently: {}", err);
                    inner
                        .sink
                        .update_status(DataSourceState::Off, Some(err.error_info()));
                    signal_ready(&mut ready);
                    return;
                }
            }
            Ok(stream) => {
                inner
                    .diagnostics
                    .record_stream_init(attempt_time, attempt_started.elapsed(), false);
                let connected_at = Instant::now();
                let outcome = consume_stream(&inner, stream, &mut ready, &mut shutdown).await;
                if connected_at.elapsed() >= BACKOFF_RESET_INTERVAL {
                    backoff.reset();
                }
                match outcome {
                    StreamOutcome::Shutdown => return,
                    StreamOutcome::Restart => {
                        if !sleep_backoff(&mut backoff, &mut shutdown).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum StreamOutcome {
    Shutdown,
    Restart,
}

/// Consumes one open connection until it dies, misbehaves, or the source is
/// closed.
///
/// A store failure on any event splits two ways: if the store can report
/// recovery, the stream stays open and a store-status subscription decides
/// when to restart (a recovery flagged `needs_refresh` means the store lost
/// data, and only a fresh `put` can repair it); if it cannot, the stream
/// restarts immediately.
async fn consume_stream(
    inner: &StreamingInner,
    mut stream: ByteStream,
    ready: &mut Option<oneshot::Sender<()>>,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamOutcome {
    let mut decoder = SseDecoder::new();
    let mut store_sub: Option<Subscriber<DataStoreStatus>> = None;
    loop {
        let watching_store = store_sub.is_some();
        let chunk = tokio::select! {
            _ = shutdown.changed() => return StreamOutcome::Shutdown,
            status = recv_store_status(&mut store_sub), if watching_store => {
                match status {
                    Some(status) if status.available && status.needs_refresh => {
                        warn!("restarting stream to rebuild data store after outage");
                        return StreamOutcome::Restart;
                    }
                    Some(status) if status.available => {
                        // Recovered without data loss; nothing to do.
                        store_sub = None;
                    }
                    Some(_) => {}
                    None => store_sub = None,
                }
                continue;
            }
            read = tokio::time::timeout(READ_TIMEOUT, stream.next()) => match read {
                Err(_) => {
                    warn!("stream silent for {:?}, reconnecting", READ_TIMEOUT);
                    inner.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(DataSourceErrorInfo::new(
                            DataSourceErrorKind::NetworkError,
                            "read timeout elapsed",
                        )),
                    );
                    return StreamOutcome::Restart;
                }
                Ok(None) => {
                    warn!("stream closed by the service, reconnecting");
                    inner.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(DataSourceErrorInfo::new(
                            DataSourceErrorKind::NetworkError,
                            "stream closed unexpectedly",
                        )),
                    );
                    return StreamOutcome::Restart;
                }
                Ok(Some(Err(err))) => {
                    warn!("stream read error, reconnecting: {}", err);
                    inner
                        .sink
                        .update_status(DataSourceState::Interrupted, Some(err.error_info()));
                    return StreamOutcome::Restart;
                }
                Ok(Some(Ok(chunk))) => chunk,
            },
        };
        for event in decoder.feed(&chunk) {
            match handle_event(inner, &event, ready).await {
                EventOutcome::Ok => {}
                EventOutcome::InvalidData(message) => {
                    error!("malformed stream data, restarting stream: {}", message);
                    inner.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(DataSourceErrorInfo::new(
                            DataSourceErrorKind::InvalidData,
                            message,
                        )),
                    );
                    return StreamOutcome::Restart;
                }
                EventOutcome::StoreFailure => match &inner.store_status {
                    Some(manager) => {
                        if store_sub.is_none() {
                            store_sub = Some(manager.subscribe());
                        }
                    }
                    None => {
                        warn!("restarting stream after data store failure");
                        return StreamOutcome::Restart;
                    }
                },
            }
        }
    }
}

enum EventOutcome {
    Ok,
    InvalidData(String),
    StoreFailure,
}

async fn handle_event(
    inner: &StreamingInner,
    event: &SseEvent,
    ready: &mut Option<oneshot::Sender<()>>,
) -> EventOutcome {
    match event.name.as_str() {
        "put" => match parse_put(&event.data) {
            Ok(collections) => {
                if inner.sink.init(collections).await {
                    inner.sink.update_status(DataSourceState::Valid, None);
                    signal_ready(ready);
                    EventOutcome::Ok
                } else {
                    EventOutcome::StoreFailure
                }
            }
            Err(err) => EventOutcome::InvalidData(err.to_string()),
        },
        "patch" => match parse_patch(&event.data) {
            Ok(Some((kind, key, item))) => {
                if inner.sink.upsert(kind, &key, item).await {
                    EventOutcome::Ok
                } else {
                    EventOutcome::StoreFailure
                }
            }
            Ok(None) => EventOutcome::Ok,
            Err(err) => EventOutcome::InvalidData(err.to_string()),
        },
        "delete" => match parse_delete(&event.data) {
            Ok(Some((kind, key, item))) => {
                if inner.sink.upsert(kind, &key, item).await {
                    EventOutcome::Ok
                } else {
                    EventOutcome::StoreFailure
                }
            }
            Ok(None) => EventOutcome::Ok,
            Err(err) => EventOutcome::InvalidData(err.to_string()),
        },
        other => {
            debug!("ignoring unrecognized stream event {:?}", other);
            EventOutcome::Ok
        }
    }
}

async fn recv_store_status(
    sub: &mut Option<Subscriber<DataStoreStatus>>,
) -> Option<DataStoreStatus> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

fn signal_ready(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }
}

/// Sleeps out the next backoff delay; `false` means shutdown arrived first.
async fn sleep_backoff(backoff: &mut Backoff, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Exponential backoff with ±50% jitter.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.max);
        jitter(base)
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

fn jitter(delay: Duration) -> Duration {
    let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return delay;
    }
    let jittered = rand::rng().random_range(0..nanos);
    delay / 2 + Duration::from_nanos(jittered)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use beacon_data_model::{
        Collection, DataKind, FEATURES, ItemDescriptor, KeyedItemDescriptor, SEGMENTS,
    };
    use beacon_datastore::{DataStore, InMemoryDataStore, StoreError};
    use bytes::Bytes;
    use futures::channel::mpsc;

    use super::*;
    use crate::status::DataSourceStatus;
    use crate::transport::TransportError;

    enum ConnectOutcome {
        Fail(TransportError),
        Events(&'static str),
        Channel(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<ConnectOutcome>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedConnector {
        fn push(&self, outcome: ConnectOutcome) {
            self.script.lock().unwrap().push_back(outcome);
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamingConnector for ScriptedConnector {
        async fn connect(&self) -> Result<ByteStream, TransportError> {
            self.attempts.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(ConnectOutcome::Fail(err)) => Err(err),
                Some(ConnectOutcome::Events(text)) => {
                    let chunks = vec![Ok(Bytes::from_static(text.as_bytes()))];
                    Ok(Box::pin(
                        futures::stream::iter(chunks).chain(futures::stream::pending()),
                    ))
                }
                Some(ConnectOutcome::Channel(rx)) => Ok(Box::pin(rx)),
                // Script exhausted: hang, like a connect that never finishes.
                None => std::future::pending().await,
            }
        }
    }

    /// A store whose writes can be made to fail on demand.
    struct FlakyStore {
        inner: InMemoryDataStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> FlakyStore {
            FlakyStore {
                inner: InMemoryDataStore::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Persistent("store down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DataStore for FlakyStore {
        async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.init(all_data).await
        }

        async fn get(&self, kind: DataKind, key: &str) -> Result<ItemDescriptor, StoreError> {
            self.inner.get(kind, key).await
        }

        async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItemDescriptor>, StoreError> {
            self.inner.get_all(kind).await
        }

        async fn upsert(
            &self,
            kind: DataKind,
            key: &str,
            item: ItemDescriptor,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.upsert(kind, key, item).await
        }

        async fn is_initialized(&self) -> bool {
            self.inner.is_initialized().await
        }

        fn is_status_monitoring_enabled(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    const PUT_EVENT: &str = "event: put\ndata: {\"path\":\"/\",\"data\":{\"flags\":{\"my-flag\":{\"key\":\"my-flag\",\"version\":2}},\"segments\":{\"my-segment\":{\"key\":\"my-segment\",\"version\":2}}}}\n\n";

    fn source_over(
        connector: Arc<ScriptedConnector>,
        store: Arc<dyn DataStore>,
        store_status: Option<Arc<DataStoreStatusManager>>,
    ) -> (StreamingDataSource, Arc<UpdateSink>, Arc<DiagnosticsRecorder>) {
        let sink = Arc::new(UpdateSink::new(store, None));
        let diagnostics = Arc::new(DiagnosticsRecorder::new());
        let source = StreamingDataSource::new(
            connector,
            Arc::clone(&sink),
            store_status,
            Arc::clone(&diagnostics),
            Duration::from_secs(1),
        );
        (source, sink, diagnostics)
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

    #[tokio::test(start_paused = true)]
    async fn put_patch_delete_flow_through_to_the_store() {
        let connector = Arc::new(ScriptedConnector::default());
        let (tx, rx) = mpsc::unbounded();
        connector.push(ConnectOutcome::Channel(rx));
        let store: Arc<InMemoryDataStore> = Arc::new(InMemoryDataStore::new());
        let (source, _sink, _) = source_over(Arc::clone(&connector), Arc::clone(&store) as _, None);

        let ready = source.start();
        tx.unbounded_send(Ok(Bytes::from_static(PUT_EVENT.as_bytes())))
            .unwrap();
        ready.await.unwrap();

        assert_eq!(store.get(FEATURES, "my-flag").await.unwrap().version, 2);

        tx.unbounded_send(Ok(Bytes::from_static(
            b"event: patch\ndata: {\"path\":\"/flags/my-flag\",\"data\":{\"key\":\"my-flag\",\"version\":3,\"on\":true}}\n\n",
        )))
        .unwrap();
        eventually(async || store.get(FEATURES, "my-flag").await.unwrap().version == 3).await;

        tx.unbounded_send(Ok(Bytes::from_static(
            b"event: delete\ndata: {\"path\":\"/flags/my-flag\",\"version\":4}\n\n",
        )))
        .unwrap();
        eventually(async || store.get(FEATURES, "my-flag").await.unwrap().version == 4).await;

        let deleted = store.get(FEATURES, "my-flag").await.unwrap();
        assert!(deleted.is_deleted());
        // The unrelated segment is untouched.
        let segment = store.get(SEGMENTS, "my-segment").await.unwrap();
        assert_eq!(segment.version, 2);
        assert!(!segment.is_deleted());

        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_http_error_retries_with_backoff() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push(ConnectOutcome::Fail(TransportError::ErrorResponse(500)));
        connector.push(ConnectOutcome::Events(PUT_EVENT));
        let (source, sink, diagnostics) =
            source_over(Arc::clone(&connector), Arc::new(InMemoryDataStore::new()), None);
        let mut statuses = sink.subscribe_status();

        let ready = source.start();
        ready.await.unwrap();

        // The startup error is reported (remapped to Initializing since the
        // source never got going), then the retry succeeds.
        let first: DataSourceStatus = statuses.recv().await.unwrap();
        assert_eq!(first.state, DataSourceState::Initializing);
        let error = first.last_error.unwrap();
        assert_eq!(error.kind, DataSourceErrorKind::ErrorResponse);
        assert_eq!(error.status_code, Some(500));
        assert_eq!(statuses.recv().await.unwrap().state, DataSourceState::Valid);

        let inits = diagnostics.drain_stream_inits();
        assert_eq!(inits.len(), 2);
        assert!(inits[0].failed);
        assert!(!inits[1].failed);

        // The retry happened within the first backoff window (1s ±50%).
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        let delay = attempts[1] - attempts[0];
        assert!(delay >= Duration::from_millis(500), "{delay:?}");
        assert!(delay <= Duration::from_millis(1500), "{delay:?}");

        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_http_error_shuts_the_source_down() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push(ConnectOutcome::Fail(TransportError::ErrorResponse(401)));
        let (source, sink, _) =
            source_over(Arc::clone(&connector), Arc::new(InMemoryDataStore::new()), None);

        let ready = source.start();
        // The ready signal fires even though there will never be data.
        ready.await.unwrap();

        let status = sink.status();
        assert_eq!(status.state, DataSourceState::Off);
        let error = status.last_error.unwrap();
        assert_eq!(error.kind, DataSourceErrorKind::ErrorResponse);
        assert_eq!(error.status_code, Some(401));

        // No reconnect attempts, even after a long wait.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_put_restarts_the_stream() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push(ConnectOutcome::Events("event: put\ndata: {oops\n\n"));
        connector.push(ConnectOutcome::Events(PUT_EVENT));
        let (source, sink, _) =
            source_over(Arc::clone(&connector), Arc::new(InMemoryDataStore::new()), None);
        let mut statuses = sink.subscribe_status();

        let ready = source.start();
        ready.await.unwrap();

        let first = statuses.recv().await.unwrap();
        assert_eq!(
            first.last_error.unwrap().kind,
            DataSourceErrorKind::InvalidData
        );
        assert_eq!(statuses.recv().await.unwrap().state, DataSourceState::Valid);
        assert_eq!(connector.attempts().len(), 2);

        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_events_and_paths_are_ignored() {
        let connector = Arc::new(ScriptedConnector::default());
        let (tx, rx) = mpsc::unbounded();
        connector.push(ConnectOutcome::Channel(rx));
        let store: Arc<InMemoryDataStore> = Arc::new(InMemoryDataStore::new());
        let (source, _, _) = source_over(Arc::clone(&connector), Arc::clone(&store) as _, None);

        let ready = source.start();
        tx.unbounded_send(Ok(Bytes::from_static(PUT_EVENT.as_bytes())))
            .unwrap();
        ready.await.unwrap();

        tx.unbounded_send(Ok(Bytes::from_static(
            b"event: shrug\ndata: {}\n\nevent: patch\ndata: {\"path\":\"/widgets/w\",\"data\":{\"key\":\"w\",\"version\":1}}\n\nevent: patch\ndata: {\"path\":\"/flags/my-flag\",\"data\":{\"key\":\"my-flag\",\"version\":5}}\n\n",
        )))
        .unwrap();
        eventually(async || store.get(FEATURES, "my-flag").await.unwrap().version == 5).await;

        // Still on the original connection: nothing restarted the stream.
        assert_eq!(connector.attempts().len(), 1);
        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_without_monitoring_restarts_immediately() {
        let connector = Arc::new(ScriptedConnector::default());
        let (tx, rx) = mpsc::unbounded();
        connector.push(ConnectOutcome::Channel(rx));
        connector.push(ConnectOutcome::Events(PUT_EVENT));
        let store = Arc::new(FlakyStore::new());
        let (source, _, _) = source_over(Arc::clone(&connector), Arc::clone(&store) as _, None);

        let ready = source.start();
        tx.unbounded_send(Ok(Bytes::from_static(PUT_EVENT.as_bytes())))
            .unwrap();
        ready.await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        tx.unbounded_send(Ok(Bytes::from_static(
            b"event: patch\ndata: {\"path\":\"/flags/my-flag\",\"data\":{\"key\":\"my-flag\",\"version\":3}}\n\n",
        )))
        .unwrap();

        eventually(async || connector.attempts().len() >= 2).await;
        store.failing.store(false, Ordering::SeqCst);
        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_with_monitoring_waits_for_recovery() {
        let connector = Arc::new(ScriptedConnector::default());
        let (tx, rx) = mpsc::unbounded();
        connector.push(ConnectOutcome::Channel(rx));
        connector.push(ConnectOutcome::Events(PUT_EVENT));
        let store = Arc::new(FlakyStore::new());
        let manager = Arc::new(DataStoreStatusManager::new());
        let (source, sink, _) = source_over(
            Arc::clone(&connector),
            Arc::clone(&store) as _,
            Some(Arc::clone(&manager)),
        );

        let ready = source.start();
        tx.unbounded_send(Ok(Bytes::from_static(PUT_EVENT.as_bytes())))
            .unwrap();
        ready.await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        tx.unbounded_send(Ok(Bytes::from_static(
            b"event: patch\ndata: {\"path\":\"/flags/my-flag\",\"data\":{\"key\":\"my-flag\",\"version\":3}}\n\n",
        )))
        .unwrap();
        // Wait until the failure has been seen (and the store-status
        // subscription is in place).
        eventually(async || {
            sink.status().last_error.map(|e| e.kind) == Some(DataSourceErrorKind::StoreError)
        })
        .await;

        // The stream stays open while the store is down.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts().len(), 1);

        // Store recovers but lost data: the source restarts to get a fresh
        // put.
        store.failing.store(false, Ordering::SeqCst);
        manager.update(DataStoreStatus {
            available: false,
            needs_refresh: false,
        });
        manager.update(DataStoreStatus {
            available: true,
            needs_refresh: true,
        });
        eventually(async || connector.attempts().len() == 2).await;

        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_reports_off() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push(ConnectOutcome::Events(PUT_EVENT));
        let (source, sink, _) =
            source_over(Arc::clone(&connector), Arc::new(InMemoryDataStore::new()), None);

        let ready = source.start();
        ready.await.unwrap();
        source.close().await;
        source.close().await;
        assert_eq!(sink.status().state, DataSourceState::Off);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap_and_jitters() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let expectations = [1u64, 2, 4, 8, 16, 30, 30];
        for base_secs in expectations {
            let delay = backoff.next_delay();
            let base = Duration::from_secs(base_secs);
            assert!(delay >= base / 2, "{delay:?} vs {base:?}");
            assert!(delay <= base + base / 2, "{delay:?} vs {base:?}");
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1500));
    }
}
