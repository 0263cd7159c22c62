// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The polling data source.
//!
//! The fallback when streaming is unavailable: fetch the full snapshot on an
//! interval with a conditional GET. A 304 answer costs next to nothing, so
//! the interval can be reasonably short without hammering anyone. Error
//! handling classifies failures exactly like the streaming source does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::protocol::parse_all_data;
use crate::sink::UpdateSink;
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::transport::{PollResult, PollingRequester};

/// The polling receiver. See the module docs.
pub struct PollingDataSource {
    inner: Arc<PollingInner>,
}

struct PollingInner {
    requester: Arc<dyn PollingRequester>,
    sink: Arc<UpdateSink>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingDataSource {
    pub fn new(
        requester: Arc<dyn PollingRequester>,
        sink: Arc<UpdateSink>,
        poll_interval: Duration,
    ) -> PollingDataSource {
        let (shutdown, _) = watch::channel(false);
        PollingDataSource {
            inner: Arc::new(PollingInner {
                requester,
                sink,
                poll_interval,
                shutdown,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts the poll loop; the first poll happens immediately. The
    /// returned channel resolves on the first successful poll, or when the
    /// source fails permanently.
    pub fn start(&self) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return ready_rx;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run(inner, ready_tx));
        *self.inner.task.lock().expect("lock poisoned") = Some(handle);
        ready_rx
    }

    /// Stops polling and reports [`DataSourceState::Off`]. Idempotent.
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

async fn run(inner: Arc<PollingInner>, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticks = tokio::time::interval(inner.poll_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The validator of the last payload the sink accepted; sent back as
    // If-None-Match so an unchanged snapshot costs a 304.
    let mut etag: Option<String> = None;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticks.tick() => {}
        }
        match inner.requester.request_all(etag.as_deref()).await {
            Ok(PollResult::NotModified) => {
                inner.sink.update_status(DataSourceState::Valid, None);
                signal_ready(&mut ready);
            }
            Ok(PollResult::Fresh {
                body,
                etag: new_etag,
            }) => match parse_all_data(&body) {
                Ok(collections) => {
                    if inner.sink.init(collections).await {
                        etag = new_etag;
                        inner.sink.update_status(DataSourceState::Valid, None);
                        signal_ready(&mut ready);
                    }
                    // On a store failure the sink has already reported
                    // Interrupted; the etag is left alone so the next tick
                    // re-fetches the payload.
                }
                Err(err) => {
                    error!("malformed polling response: {}", err);
                    inner.sink.update_status(
                        DataSourceState::Interrupted,
                        Some(DataSourceErrorInfo::new(
                            DataSourceErrorKind::InvalidData,
                            err.to_string(),
                        )),
                    );
                }
            },
            Err(err) if err.is_recoverable() => {
                warn!("polling request failed, will retry: {}", err);
                inner
                    .sink
                    .update_status(DataSourceState::Interrupted, Some(err.error_info()));
            }
            Err(err) => {
                error!("polling request failed permanently: {}", err);
                inner
                    .sink
                    .update_status(DataSourceState::Off, Some(err.error_info()));
                signal_ready(&mut ready);
                return;
            }
        }
    }
}

fn signal_ready(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = ready.take() {
        let _ = tx.send(());
    }
}
