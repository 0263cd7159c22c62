// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data synchronization for the Beacon SDK.
//!
//! This crate keeps a [`DataStore`](beacon_datastore::DataStore) continuously
//! in sync with the Beacon configuration service and makes the health of
//! that synchronization observable:
//!
//! * [`StreamingDataSource`] holds a long-lived server-sent-events connection
//!   and applies full snapshots (`put`) and deltas (`patch`/`delete`),
//!   reconnecting with jittered exponential backoff on recoverable failures.
//! * [`PollingDataSource`] fetches full snapshots on an interval using
//!   ETag-conditional requests.
//! * [`UpdateSink`] is the choke-point between sources and the store: it
//!   orders snapshots so dependencies land first, tracks which flags are
//!   affected by each update, and broadcasts flag-change and status events.
//! * [`DataSourceStatusProvider`] is the read-side facade applications use
//!   to watch for outages or block until the SDK has data.

mod config;
mod deps;
mod diagnostics;
mod polling;
mod protocol;
mod sink;
mod sort;
mod sse;
mod status;
mod streaming;
mod transport;

pub use config::{
    DEFAULT_CACHE_TTL, DEFAULT_INITIAL_RECONNECT_DELAY, DEFAULT_OUTAGE_LOGGING_THRESHOLD,
    DEFAULT_POLL_BASE_URI, DEFAULT_POLL_INTERVAL, DEFAULT_STREAM_BASE_URI, DataSystemConfig,
    HttpClientFactory, cache_mode_from_signed_ttl,
};
pub use diagnostics::{DiagnosticsRecorder, StreamInit};
pub use polling::PollingDataSource;
pub use sink::{FlagChangeEvent, UpdateSink};
pub use status::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
    DataSourceStatusProvider,
};
pub use streaming::StreamingDataSource;
pub use transport::{
    ByteStream, PollResult, PollingRequester, ReqwestPollingRequester, ReqwestStreamingConnector,
    StreamingConnector, TransportError,
};
