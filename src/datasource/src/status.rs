// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data-source status reporting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_broadcast::Subscriber;
use chrono::{DateTime, Utc};

use crate::sink::UpdateSink;

/// The overall health of the data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataSourceState {
    /// Starting up; no data has been received yet. Errors in this state stay
    /// in this state, they do not count as interruptions.
    Initializing,
    /// Connected and receiving updates.
    Valid,
    /// Temporarily unable to receive updates; the last good data is still
    /// being served.
    Interrupted,
    /// Permanently stopped, either by [`close`](crate::StreamingDataSource::close)
    /// or by an unrecoverable error. Terminal.
    Off,
}

/// The closed set of failure categories a data source can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataSourceErrorKind {
    /// Anything that fits no other category, e.g. a malformed base URI.
    Unknown,
    /// An I/O failure talking to the configuration service.
    NetworkError,
    /// A non-2xx HTTP response from the configuration service.
    ErrorResponse,
    /// A malformed event payload or data-model item.
    InvalidData,
    /// The data store rejected an update.
    StoreError,
}

impl DataSourceErrorKind {
    /// The stable name used in logs, e.g. `ERROR_RESPONSE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceErrorKind::Unknown => "UNKNOWN",
            DataSourceErrorKind::NetworkError => "NETWORK_ERROR",
            DataSourceErrorKind::ErrorResponse => "ERROR_RESPONSE",
            DataSourceErrorKind::InvalidData => "INVALID_DATA",
            DataSourceErrorKind::StoreError => "STORE_ERROR",
        }
    }
}

impl fmt::Display for DataSourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of the most recent data-source error.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceErrorInfo {
    pub kind: DataSourceErrorKind,
    /// HTTP status, for [`DataSourceErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl DataSourceErrorInfo {
    pub(crate) fn new(kind: DataSourceErrorKind, message: impl Into<String>) -> DataSourceErrorInfo {
        DataSourceErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub(crate) fn http(status_code: u16) -> DataSourceErrorInfo {
        DataSourceErrorInfo {
            kind: DataSourceErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: format!("HTTP error {}", status_code),
            time: Utc::now(),
        }
    }
}

/// A snapshot of data-source health.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the source entered `state`.
    pub state_since: DateTime<Utc>,
    /// The most recent error, kept across state changes until replaced.
    pub last_error: Option<DataSourceErrorInfo>,
}

/// Read-side facade over the data-source status machinery.
///
/// Applications poll [`status`](DataSourceStatusProvider::status), subscribe
/// for pushes, or block in [`wait_for`](DataSourceStatusProvider::wait_for)
/// during startup.
#[derive(Clone)]
pub struct DataSourceStatusProvider {
    sink: Arc<UpdateSink>,
}

impl DataSourceStatusProvider {
    pub fn new(sink: Arc<UpdateSink>) -> DataSourceStatusProvider {
        DataSourceStatusProvider { sink }
    }

    /// The current status snapshot.
    pub fn status(&self) -> DataSourceStatus {
        self.sink.status()
    }

    /// Attaches a status listener.
    pub fn subscribe(&self) -> Subscriber<DataSourceStatus> {
        self.sink.subscribe_status()
    }

    /// Detaches a status listener and closes its channel.
    pub fn unsubscribe(&self, subscriber: Subscriber<DataSourceStatus>) {
        self.sink.unsubscribe_status(subscriber)
    }

    /// Blocks until the source reaches `desired`, returning `false` if the
    /// terminal [`DataSourceState::Off`] state is reached or `timeout`
    /// expires first.
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> bool {
        self.sink.wait_for(desired, timeout).await
    }
}
