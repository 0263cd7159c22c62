// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Stream connection diagnostics.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// One streaming connection attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInit {
    /// When the attempt began.
    pub timestamp: DateTime<Utc>,
    /// How long the attempt took to succeed or fail.
    pub duration: Duration,
    pub failed: bool,
}

/// Accumulates [`StreamInit`] records until an observer drains them.
///
/// The streaming source records one entry per connection attempt; nothing in
/// this crate consumes them, that is left to diagnostic reporting layers.
#[derive(Debug, Default)]
pub struct DiagnosticsRecorder {
    stream_inits: Mutex<Vec<StreamInit>>,
}

impl DiagnosticsRecorder {
    pub fn new() -> DiagnosticsRecorder {
        DiagnosticsRecorder::default()
    }

    pub fn record_stream_init(&self, timestamp: DateTime<Utc>, duration: Duration, failed: bool) {
        self.stream_inits
            .lock()
            .expect("lock poisoned")
            .push(StreamInit {
                timestamp,
                duration,
                failed,
            });
    }

    /// Returns and clears the accumulated records.
    pub fn drain_stream_inits(&self) -> Vec<StreamInit> {
        std::mem::take(&mut *self.stream_inits.lock().expect("lock poisoned"))
    }
}
