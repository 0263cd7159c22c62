// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration of the data system.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_datastore::CacheMode;
use reqwest::header::HeaderMap;

/// Production streaming endpoint.
pub const DEFAULT_STREAM_BASE_URI: &str = "https://stream.beacon-flags.com";

/// Production polling endpoint.
pub const DEFAULT_POLL_BASE_URI: &str = "https://sdk.beacon-flags.com";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_OUTAGE_LOGGING_THRESHOLD: Duration = Duration::from_secs(60);

/// Hook for customizing the HTTP clients the sources build, e.g. to install
/// a proxy or alternate TLS configuration.
pub type HttpClientFactory = Arc<dyn Fn() -> reqwest::ClientBuilder + Send + Sync>;

/// Configures the data-synchronization subsystem.
#[derive(Clone)]
pub struct DataSystemConfig {
    pub stream_base_uri: String,
    pub poll_base_uri: String,
    /// Restricts the payload to one configured environment filter.
    pub payload_filter_key: Option<String>,
    pub poll_interval: Duration,
    /// First reconnect delay after a stream failure; later failures back off
    /// exponentially from here.
    pub initial_reconnect_delay: Duration,
    /// Caching behavior of the persistent-store wrapper, if one is in use.
    pub cache_mode: CacheMode,
    /// How long the source may stay interrupted before one error-level
    /// summary is logged. `None` disables outage logging.
    pub outage_logging_threshold: Option<Duration>,
    /// Headers attached to every request, e.g. `Authorization`.
    pub default_headers: HeaderMap,
    pub http_client_factory: Option<HttpClientFactory>,
}

impl Default for DataSystemConfig {
    fn default() -> DataSystemConfig {
        DataSystemConfig {
            stream_base_uri: DEFAULT_STREAM_BASE_URI.into(),
            poll_base_uri: DEFAULT_POLL_BASE_URI.into(),
            payload_filter_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            cache_mode: CacheMode::Ttl(DEFAULT_CACHE_TTL),
            outage_logging_threshold: Some(DEFAULT_OUTAGE_LOGGING_THRESHOLD),
            default_headers: HeaderMap::new(),
            http_client_factory: None,
        }
    }
}

impl fmt::Debug for DataSystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSystemConfig")
            .field("stream_base_uri", &self.stream_base_uri)
            .field("poll_base_uri", &self.poll_base_uri)
            .field("payload_filter_key", &self.payload_filter_key)
            .field("poll_interval", &self.poll_interval)
            .field("initial_reconnect_delay", &self.initial_reconnect_delay)
            .field("cache_mode", &self.cache_mode)
            .field("outage_logging_threshold", &self.outage_logging_threshold)
            .field("default_headers", &self.default_headers)
            .finish_non_exhaustive()
    }
}

impl DataSystemConfig {
    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        match &self.http_client_factory {
            Some(factory) => factory(),
            None => reqwest::Client::builder(),
        }
    }
}

/// Maps the signed cache-TTL convention of the configuration surface onto
/// [`CacheMode`]: zero disables caching, positive durations expire, negative
/// durations cache forever.
pub fn cache_mode_from_signed_ttl(ttl_ms: i64) -> CacheMode {
    if ttl_ms == 0 {
        CacheMode::Off
    } else if ttl_ms < 0 {
        CacheMode::Infinite
    } else {
        CacheMode::Ttl(Duration::from_millis(ttl_ms as u64))
    }
}
