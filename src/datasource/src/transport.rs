// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! HTTP transport for both data sources.
//!
//! The sources are written against the [`StreamingConnector`] and
//! [`PollingRequester`] traits so that tests can script transport behavior;
//! the `Reqwest*` implementations are the real thing. The one footgun this
//! module exists to contain: the streaming client must never carry a total
//! request timeout, or it would kill the long-lived SSE connection on
//! schedule. Only a connect timeout is set there; read inactivity is policed
//! by the source itself.

use std::pin::Pin;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ETAG, HeaderMap, IF_NONE_MATCH};
use thiserror::Error;
use url::Url;

use crate::config::DataSystemConfig;
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total request timeout for polling requests. Streaming requests must not
/// have one.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A transport-level failure from either source.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The service answered with a non-2xx status.
    #[error("HTTP error {0}")]
    ErrorResponse(u16),
    /// The request never completed.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether retrying can help. Service-side and throttling statuses are
    /// worth retrying; client errors like 401 and 404 will not get better.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::ErrorResponse(status) => is_http_error_recoverable(*status),
            TransportError::Network(_) => true,
        }
    }

    pub(crate) fn error_info(&self) -> DataSourceErrorInfo {
        match self {
            TransportError::ErrorResponse(status) => DataSourceErrorInfo::http(*status),
            TransportError::Network(message) => {
                DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, message.clone())
            }
        }
    }
}

pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        400 | 408 | 429 => true,
        s if s >= 500 => true,
        s if (400..500).contains(&s) => false,
        _ => true,
    }
}

/// The raw byte stream of an open SSE connection.
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Opens SSE connections to the streaming endpoint.
#[async_trait]
pub trait StreamingConnector: Send + Sync {
    /// Opens a connection, resolving once response headers are in.
    async fn connect(&self) -> Result<ByteStream, TransportError>;
}

/// The real streaming transport.
pub struct ReqwestStreamingConnector {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl ReqwestStreamingConnector {
    pub fn new(config: &DataSystemConfig) -> Result<ReqwestStreamingConnector, anyhow::Error> {
        let url = endpoint_url(
            &config.stream_base_uri,
            "all",
            config.payload_filter_key.as_deref(),
        )?;
        // No .timeout() here: the connection is expected to live for hours.
        let client = config
            .client_builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(ReqwestStreamingConnector {
            client,
            url,
            headers: config.default_headers.clone(),
        })
    }
}

#[async_trait]
impl StreamingConnector for ReqwestStreamingConnector {
    async fn connect(&self) -> Result<ByteStream, TransportError> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ErrorResponse(status.as_u16()));
        }
        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|err| TransportError::Network(err.to_string()))
        })))
    }
}

/// The outcome of one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollResult {
    /// 304: whatever we got last time is still current.
    NotModified,
    Fresh {
        body: String,
        /// Echoed back on the next request via `If-None-Match`.
        etag: Option<String>,
    },
}

/// Fetches full snapshots from the polling endpoint.
#[async_trait]
pub trait PollingRequester: Send + Sync {
    async fn request_all(&self, etag: Option<&str>) -> Result<PollResult, TransportError>;
}

/// The real polling transport, a conditional GET against
/// `{base}/sdk/latest-all`.
pub struct ReqwestPollingRequester {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl ReqwestPollingRequester {
    pub fn new(config: &DataSystemConfig) -> Result<ReqwestPollingRequester, anyhow::Error> {
        let url = endpoint_url(
            &config.poll_base_uri,
            "sdk/latest-all",
            config.payload_filter_key.as_deref(),
        )?;
        let client = config
            .client_builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(POLL_REQUEST_TIMEOUT)
            .build()?;
        Ok(ReqwestPollingRequester {
            client,
            url,
            headers: config.default_headers.clone(),
        })
    }
}

#[async_trait]
impl PollingRequester for ReqwestPollingRequester {
    async fn request_all(&self, etag: Option<&str>) -> Result<PollResult, TransportError> {
        let mut request = self.client.get(self.url.clone()).headers(self.headers.clone());
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(PollResult::NotModified);
        }
        if !status.is_success() {
            return Err(TransportError::ErrorResponse(status.as_u16()));
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(PollResult::Fresh { body, etag })
    }
}

fn endpoint_url(base: &str, path: &str, filter: Option<&str>) -> Result<Url, anyhow::Error> {
    let mut url = Url::parse(base)?;
    if url.cannot_be_a_base() {
        bail!("cannot use a cannot-be-a-base URL as a service endpoint: {base}");
    }
    url.path_segments_mut()
        .expect("constructor validated URL can be a base")
        .pop_if_empty()
        .extend(path.split('/'));
    if let Some(filter) = filter {
        url.query_pairs_mut().append_pair("filter", filter);
    }
    Ok(url)
}
