// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Leaf transport posting batches to the ingestion endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;
use zstd::stream::write::Encoder;

use super::{Transport, TransportRequest, TransportResponse};
use crate::config::ChannelConfig;
use crate::constants::RETRY_AFTER_MS_HEADER;
use crate::error::TransportError;

const APP_SECRET_HEADER: &str = "App-Secret";
const INSTALL_ID_HEADER: &str = "Install-ID";

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    /// zstd level, `None` sends bodies as-is.
    compression_level: Option<i32>,
}

impl HttpTransport {
    pub fn new(config: &ChannelConfig, install_id: Uuid) -> Result<Self, TransportError> {
        let client = build_client(config)?;

        let mut headers = HeaderMap::new();
        headers.insert(APP_SECRET_HEADER, header_value(&config.app_secret)?);
        headers.insert(INSTALL_ID_HEADER, header_value(&install_id.to_string())?);

        Ok(Self {
            client,
            url: config.ingestion_url.clone(),
            headers,
            compression_level: config
                .use_compression
                .then_some(config.compression_level),
        })
    }

    /// Returns the body to send and whether it is compressed.
    fn encode(&self, body: &[u8]) -> (Vec<u8>, bool) {
        let Some(level) = self.compression_level else {
            return (body.to_vec(), false);
        };
        match compress(body, level) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                debug!("TRANSPORT | Failed to compress batch, sending it raw: {e}");
                (body.to_vec(), false)
            }
        }
    }
}

fn build_client(config: &ChannelConfig) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy) = &config.https_proxy {
        match reqwest::Proxy::https(proxy) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => error!(
                "TRANSPORT | Unable to parse proxy configuration: {e}, falling back to direct connection"
            ),
        }
    }

    builder
        .build()
        .map_err(|e| TransportError::InvalidRequest(format!("cannot build HTTP client: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidRequest(format!("invalid header value: {e}")))
}

fn compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

fn classify_reqwest_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER_MS_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let (body, compressed) = self.encode(&request.body);

        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, header_value(&request.content_type)?);
        if compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        debug!(
            "TRANSPORT | Sent {} logs of group {}: {status}",
            request.log_count, request.group
        );
        if status.is_success() {
            return Ok(TransportResponse {
                status: status.as_u16(),
            });
        }
        Err(TransportError::Http {
            status: status.as_u16(),
            retry_after: retry_after(response.headers()),
        })
    }
}
