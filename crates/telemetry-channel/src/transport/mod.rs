// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of serialized batches.
//!
//! Transports compose as decorators around a leaf that does the actual I/O:
//!
//! ```text
//!   ConnectivityTransport ──> RetryTransport ──> HttpTransport
//!   (waits for network)       (backoff table)    (POST + zstd)
//! ```
//!
//! A call is canceled by dropping its future or by [`Transport::close`]. A
//! canceled call never completes with an outcome other than
//! [`TransportError::Closed`].

pub mod classify;
pub mod connectivity;
pub mod http;
pub mod retry;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// One serialized batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub group: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub log_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Cancels every queued and in-flight call; later calls fail with
    /// [`TransportError::Closed`] until [`Transport::reopen`].
    fn close(&self) {}

    fn reopen(&self) {}
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        (**self).send(request).await
    }

    fn close(&self) {
        (**self).close();
    }

    fn reopen(&self) {
        (**self).reopen();
    }
}

/// Open/closed switch shared by the decorators.
#[derive(Debug)]
pub(crate) struct CloseSwitch {
    token: Mutex<CancellationToken>,
}

impl CloseSwitch {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token of the current open period. Canceled when the transport closes.
    pub fn token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn close(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    pub fn reopen(&self) {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}
