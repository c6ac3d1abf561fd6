// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use super::classify::ErrorClassifier;
use super::{CloseSwitch, Transport, TransportRequest, TransportResponse};
use crate::constants::RETRY_INTERVALS;
use crate::error::TransportError;

/// Retries retryable failures of the wrapped transport following a fixed
/// interval table, then reports the last error.
#[derive(Debug)]
pub struct RetryTransport<T> {
    inner: T,
    classifier: ErrorClassifier,
    intervals: Vec<Duration>,
    jitter: bool,
    switch: CloseSwitch,
}

impl<T: Transport> RetryTransport<T> {
    #[must_use]
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            classifier: ErrorClassifier::default(),
            intervals: RETRY_INTERVALS.to_vec(),
            jitter: false,
            switch: CloseSwitch::new(),
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.intervals = intervals;
        self
    }

    /// Spreads each delay uniformly over `[interval / 2, interval]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1`, `None` once the table is exhausted.
    fn delay(&self, attempt: usize, error: &TransportError) -> Option<Duration> {
        let interval = *self.intervals.get(attempt)?;
        if let TransportError::Http {
            retry_after: Some(retry_after),
            ..
        } = error
        {
            return Some(*retry_after);
        }
        if !self.jitter {
            return Some(interval);
        }
        let half = interval / 2;
        let half_ms = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        let spread = rand::thread_rng().gen_range(0..=half_ms);
        Some(half + Duration::from_millis(spread))
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryTransport<T> {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let closed = self.switch.token();
        let mut attempt = 0;
        loop {
            if closed.is_cancelled() {
                return Err(TransportError::Closed);
            }
            let result = tokio::select! {
                biased;
                () = closed.cancelled() => return Err(TransportError::Closed),
                result = self.inner.send(request) => result,
            };
            let error = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if error == TransportError::Closed || !self.classifier.is_retryable(&error) {
                return Err(error);
            }
            let Some(delay) = self.delay(attempt, &error) else {
                warn!(
                    "TRANSPORT | Giving up on batch of group {} after {} attempts: {error}",
                    request.group,
                    attempt + 1
                );
                return Err(error);
            };
            attempt += 1;
            debug!(
                "TRANSPORT | Batch of group {} failed with {error}, retry {attempt} in {delay:?}",
                request.group
            );
            tokio::select! {
                biased;
                () = closed.cancelled() => return Err(TransportError::Closed),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn close(&self) {
        self.switch.close();
        self.inner.close();
    }

    fn reopen(&self) {
        self.inner.reopen();
        self.switch.reopen();
    }
}
