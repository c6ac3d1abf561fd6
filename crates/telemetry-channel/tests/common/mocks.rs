// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transport for driving the channel without a network

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use telemetry_channel::error::TransportError;
use telemetry_channel::log::{Log, LogContainer};
use telemetry_channel::transport::{Transport, TransportRequest, TransportResponse};

/// Replays scripted outcomes, then answers 200. Records every decoded batch.
#[derive(Debug, Default)]
pub struct MockTransport {
    outcomes: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    latency: Duration,
    calls: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batches: Mutex<Vec<Vec<Log>>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(outcomes: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sends that ran to completion, as opposed to being dropped mid-flight.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<Log>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn sent_logs(&self) -> Vec<Log> {
        self.batches().into_iter().flatten().collect()
    }
}

pub fn http_error(status: u16) -> TransportError {
    TransportError::Http {
        status,
        retry_after: None,
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let container: LogContainer = serde_json::from_slice(&request.body)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        self.batches.lock().unwrap().push(container.logs);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TransportResponse { status: 200 }))
    }
}
