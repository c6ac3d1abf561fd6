// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Group configuration and the per-log notifications a group emits.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_PARALLEL_BATCHES, DEFAULT_TRIGGER_COUNT, DEFAULT_TRIGGER_INTERVAL};
use crate::error::TransportError;
use crate::log::Log;

/// Why a log will never be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The batch was canceled, e.g. because the channel got disabled.
    Cancelled,
    /// The log was rejected because the channel or its group is disabled.
    Disabled,
    /// The log could not be stored.
    Persistence(String),
    /// The backend rejected the batch with a non-retryable error.
    Transport(TransportError),
}

/// Notification emitted for every log of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// The log is about to be handed to the transport.
    BeforeSend,
    /// The backend acknowledged the batch containing the log.
    Succeeded,
    /// The log was dropped.
    Failed(FailureReason),
}

/// Receives [`GroupEvent`]s. Called from the channel service task, so
/// implementations must not block.
pub trait GroupListener: Send + Sync {
    fn on_event(&self, log: &Log, event: &GroupEvent);
}

impl<F> GroupListener for F
where
    F: Fn(&Log, &GroupEvent) + Send + Sync,
{
    fn on_event(&self, log: &Log, event: &GroupEvent) {
        self(log, event);
    }
}

/// Batching policy of a named group.
#[derive(Clone)]
pub struct GroupConfig {
    pub name: String,
    /// Number of pending logs that triggers a flush, also the batch size.
    pub trigger_count: usize,
    /// Maximum time a pending log waits before a flush is forced.
    pub trigger_interval: Duration,
    pub max_parallel_batches: usize,
    pub listener: Option<Arc<dyn GroupListener>>,
}

impl GroupConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger_count: DEFAULT_TRIGGER_COUNT,
            trigger_interval: DEFAULT_TRIGGER_INTERVAL,
            max_parallel_batches: DEFAULT_MAX_PARALLEL_BATCHES,
            listener: None,
        }
    }

    #[must_use]
    pub fn trigger_count(mut self, trigger_count: usize) -> Self {
        self.trigger_count = trigger_count.max(1);
        self
    }

    #[must_use]
    pub fn trigger_interval(mut self, trigger_interval: Duration) -> Self {
        self.trigger_interval = trigger_interval;
        self
    }

    #[must_use]
    pub fn max_parallel_batches(mut self, max_parallel_batches: usize) -> Self {
        self.max_parallel_batches = max_parallel_batches.max(1);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn GroupListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub(crate) fn notify(&self, log: &Log, event: &GroupEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(log, event);
        }
    }
}

impl Debug for GroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupConfig")
            .field("name", &self.name)
            .field("trigger_count", &self.trigger_count)
            .field("trigger_interval", &self.trigger_interval)
            .field("max_parallel_batches", &self.max_parallel_batches)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}
