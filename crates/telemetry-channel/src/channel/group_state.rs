// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use crate::group::{GroupConfig, GroupEvent};
use crate::log::Log;
use crate::persistence::ReservationId;

/// A batch handed to the transport and not yet resolved.
#[derive(Debug)]
pub(crate) struct InFlightBatch {
    pub logs: Vec<Log>,
    pub cancel: CancellationToken,
}

/// Bookkeeping the service keeps for one named group.
#[derive(Debug)]
pub(crate) struct GroupState {
    pub config: GroupConfig,
    /// Logs persisted since the last scheduled flush.
    pub pending: usize,
    /// Set after a recoverable transport failure; no batch leaves until cleared.
    pub suspended: bool,
    pub paused: bool,
    pub paused_target_keys: HashSet<String>,
    pub in_flight: HashMap<ReservationId, InFlightBatch>,
    timer: Option<CancellationToken>,
    timer_generation: u64,
}

impl GroupState {
    pub fn new(config: GroupConfig, pending: usize) -> Self {
        Self {
            config,
            pending,
            suspended: false,
            paused: false,
            paused_target_keys: HashSet::new(),
            in_flight: HashMap::new(),
            timer: None,
            timer_generation: 0,
        }
    }

    /// Whether a new batch may leave right now.
    pub fn can_send(&self) -> bool {
        !self.suspended && !self.paused && self.in_flight.len() < self.config.max_parallel_batches
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Replaces any running timer. Returns the token and generation to hand to
    /// the timer task.
    pub fn arm_timer(&mut self) -> (CancellationToken, u64) {
        self.cancel_timer();
        self.timer_generation += 1;
        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        (token, self.timer_generation)
    }

    /// Consumes a timer expiry. Stale generations are rejected.
    pub fn take_timer(&mut self, generation: u64) -> bool {
        if generation != self.timer_generation || self.timer.is_none() {
            return false;
        }
        self.timer = None;
        true
    }

    pub fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }

    /// Cancels every in-flight call and hands back the batches.
    pub fn cancel_in_flight(&mut self) -> Vec<(ReservationId, InFlightBatch)> {
        self.in_flight
            .drain()
            .map(|(id, batch)| {
                batch.cancel.cancel();
                (id, batch)
            })
            .collect()
    }

    pub fn notify_all<'a>(&self, logs: impl IntoIterator<Item = &'a Log>, event: &GroupEvent) {
        for log in logs {
            self.config.notify(log, event);
        }
    }
}
