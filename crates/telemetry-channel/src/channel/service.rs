// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::group_state::{GroupState, InFlightBatch};
use super::{ChannelCommand, ChannelHandle, ListenerId};
use crate::constants::{CLEAR_BATCH_SIZE, DEFAULT_SHUTDOWN_TIMEOUT, GROUP_SPAN};
use crate::device::{Device, DeviceInfoProvider};
use crate::error::{ChannelError, TransportError};
use crate::group::{FailureReason, GroupConfig, GroupEvent};
use crate::listener::{ChannelListener, PrecedingLog};
use crate::log::{apply_offset, target_key, Log, LogContainer};
use crate::network::NetworkStateMonitor;
use crate::persistence::{Persistence, ReservationId};
use crate::serializer::{JsonLogSerializer, LogSerializer};
use crate::transport::classify::ErrorClassifier;
use crate::transport::{Transport, TransportRequest, TransportResponse};

/// Owns groups, persistence and in-flight batches. Spawn [`ChannelService::run`]
/// and talk to it through the [`ChannelHandle`] returned by
/// [`ChannelService::new`].
pub struct ChannelService {
    rx: mpsc::UnboundedReceiver<ChannelCommand>,
    tx: mpsc::WeakUnboundedSender<ChannelCommand>,
    persistence: Box<dyn Persistence>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn LogSerializer>,
    classifier: ErrorClassifier,
    device_info: Option<Arc<dyn DeviceInfoProvider>>,
    device_cache: Option<Device>,
    network: Option<watch::Receiver<bool>>,
    groups: HashMap<String, GroupState>,
    listeners: Vec<(ListenerId, Arc<dyn ChannelListener>)>,
    next_listener_id: u64,
    enabled: bool,
    /// Bumped on every enable/disable; completions from older epochs are dropped.
    epoch: u64,
    clock_offset_millis: i64,
    shutdown_timeout: Duration,
}

impl ChannelService {
    #[must_use]
    pub fn new(
        persistence: Box<dyn Persistence>,
        transport: Arc<dyn Transport>,
    ) -> (Self, ChannelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            rx,
            tx: tx.downgrade(),
            persistence,
            transport,
            serializer: Arc::new(JsonLogSerializer),
            classifier: ErrorClassifier::default(),
            device_info: None,
            device_cache: None,
            network: None,
            groups: HashMap::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            enabled: true,
            epoch: 0,
            clock_offset_millis: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        };
        (service, ChannelHandle::new(tx))
    }

    /// Encoding of batch bodies. Should match the one used by persistence.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn LogSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Decides which transport failures suspend the group and which drop the batch.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_device_info(mut self, provider: Arc<dyn DeviceInfoProvider>) -> Self {
        self.device_info = Some(provider);
        self
    }

    /// Resumes suspended groups whenever the network comes back.
    #[must_use]
    pub fn with_network(mut self, monitor: &NetworkStateMonitor) -> Self {
        self.network = Some(monitor.subscribe());
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub async fn run(mut self) {
        debug!("CHANNEL | Service started");

        loop {
            let command = tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                connected = network_change(&mut self.network) => {
                    self.on_network_change(connected).await;
                    continue;
                }
            };

            if let ChannelCommand::Shutdown(response_tx) = command {
                let result = self.shutdown().await;
                if response_tx.send(result).is_err() {
                    debug!("CHANNEL | Shutdown requester went away");
                }
                break;
            }
            let span = match command.group() {
                Some(group) => info_span!(GROUP_SPAN, name = %group),
                None => Span::none(),
            };
            self.handle(command).instrument(span).await;
        }

        debug!("CHANNEL | Service stopped");
    }

    async fn handle(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::AddGroup(config, response_tx) => {
                let result = self.add_group(config).await;
                reply(response_tx, result);
            }
            ChannelCommand::RemoveGroup(group, response_tx) => {
                self.remove_group(&group);
                reply(response_tx, ());
            }
            ChannelCommand::Enqueue { log, group } => self.enqueue(log, &group).await,
            ChannelCommand::Flush(group, response_tx) => {
                let result = self.manual_flush(&group).await;
                reply(response_tx, result);
            }
            ChannelCommand::SetEnabled(enabled, response_tx) => {
                let result = self.set_enabled(enabled).await;
                reply(response_tx, result);
            }
            ChannelCommand::IsEnabled(response_tx) => reply(response_tx, self.enabled),
            ChannelCommand::Clear(group, response_tx) => {
                let result = self.clear(&group).await;
                reply(response_tx, result);
            }
            ChannelCommand::Pause {
                group,
                target_token,
                response_tx,
            } => {
                let result = self.pause(&group, target_token.as_deref());
                reply(response_tx, result);
            }
            ChannelCommand::Resume {
                group,
                target_token,
                response_tx,
            } => {
                let result = self.resume(&group, target_token.as_deref()).await;
                reply(response_tx, result);
            }
            ChannelCommand::AddListener(listener, response_tx) => {
                self.next_listener_id += 1;
                let id = ListenerId::new(self.next_listener_id);
                self.listeners.push((id, listener));
                reply(response_tx, id);
            }
            ChannelCommand::RemoveListener(id) => {
                self.listeners.retain(|(existing, _)| *existing != id);
            }
            ChannelCommand::SetMaxStorageSize(max_bytes, response_tx) => {
                let result = self
                    .persistence
                    .set_max_storage_size(max_bytes)
                    .await
                    .map_err(ChannelError::from);
                self.recount_evicted().await;
                reply(response_tx, result);
            }
            ChannelCommand::SetClockOffset(offset) => self.clock_offset_millis = offset,
            ChannelCommand::InvalidateDeviceCache => self.device_cache = None,
            ChannelCommand::PendingCount(group, response_tx) => {
                reply(response_tx, self.groups.get(&group).map(|s| s.pending));
            }
            ChannelCommand::TimerFired { group, generation } => {
                self.on_timer(&group, generation).await;
            }
            ChannelCommand::BatchCompleted {
                group,
                reservation,
                epoch,
                result,
            } => self.on_completed(&group, reservation, epoch, result).await,
            ChannelCommand::Shutdown(_) => {}
        }
    }

    async fn add_group(&mut self, config: GroupConfig) -> Result<(), ChannelError> {
        let name = config.name.clone();
        if let Some(state) = self.groups.get_mut(&name) {
            debug!("CHANNEL | Updating configuration of group {name}");
            state.config = config;
            self.arm_timer(&name);
            self.check_pending(&name).await;
            return Ok(());
        }

        let pending = self.persistence.count_logs(&name).await?;
        debug!("CHANNEL | Adding group {name} with {pending} pending logs");
        self.groups.insert(name.clone(), GroupState::new(config, pending));
        for (_, listener) in &self.listeners {
            listener.on_group_added(&name);
        }
        self.arm_timer(&name);
        self.check_pending(&name).await;
        Ok(())
    }

    fn remove_group(&mut self, name: &str) {
        let Some(mut state) = self.groups.remove(name) else {
            return;
        };
        debug!("CHANNEL | Removing group {name}");
        state.cancel_timer();
        for (reservation, _) in state.cancel_in_flight() {
            self.persistence.release_logs(name, &reservation);
        }
        for (_, listener) in &self.listeners {
            listener.on_group_removed(name);
        }
    }

    async fn enqueue(&mut self, mut log: Log, group: &str) {
        let Some(state) = self.groups.get(group) else {
            warn!("CHANNEL | Dropping log for unknown group {group}");
            return;
        };

        if !self.enabled {
            warn!("CHANNEL | Channel is disabled, dropping log for group {group}");
            state.config.notify(&log, &GroupEvent::BeforeSend);
            state
                .config
                .notify(&log, &GroupEvent::Failed(FailureReason::Disabled));
            return;
        }

        let assigned_timestamp = self.complete(&mut log);

        // Listeners see device time; the server offset only corrects timestamps
        // the channel assigned itself.
        let mut preceding = Vec::new();
        for (_, listener) in &self.listeners {
            preceding.extend(listener.on_preparing_log(&mut log, group));
        }
        for PrecedingLog {
            group: target,
            log: mut extra,
        } in preceding
        {
            if !self.groups.contains_key(&target) {
                warn!("CHANNEL | Dropping preceding log for unknown group {target}");
                continue;
            }
            let assigned = self.complete(&mut extra);
            self.store(extra, &target, assigned).await;
        }
        self.store(log, group, assigned_timestamp).await;
    }

    /// Fills in id, timestamp and device. Returns whether the timestamp was
    /// assigned here.
    fn complete(&mut self, log: &mut Log) -> bool {
        if log.id.is_none() {
            log.id = Some(Uuid::new_v4());
        }
        let assigned_timestamp = log.timestamp.is_none();
        if assigned_timestamp {
            log.timestamp = Some(SystemTime::now());
        }
        if log.device.is_none() {
            log.device = self.device();
        }
        assigned_timestamp
    }

    async fn store(&mut self, mut log: Log, group: &str, assigned_timestamp: bool) {
        if assigned_timestamp && self.clock_offset_millis != 0 {
            log.timestamp = log
                .timestamp
                .map(|t| apply_offset(t, self.clock_offset_millis));
        }

        if self.listeners.iter().any(|(_, l)| l.should_filter(&log)) {
            debug!("CHANNEL | Log of type {} filtered out", log.log_type);
            return;
        }

        if let Err(e) = self.persistence.put_log(group, &log).await {
            error!("CHANNEL | Failed to persist log for group {group}: {e}");
            if let Some(state) = self.groups.get(group) {
                state.config.notify(
                    &log,
                    &GroupEvent::Failed(FailureReason::Persistence(e.to_string())),
                );
            }
            return;
        }
        if let Some(state) = self.groups.get_mut(group) {
            state.pending += 1;
        }
        self.recount_evicted().await;

        let Some(state) = self.groups.get(group) else {
            return;
        };
        let trigger = state.pending >= state.config.trigger_count;
        let needs_timer = !state.has_timer();
        if trigger {
            self.schedule_flush(group).await;
        } else if needs_timer {
            self.arm_timer(group);
        }
    }

    /// Caps the counters of groups that lost logs to eviction at what is
    /// still stored for them.
    async fn recount_evicted(&mut self) {
        for group in self.persistence.take_evicted_groups() {
            if !self.groups.contains_key(&group) {
                continue;
            }
            match self.persistence.count_logs(&group).await {
                Ok(stored) => {
                    if let Some(state) = self.groups.get_mut(&group) {
                        state.pending = state.pending.min(stored);
                    }
                }
                Err(e) => error!("CHANNEL | Failed to recount group {group}: {e}"),
            }
        }
    }

    fn device(&mut self) -> Option<Device> {
        if self.device_cache.is_none() {
            let provider = self.device_info.as_ref()?;
            match provider.device() {
                Ok(device) => self.device_cache = Some(device),
                Err(e) => {
                    warn!("CHANNEL | Device information unavailable: {e}");
                    return None;
                }
            }
        }
        self.device_cache.clone()
    }

    /// Flushes a group whose counter reached its threshold, or arms its timer.
    async fn check_pending(&mut self, group: &str) {
        let Some(state) = self.groups.get(group) else {
            return;
        };
        if state.pending >= state.config.trigger_count {
            self.schedule_flush(group).await;
        } else if state.pending > 0 && !state.has_timer() {
            self.arm_timer(group);
        }
    }

    async fn schedule_flush(&mut self, group: &str) {
        if let Some(state) = self.groups.get_mut(group) {
            state.pending = 0;
            state.cancel_timer();
        }
        if let Err(e) = self.flush(group).await {
            error!("CHANNEL | Failed to flush group {group}: {e}");
        }
    }

    async fn manual_flush(&mut self, group: &str) -> Result<(), ChannelError> {
        let Some(state) = self.groups.get_mut(group) else {
            return Err(ChannelError::UnknownGroup(group.to_string()));
        };
        state.pending = 0;
        state.cancel_timer();
        self.flush(group).await
    }

    /// Reserves one batch and hands it to the transport, if allowed.
    async fn flush(&mut self, group: &str) -> Result<(), ChannelError> {
        if !self.enabled {
            debug!("CHANNEL | Channel is disabled, not flushing group {group}");
            return Ok(());
        }
        let Some(state) = self.groups.get(group) else {
            return Ok(());
        };
        if !state.can_send() {
            debug!(
                "CHANNEL | Deferring flush of group {group} (in flight: {}, suspended: {}, paused: {})",
                state.in_flight.len(),
                state.suspended,
                state.paused
            );
            return Ok(());
        }

        let mut logs = Vec::new();
        let Some(reservation) = self
            .persistence
            .get_logs(
                group,
                &state.paused_target_keys,
                state.config.trigger_count,
                &mut logs,
            )
            .await?
        else {
            return Ok(());
        };

        let container = LogContainer { logs };
        let body = match self.serializer.serialize_container(&container) {
            Ok(body) => body,
            Err(e) => {
                error!("CHANNEL | Cannot serialize batch of group {group}, dropping it: {e}");
                self.persistence.delete_logs(group, &reservation).await?;
                if let Some(state) = self.groups.get(group) {
                    let reason = FailureReason::Transport(TransportError::InvalidRequest(
                        e.to_string(),
                    ));
                    state.notify_all(&container.logs, &GroupEvent::Failed(reason));
                }
                return Ok(());
            }
        };

        let Some(state) = self.groups.get_mut(group) else {
            return Ok(());
        };
        state.notify_all(&container.logs, &GroupEvent::BeforeSend);

        let request = TransportRequest {
            group: group.to_string(),
            body,
            content_type: self.serializer.content_type().to_string(),
            log_count: container.logs.len(),
        };
        debug!(
            "CHANNEL | Sending batch {reservation} of {} logs for group {group}",
            request.log_count
        );

        let cancel = CancellationToken::new();
        state.in_flight.insert(
            reservation,
            InFlightBatch {
                logs: container.logs,
                cancel: cancel.clone(),
            },
        );

        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = transport.send(&request) => result,
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(ChannelCommand::BatchCompleted {
                    group: request.group,
                    reservation,
                    epoch,
                    result,
                });
            }
        });
        Ok(())
    }

    async fn on_completed(
        &mut self,
        group: &str,
        reservation: ReservationId,
        epoch: u64,
        result: Result<TransportResponse, TransportError>,
    ) {
        if epoch != self.epoch {
            debug!("CHANNEL | Ignoring completion of batch {reservation} from a previous epoch");
            return;
        }
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        let Some(batch) = state.in_flight.remove(&reservation) else {
            return;
        };

        match result {
            Ok(response) => {
                debug!(
                    "CHANNEL | Batch {reservation} of group {group} delivered ({})",
                    response.status
                );
                if let Err(e) = self.persistence.delete_logs(group, &reservation).await {
                    error!("CHANNEL | Failed to delete delivered batch {reservation}: {e}");
                }
                if let Some(state) = self.groups.get(group) {
                    state.notify_all(&batch.logs, &GroupEvent::Succeeded);
                }
                if let Err(e) = self.flush(group).await {
                    error!("CHANNEL | Failed to flush group {group}: {e}");
                }
            }
            Err(TransportError::Closed) => {
                self.persistence.release_logs(group, &reservation);
            }
            Err(e) if self.classifier.is_retryable(&e) => {
                warn!(
                    "CHANNEL | Batch {reservation} of group {group} failed ({e}), suspending the group"
                );
                self.persistence.release_logs(group, &reservation);
                state.suspended = true;
                state.pending += batch.logs.len();
            }
            Err(e) => {
                error!(
                    "CHANNEL | Batch {reservation} of group {group} rejected ({e}), dropping {} logs",
                    batch.logs.len()
                );
                if let Err(e) = self.persistence.delete_logs(group, &reservation).await {
                    error!("CHANNEL | Failed to delete rejected batch {reservation}: {e}");
                }
                if let Some(state) = self.groups.get(group) {
                    state.notify_all(
                        &batch.logs,
                        &GroupEvent::Failed(FailureReason::Transport(e)),
                    );
                }
                self.check_pending(group).await;
            }
        }
    }

    fn arm_timer(&mut self, group: &str) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        let interval = state.config.trigger_interval;
        let (token, generation) = state.arm_timer();
        let tx = self.tx.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(interval) => {
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(ChannelCommand::TimerFired { group, generation });
                    }
                }
            }
        });
    }

    async fn on_timer(&mut self, group: &str, generation: u64) {
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        if !state.take_timer(generation) {
            return;
        }
        if state.pending > 0 {
            debug!(
                "CHANNEL | Trigger interval elapsed for group {group} with {} pending logs",
                state.pending
            );
            self.schedule_flush(group).await;
        }
    }

    async fn set_enabled(&mut self, enabled: bool) -> Result<(), ChannelError> {
        if self.enabled == enabled {
            if enabled {
                self.resume_suspended("Channel enabled").await;
            }
            return Ok(());
        }
        self.enabled = enabled;
        self.epoch += 1;

        if enabled {
            info!("CHANNEL | Channel enabled");
            self.transport.reopen();
            let names: Vec<String> = self.groups.keys().cloned().collect();
            for name in &names {
                let pending = self.persistence.count_logs(name).await?;
                if let Some(state) = self.groups.get_mut(name) {
                    state.suspended = false;
                    state.pending = pending;
                }
                self.check_pending(name).await;
            }
        } else {
            info!("CHANNEL | Channel disabled, discarding pending logs");
            self.transport.close();
            let cancelled = FailureReason::Cancelled;
            let names: Vec<String> = self.groups.keys().cloned().collect();
            for name in &names {
                let Some(state) = self.groups.get_mut(name) else {
                    continue;
                };
                state.cancel_timer();
                state.pending = 0;
                state.suspended = false;
                let batches = state.cancel_in_flight();
                for (reservation, batch) in batches {
                    if let Some(state) = self.groups.get(name) {
                        state.notify_all(&batch.logs, &GroupEvent::Failed(cancelled.clone()));
                    }
                    self.persistence.delete_logs(name, &reservation).await?;
                }
                self.discard_stored(name).await?;
            }
            self.persistence.clear_all().await?;
        }

        for (_, listener) in &self.listeners {
            listener.on_globally_enabled(enabled);
        }
        Ok(())
    }

    /// Deletes the stored logs of a group, notifying its listener for each one.
    async fn discard_stored(&mut self, group: &str) -> Result<(), ChannelError> {
        let has_listener = self
            .groups
            .get(group)
            .is_some_and(|s| s.config.listener.is_some());
        if !has_listener {
            self.persistence.clear_group(group).await?;
            return Ok(());
        }

        let all_targets = HashSet::new();
        loop {
            let mut logs = Vec::new();
            let Some(reservation) = self
                .persistence
                .get_logs(group, &all_targets, CLEAR_BATCH_SIZE, &mut logs)
                .await?
            else {
                return Ok(());
            };
            if let Some(state) = self.groups.get(group) {
                state.notify_all(&logs, &GroupEvent::Failed(FailureReason::Cancelled));
            }
            self.persistence.delete_logs(group, &reservation).await?;
        }
    }

    async fn clear(&mut self, group: &str) -> Result<usize, ChannelError> {
        let deleted = self.persistence.clear_group(group).await?;
        if let Some(state) = self.groups.get_mut(group) {
            state.pending = 0;
        }
        for (_, listener) in &self.listeners {
            listener.on_clear(group);
        }
        debug!("CHANNEL | Cleared {deleted} logs of group {group}");
        Ok(deleted)
    }

    fn pause(&mut self, group: &str, target_token: Option<&str>) -> Result<(), ChannelError> {
        let Some(state) = self.groups.get_mut(group) else {
            return Err(ChannelError::UnknownGroup(group.to_string()));
        };
        match target_token {
            Some(token) => {
                state.paused_target_keys.insert(target_key(token).to_string());
            }
            None => state.paused = true,
        }
        debug!("CHANNEL | Paused group {group}");
        for (_, listener) in &self.listeners {
            listener.on_paused(group, target_token);
        }
        Ok(())
    }

    async fn resume(&mut self, group: &str, target_token: Option<&str>) -> Result<(), ChannelError> {
        let Some(state) = self.groups.get_mut(group) else {
            return Err(ChannelError::UnknownGroup(group.to_string()));
        };
        match target_token {
            Some(token) => {
                state.paused_target_keys.remove(target_key(token));
            }
            None => {
                state.paused = false;
                state.suspended = false;
            }
        }
        debug!("CHANNEL | Resumed group {group}");
        for (_, listener) in &self.listeners {
            listener.on_resumed(group, target_token);
        }
        self.recount_and_flush(group).await
    }

    async fn recount_and_flush(&mut self, group: &str) -> Result<(), ChannelError> {
        let pending = self.persistence.count_logs(group).await?;
        if let Some(state) = self.groups.get_mut(group) {
            state.pending = pending;
        }
        if pending > 0 {
            self.schedule_flush(group).await;
        }
        Ok(())
    }

    async fn on_network_change(&mut self, connected: bool) {
        if !connected || !self.enabled {
            return;
        }
        self.resume_suspended("Network is back").await;
    }

    /// Clears the suspension of every suspended group and flushes what it holds.
    async fn resume_suspended(&mut self, cause: &str) {
        let suspended: Vec<String> = self
            .groups
            .iter_mut()
            .filter(|(_, state)| state.suspended)
            .map(|(name, state)| {
                state.suspended = false;
                name.clone()
            })
            .collect();
        for group in suspended {
            info!("CHANNEL | {cause}, resuming group {group}");
            if let Err(e) = self.recount_and_flush(&group).await {
                error!("CHANNEL | Failed to resume group {group}: {e}");
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), ChannelError> {
        info!("CHANNEL | Shutting down");
        let timeout = self.shutdown_timeout;
        let drain = async {
            for (name, state) in &mut self.groups {
                state.cancel_timer();
                for (reservation, _) in state.cancel_in_flight() {
                    self.persistence.release_logs(name, &reservation);
                }
            }
            self.persistence.clear_pending_state();
            self.transport.close();
            self.persistence.sync().await
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(result) => result.map_err(ChannelError::from),
            Err(_) => {
                warn!("CHANNEL | Shutdown did not finish in time");
                Err(ChannelError::ShutdownTimeout)
            }
        }
    }
}

fn reply<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        debug!("CHANNEL | Requester dropped before receiving the response");
    }
}

/// Next network state. Never resolves when there is no monitor.
async fn network_change(network: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = network.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_ok() {
        return *rx.borrow_and_update();
    }
    *network = None;
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryPersistence;
    use crate::transport::testing::{http_error, ScriptedTransport};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<(String, GroupEvent)>>>;

    fn recording_group(name: &str, events: &Events) -> GroupConfig {
        let sink = Arc::clone(events);
        GroupConfig::new(name)
            .trigger_interval(Duration::from_secs(3600))
            .listener(Arc::new(move |log: &Log, event: &GroupEvent| {
                let name = match log.properties.get("name") {
                    Some(crate::log::PropertyValue::String(n)) => n.clone(),
                    _ => log.log_type.clone(),
                };
                sink.lock().unwrap().push((name, event.clone()));
            }))
    }

    fn start(transport: Arc<ScriptedTransport>) -> ChannelHandle {
        let (service, handle) =
            ChannelService::new(Box::new(MemoryPersistence::default()), transport);
        tokio::spawn(service.run());
        handle
    }

    async fn settle(handle: &ChannelHandle) {
        // Let spawned sends finish, then make sure their completions were handled.
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.is_enabled().await.unwrap();
    }

    fn count(events: &Events, wanted: &GroupEvent) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e == wanted)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_count_flushes_once_reached() {
        let transport = Arc::new(ScriptedTransport::default());
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(3))
            .await
            .unwrap();

        handle.enqueue(Log::event("a"), "g").unwrap();
        handle.enqueue(Log::event("b"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(handle.pending_count("g").await.unwrap(), Some(2));

        handle.enqueue(Log::event("c"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(handle.pending_count("g").await.unwrap(), Some(0));
        assert_eq!(count(&events, &GroupEvent::BeforeSend), 3);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let transport = Arc::new(ScriptedTransport::default());
        let handle = start(Arc::clone(&transport));
        handle
            .add_group(
                GroupConfig::new("g")
                    .trigger_count(50)
                    .trigger_interval(Duration::from_secs(3)),
            )
            .await
            .unwrap();

        handle.enqueue(Log::event("a"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_batches_are_bounded() {
        let transport =
            Arc::new(ScriptedTransport::default().with_latency(Duration::from_secs(1)));
        let handle = start(Arc::clone(&transport));
        handle
            .add_group(
                GroupConfig::new("g")
                    .trigger_count(1)
                    .max_parallel_batches(2)
                    .trigger_interval(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        for i in 0..6 {
            handle.enqueue(Log::event(&format!("e{i}")), "g").unwrap();
        }
        settle(&handle).await;
        assert_eq!(transport.calls(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&handle).await;
        assert_eq!(transport.calls(), 6);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_failure_suspends_group_until_network_returns() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http_error(503))]));
        let monitor = NetworkStateMonitor::new(true);
        let (service, handle) = ChannelService::new(
            Box::new(MemoryPersistence::default()),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        tokio::spawn(service.with_network(&monitor).run());

        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(1))
            .await
            .unwrap();
        handle.enqueue(Log::event("a"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(handle.pending_count("g").await.unwrap(), Some(1));

        // Suspended: new logs are persisted but not sent.
        handle.enqueue(Log::event("b"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 0);

        monitor.set_connected(false);
        monitor.set_connected(true);
        settle(&handle).await;
        // One batch per log since the trigger count is 1.
        assert_eq!(transport.calls(), 3);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 2);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|(_, e)| !matches!(e, GroupEvent::Failed(_))));
    }

    async fn suspend_after_one_failure(
        events: &Events,
    ) -> (Arc<ScriptedTransport>, ChannelHandle) {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http_error(503))]));
        let handle = start(Arc::clone(&transport));
        handle
            .add_group(recording_group("g", events).trigger_count(1))
            .await
            .unwrap();
        handle.enqueue(Log::event("a"), "g").unwrap();
        settle(&handle).await;
        handle.enqueue(Log::event("b"), "g").unwrap();
        settle(&handle).await;
        // Without a network monitor nothing but the caller can lift the suspension.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(count(events, &GroupEvent::Succeeded), 0);
        (transport, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_enabled_on_enabled_channel_resumes_suspended_group() {
        let events = Events::default();
        let (transport, handle) = suspend_after_one_failure(&events).await;

        handle.set_enabled(true).await.unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 3);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 2);

        handle.set_enabled(true).await.unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 3);
        assert_eq!(handle.pending_count("g").await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_group_lifts_suspension() {
        let events = Events::default();
        let (transport, handle) = suspend_after_one_failure(&events).await;

        handle.resume_group("g", None).await.unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 3);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 2);

        handle.enqueue(Log::event("c"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_lowers_pending_of_the_evicted_group() {
        let transport = Arc::new(ScriptedTransport::default());
        let handle = start(Arc::clone(&transport));
        for name in ["a", "b"] {
            handle
                .add_group(
                    GroupConfig::new(name)
                        .trigger_count(100)
                        .trigger_interval(Duration::from_secs(3600)),
                )
                .await
                .unwrap();
        }
        handle.set_max_storage_size(1_000).await.unwrap();

        for i in 0..3 {
            handle.enqueue(Log::event(&format!("a{i}")), "a").unwrap();
        }
        settle(&handle).await;
        assert_eq!(handle.pending_count("a").await.unwrap(), Some(3));

        // Ten logs of "b" alone exceed the limit, so every older "a" log goes.
        for i in 0..10 {
            handle.enqueue(Log::event(&format!("b{i}")), "b").unwrap();
        }
        settle(&handle).await;
        assert_eq!(handle.pending_count("a").await.unwrap(), Some(0));
        let pending_b = handle.pending_count("b").await.unwrap().unwrap();
        assert!((1..10).contains(&pending_b));

        handle.flush("b").await.unwrap();
        settle(&handle).await;
        let bodies = transport.bodies.lock().unwrap().clone();
        let sent: LogContainer = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(sent.logs.len(), pending_b);

        // Shrinking the store recounts too.
        handle.enqueue(Log::event("a3"), "a").unwrap();
        settle(&handle).await;
        assert_eq!(handle.pending_count("a").await.unwrap(), Some(1));
        handle.set_max_storage_size(1).await.unwrap();
        assert_eq!(handle.pending_count("a").await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preceding_logs_are_stored_before_the_prepared_log() {
        struct Announce;
        impl ChannelListener for Announce {
            fn on_preparing_log(&self, log: &mut Log, group: &str) -> Vec<PrecedingLog> {
                if log.log_type == "announcement" {
                    return Vec::new();
                }
                vec![PrecedingLog {
                    group: group.to_string(),
                    log: Log::new("announcement"),
                }]
            }
        }

        let transport = Arc::new(ScriptedTransport::default());
        let handle = start(Arc::clone(&transport));
        handle
            .add_listener(Arc::new(Announce) as Arc<dyn ChannelListener>)
            .await
            .unwrap();
        handle
            .add_group(
                GroupConfig::new("g")
                    .trigger_count(2)
                    .trigger_interval(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        handle.enqueue(Log::event("first"), "g").unwrap();
        settle(&handle).await;

        let bodies = transport.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        let sent: LogContainer = serde_json::from_slice(&bodies[0]).unwrap();
        let types: Vec<&str> = sent.logs.iter().map(|l| l.log_type.as_str()).collect();
        assert_eq!(types, vec!["announcement", "event"]);
        assert!(sent.logs[0].id.is_some());
        assert!(sent.logs[0].timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_drops_batch() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(http_error(400))]));
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(2))
            .await
            .unwrap();

        handle.enqueue(Log::event("a"), "g").unwrap();
        handle.enqueue(Log::event("b"), "g").unwrap();
        settle(&handle).await;
        let failed = GroupEvent::Failed(FailureReason::Transport(http_error(400)));
        assert_eq!(count(&events, &failed), 2);

        // The group keeps running and the dropped logs are gone.
        handle.enqueue(Log::event("c"), "g").unwrap();
        handle.enqueue(Log::event("d"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 2);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_in_flight_and_discards_logs() {
        let transport =
            Arc::new(ScriptedTransport::default().with_latency(Duration::from_secs(5)));
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(1))
            .await
            .unwrap();

        handle.enqueue(Log::event("sent"), "g").unwrap();
        settle(&handle).await;
        handle.pause_group("g", None).await.unwrap();
        handle.enqueue(Log::event("stored"), "g").unwrap();

        handle.set_enabled(false).await.unwrap();
        handle.set_enabled(false).await.unwrap();
        assert!(!handle.is_enabled().await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&handle).await;
        let cancelled = GroupEvent::Failed(FailureReason::Cancelled);
        assert_eq!(count(&events, &cancelled), 2);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 0);

        handle.enqueue(Log::event("rejected"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(
            count(&events, &GroupEvent::Failed(FailureReason::Disabled)),
            1
        );

        handle.set_enabled(true).await.unwrap();
        handle.resume_group("g", None).await.unwrap();
        handle.enqueue(Log::event("after"), "g").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&handle).await;
        assert_eq!(count(&events, &GroupEvent::Succeeded), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_target_is_held_back() {
        let transport = Arc::new(ScriptedTransport::default());
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(1))
            .await
            .unwrap();

        handle.pause_group("g", Some("tenant-secret")).await.unwrap();
        handle
            .enqueue(Log::event("held").with_target("tenant-secret"), "g")
            .unwrap();
        handle.enqueue(Log::event("free"), "g").unwrap();
        settle(&handle).await;
        let succeeded: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| *e == GroupEvent::Succeeded)
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(succeeded, vec!["free".to_string()]);

        handle.resume_group("g", Some("tenant")).await.unwrap();
        settle(&handle).await;
        assert_eq!(count(&events, &GroupEvent::Succeeded), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_group_keeps_logs_and_ignores_completion() {
        let transport =
            Arc::new(ScriptedTransport::default().with_latency(Duration::from_secs(5)));
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(1))
            .await
            .unwrap();
        handle.enqueue(Log::event("a"), "g").unwrap();
        settle(&handle).await;
        assert_eq!(transport.calls(), 1);

        handle.remove_group("g").await.unwrap();
        assert_eq!(handle.pending_count("g").await.unwrap(), None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle(&handle).await;
        assert_eq!(count(&events, &GroupEvent::Succeeded), 0);

        // Re-adding counts the released log as pending again.
        handle
            .add_group(
                GroupConfig::new("g")
                    .trigger_count(5)
                    .trigger_interval(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        assert_eq!(handle.pending_count("g").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_completes_log_fields() {
        struct Capture(Mutex<Vec<Log>>);
        impl ChannelListener for Capture {
            fn on_preparing_log(&self, log: &mut Log, _group: &str) -> Vec<PrecedingLog> {
                log.properties
                    .insert("decorated".to_string(), true.into());
                self.0.lock().unwrap().push(log.clone());
                Vec::new()
            }
            fn should_filter(&self, log: &Log) -> bool {
                log.log_type == "noise"
            }
        }

        let transport = Arc::new(ScriptedTransport::default());
        let (service, handle) = ChannelService::new(
            Box::new(MemoryPersistence::default()),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        let device = crate::device::StaticDeviceInfo::for_current_process("9.9.9");
        tokio::spawn(service.with_device_info(Arc::new(device)).run());

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        handle
            .add_listener(Arc::clone(&capture) as Arc<dyn ChannelListener>)
            .await
            .unwrap();
        handle
            .add_group(
                GroupConfig::new("g")
                    .trigger_count(1)
                    .trigger_interval(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        handle.set_clock_offset(60_000).unwrap();
        handle.enqueue(Log::event("a"), "g").unwrap();
        handle.enqueue(Log::new("noise"), "g").unwrap();
        settle(&handle).await;

        let seen = capture.0.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].id.is_some());
        assert!(seen[0].timestamp.is_some());
        assert_eq!(seen[0].device.as_ref().unwrap().app_version, "9.9.9");

        let bodies = transport.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1, "filtered log is never sent");
        let sent: LogContainer = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(sent.logs.len(), 1);
        assert_eq!(
            sent.logs[0].properties.get("decorated"),
            Some(&crate::log::PropertyValue::Bool(true))
        );
        // The offset is applied after listeners ran.
        let shifted = sent.logs[0].timestamp.unwrap();
        let original = seen[0].timestamp.unwrap();
        assert_eq!(
            shifted.duration_since(original).unwrap(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_unknown_group_is_an_error() {
        let handle = start(Arc::new(ScriptedTransport::default()));
        assert!(matches!(
            handle.flush("missing").await,
            Err(ChannelError::UnknownGroup(_))
        ));
        assert!(matches!(
            handle.pause_group("missing", None).await,
            Err(ChannelError::UnknownGroup(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_in_flight_without_notifying() {
        let transport =
            Arc::new(ScriptedTransport::default().with_latency(Duration::from_secs(5)));
        let handle = start(Arc::clone(&transport));
        let events = Events::default();
        handle
            .add_group(recording_group("g", &events).trigger_count(1))
            .await
            .unwrap();
        handle.enqueue(Log::event("a"), "g").unwrap();
        settle(&handle).await;

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(
            handle.is_enabled().await,
            Err(ChannelError::Closed)
        ));
        assert_eq!(transport.completed.load(Ordering::SeqCst), 0);
        assert_eq!(count(&events, &GroupEvent::Succeeded), 0);
        assert_eq!(count(&events, &GroupEvent::Failed(FailureReason::Cancelled)), 0);
    }
}
