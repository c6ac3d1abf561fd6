// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The channel actor and its handle.
//!
//! [`ChannelService`] owns every piece of mutable state and runs as a single
//! task. [`ChannelHandle`]s are cheap to clone and only post commands, so
//! producers never block on persistence or the network.

mod group_state;
mod service;

pub use service::ChannelService;

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ChannelError, TransportError};
use crate::group::GroupConfig;
use crate::listener::ChannelListener;
use crate::log::Log;
use crate::persistence::ReservationId;
use crate::transport::TransportResponse;

/// Identifies a registered [`ChannelListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) enum ChannelCommand {
    AddGroup(GroupConfig, oneshot::Sender<Result<(), ChannelError>>),
    RemoveGroup(String, oneshot::Sender<()>),
    Enqueue {
        log: Log,
        group: String,
    },
    Flush(String, oneshot::Sender<Result<(), ChannelError>>),
    SetEnabled(bool, oneshot::Sender<Result<(), ChannelError>>),
    IsEnabled(oneshot::Sender<bool>),
    Clear(String, oneshot::Sender<Result<usize, ChannelError>>),
    Pause {
        group: String,
        target_token: Option<String>,
        response_tx: oneshot::Sender<Result<(), ChannelError>>,
    },
    Resume {
        group: String,
        target_token: Option<String>,
        response_tx: oneshot::Sender<Result<(), ChannelError>>,
    },
    AddListener(Arc<dyn ChannelListener>, oneshot::Sender<ListenerId>),
    RemoveListener(ListenerId),
    SetMaxStorageSize(u64, oneshot::Sender<Result<(), ChannelError>>),
    SetClockOffset(i64),
    InvalidateDeviceCache,
    PendingCount(String, oneshot::Sender<Option<usize>>),
    TimerFired {
        group: String,
        generation: u64,
    },
    BatchCompleted {
        group: String,
        reservation: ReservationId,
        epoch: u64,
        result: Result<TransportResponse, TransportError>,
    },
    Shutdown(oneshot::Sender<Result<(), ChannelError>>),
}

impl fmt::Debug for ChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelCommand::AddGroup(..) => "AddGroup",
            ChannelCommand::RemoveGroup(..) => "RemoveGroup",
            ChannelCommand::Enqueue { .. } => "Enqueue",
            ChannelCommand::Flush(..) => "Flush",
            ChannelCommand::SetEnabled(..) => "SetEnabled",
            ChannelCommand::IsEnabled(..) => "IsEnabled",
            ChannelCommand::Clear(..) => "Clear",
            ChannelCommand::Pause { .. } => "Pause",
            ChannelCommand::Resume { .. } => "Resume",
            ChannelCommand::AddListener(..) => "AddListener",
            ChannelCommand::RemoveListener(..) => "RemoveListener",
            ChannelCommand::SetMaxStorageSize(..) => "SetMaxStorageSize",
            ChannelCommand::SetClockOffset(..) => "SetClockOffset",
            ChannelCommand::InvalidateDeviceCache => "InvalidateDeviceCache",
            ChannelCommand::PendingCount(..) => "PendingCount",
            ChannelCommand::TimerFired { .. } => "TimerFired",
            ChannelCommand::BatchCompleted { .. } => "BatchCompleted",
            ChannelCommand::Shutdown(..) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ChannelCommand {
    /// Group the command acts on, if it targets a single one.
    fn group(&self) -> Option<&str> {
        match self {
            ChannelCommand::AddGroup(config, _) => Some(config.name.as_str()),
            ChannelCommand::RemoveGroup(group, _)
            | ChannelCommand::Enqueue { group, .. }
            | ChannelCommand::Flush(group, _)
            | ChannelCommand::Clear(group, _)
            | ChannelCommand::Pause { group, .. }
            | ChannelCommand::Resume { group, .. }
            | ChannelCommand::TimerFired { group, .. }
            | ChannelCommand::BatchCompleted { group, .. } => Some(group.as_str()),
            _ => None,
        }
    }
}

/// Cloneable entry point to a running [`ChannelService`].
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self { tx }
    }

    fn post(&self, command: ChannelCommand) -> Result<(), ChannelError> {
        self.tx.send(command).map_err(|_| ChannelError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ChannelCommand,
    ) -> Result<T, ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.post(command(response_tx))?;
        response_rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Registers a group, or replaces the configuration of an existing one.
    pub async fn add_group(&self, config: GroupConfig) -> Result<(), ChannelError> {
        self.request(|tx| ChannelCommand::AddGroup(config, tx))
            .await?
    }

    /// Stops tracking a group. Its persisted logs are kept.
    pub async fn remove_group(&self, group: &str) -> Result<(), ChannelError> {
        self.request(|tx| ChannelCommand::RemoveGroup(group.to_string(), tx))
            .await
    }

    /// Queues a log for a group. Only fails when the service is gone; every
    /// other problem is reported to the group listener.
    pub fn enqueue(&self, log: Log, group: &str) -> Result<(), ChannelError> {
        self.post(ChannelCommand::Enqueue {
            log,
            group: group.to_string(),
        })
    }

    /// Sends one batch of the group now if the parallelism limit allows it.
    pub async fn flush(&self, group: &str) -> Result<(), ChannelError> {
        self.request(|tx| ChannelCommand::Flush(group.to_string(), tx))
            .await?
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ChannelError> {
        self.request(|tx| ChannelCommand::SetEnabled(enabled, tx))
            .await?
    }

    pub async fn is_enabled(&self) -> Result<bool, ChannelError> {
        self.request(ChannelCommand::IsEnabled).await
    }

    /// Deletes every persisted log of a group. Returns how many were deleted.
    pub async fn clear(&self, group: &str) -> Result<usize, ChannelError> {
        self.request(|tx| ChannelCommand::Clear(group.to_string(), tx))
            .await?
    }

    /// Holds back a whole group, or only the logs routed to `target_token`.
    pub async fn pause_group(
        &self,
        group: &str,
        target_token: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.request(|response_tx| ChannelCommand::Pause {
            group: group.to_string(),
            target_token: target_token.map(str::to_string),
            response_tx,
        })
        .await?
    }

    pub async fn resume_group(
        &self,
        group: &str,
        target_token: Option<&str>,
    ) -> Result<(), ChannelError> {
        self.request(|response_tx| ChannelCommand::Resume {
            group: group.to_string(),
            target_token: target_token.map(str::to_string),
            response_tx,
        })
        .await?
    }

    /// Hooks run on the service task. A listener must not await calls on a
    /// handle from inside a hook; posting with [`ChannelHandle::enqueue`] is fine.
    pub async fn add_listener(
        &self,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ListenerId, ChannelError> {
        self.request(|tx| ChannelCommand::AddListener(listener, tx))
            .await
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<(), ChannelError> {
        self.post(ChannelCommand::RemoveListener(id))
    }

    pub async fn set_max_storage_size(&self, max_bytes: u64) -> Result<(), ChannelError> {
        self.request(|tx| ChannelCommand::SetMaxStorageSize(max_bytes, tx))
            .await?
    }

    /// Correction, in milliseconds, added to timestamps assigned at enqueue.
    pub fn set_clock_offset(&self, offset_millis: i64) -> Result<(), ChannelError> {
        self.post(ChannelCommand::SetClockOffset(offset_millis))
    }

    /// Forces the next log to fetch a fresh device snapshot.
    pub fn invalidate_device_cache(&self) -> Result<(), ChannelError> {
        self.post(ChannelCommand::InvalidateDeviceCache)
    }

    /// Logs persisted since the last scheduled flush, `None` for unknown groups.
    pub async fn pending_count(&self, group: &str) -> Result<Option<usize>, ChannelError> {
        self.request(|tx| ChannelCommand::PendingCount(group.to_string(), tx))
            .await
    }

    /// Cancels in-flight calls without deleting their logs, syncs persistence
    /// and stops the service.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        self.request(ChannelCommand::Shutdown).await?
    }
}

impl ListenerId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}
