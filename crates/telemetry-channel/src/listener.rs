// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::log::Log;

/// Log a listener asks the channel to store ahead of the one being prepared.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecedingLog {
    pub group: String,
    pub log: Log,
}

/// Channel-wide hooks. Every method has a no-op default so a listener only
/// implements what it needs. Hooks run on the channel service task.
pub trait ChannelListener: Send + Sync {
    fn on_group_added(&self, _group: &str) {}

    fn on_group_removed(&self, _group: &str) {}

    /// Called before a log is persisted; may decorate it. Returned logs are
    /// stored first, in order, without being shown to the listeners again.
    fn on_preparing_log(&self, _log: &mut Log, _group: &str) -> Vec<PrecedingLog> {
        Vec::new()
    }

    /// Returning `true` drops the log without persisting it.
    fn should_filter(&self, _log: &Log) -> bool {
        false
    }

    fn on_globally_enabled(&self, _enabled: bool) {}

    fn on_clear(&self, _group: &str) {}

    fn on_paused(&self, _group: &str, _target_token: Option<&str>) {}

    fn on_resumed(&self, _group: &str, _target_token: Option<&str>) {}
}
