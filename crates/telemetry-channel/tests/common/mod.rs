// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities, mocks, and helpers for integration tests

pub mod mocks;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_channel::channel::ChannelHandle;
use telemetry_channel::group::{GroupConfig, GroupEvent};
use telemetry_channel::log::{Log, PropertyValue};

/// `(log name, event)` pairs seen by a group listener.
pub type Events = Arc<Mutex<Vec<(String, GroupEvent)>>>;

/// Group whose listener records every event. The interval is long enough to
/// never fire on its own.
pub fn recording_group(name: &str, events: &Events) -> GroupConfig {
    let sink = Arc::clone(events);
    GroupConfig::new(name)
        .trigger_interval(Duration::from_secs(3600))
        .listener(Arc::new(move |log: &Log, event: &GroupEvent| {
            sink.lock().unwrap().push((log_name(log), event.clone()));
        }))
}

pub fn log_name(log: &Log) -> String {
    match log.properties.get("name") {
        Some(PropertyValue::String(name)) => name.clone(),
        _ => log.log_type.clone(),
    }
}

#[allow(dead_code)]
pub fn count(events: &Events, wanted: &GroupEvent) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, event)| event == wanted)
        .count()
}

/// Lets spawned sends finish, then round-trips through the service so their
/// completions are handled.
pub async fn settle(handle: &ChannelHandle) {
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.is_enabled().await.unwrap();
}

/// Polls `condition` on real time until it holds or five seconds pass.
#[allow(dead_code)]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
