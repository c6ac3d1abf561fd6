// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records flowing through the channel.
//!
//! A [`Log`] is produced by feature code, completed by the channel at enqueue
//! time (id, timestamp, device snapshot, session id) and then persisted as-is.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::constants::START_SESSION_LOG_TYPE;
use crate::device::Device;

/// Typed value of a log property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Bool(bool),
    Long(i64),
    Double(f64),
    DateTime(SystemTime),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<SystemTime> for PropertyValue {
    fn from(value: SystemTime) -> Self {
        PropertyValue::DateTime(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Discriminator of the record, e.g. `event`, `page`, `startSession`.
    #[serde(rename = "type")]
    pub log_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<SystemTime>,
    #[serde(default, rename = "sid", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub transmission_targets: BTreeSet<String>,
}

impl Log {
    #[must_use]
    pub fn new(log_type: impl Into<String>) -> Self {
        Self {
            log_type: log_type.into(),
            id: None,
            timestamp: None,
            session_id: None,
            device: None,
            properties: BTreeMap::new(),
            transmission_targets: BTreeSet::new(),
        }
    }

    /// A named analytics event.
    #[must_use]
    pub fn event(name: &str) -> Self {
        Self::new("event").with_property("name", name)
    }

    /// A page view.
    #[must_use]
    pub fn page(name: &str) -> Self {
        Self::new("page").with_property("name", name)
    }

    /// The dedicated log marking the start of a session.
    #[must_use]
    pub fn start_session(session_id: Uuid) -> Self {
        let mut log = Self::new(START_SESSION_LOG_TYPE);
        log.session_id = Some(session_id);
        log
    }

    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_target(mut self, token: &str) -> Self {
        self.transmission_targets.insert(token.to_string());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn is_start_session(&self) -> bool {
        self.log_type == START_SESSION_LOG_TYPE
    }

    /// Routing key of the first transmission target, if any.
    #[must_use]
    pub fn target_key(&self) -> Option<&str> {
        self.transmission_targets
            .iter()
            .next()
            .map(|token| target_key(token))
    }

    /// Milliseconds since the Unix epoch, or 0 when the log has no timestamp.
    #[must_use]
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A target token is `<key>-<secret>`; only the key is used for pausing.
#[must_use]
pub fn target_key(token: &str) -> &str {
    token.split_once('-').map_or(token, |(key, _)| key)
}

/// Applies a signed millisecond offset to a timestamp, saturating at the epoch.
#[must_use]
pub fn apply_offset(timestamp: SystemTime, offset_millis: i64) -> SystemTime {
    let magnitude = Duration::from_millis(offset_millis.unsigned_abs());
    if offset_millis >= 0 {
        timestamp.checked_add(magnitude).unwrap_or(timestamp)
    } else {
        timestamp.checked_sub(magnitude).unwrap_or(UNIX_EPOCH)
    }
}

/// Body sent to the backend for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogContainer {
    pub logs: Vec<Log>,
}
