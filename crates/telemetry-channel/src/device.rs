// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Immutable snapshot of device metadata attached to every log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub sdk_name: String,
    pub sdk_version: String,
    pub os_name: String,
    pub os_version: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Source of the device snapshot. Collection itself happens outside the channel.
pub trait DeviceInfoProvider: Send + Sync + Debug {
    fn device(&self) -> Result<Device, String>;
}

/// Provider returning a fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo(pub Device);

impl StaticDeviceInfo {
    /// Snapshot describing the current process, as far as the standard library knows.
    #[must_use]
    pub fn for_current_process(app_version: &str) -> Self {
        Self(Device {
            sdk_name: env!("CARGO_PKG_NAME").to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
            app_version: app_version.to_string(),
            extra: BTreeMap::new(),
        })
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn device(&self) -> Result<Device, String> {
        Ok(self.0.clone())
    }
}
