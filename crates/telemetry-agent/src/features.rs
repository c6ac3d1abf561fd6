// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::features::{Feature, FeatureRegistry};
use telemetry_channel::group::{GroupConfig, GroupEvent};
use telemetry_channel::log::Log;
use tracing::{debug, warn};

pub const ANALYTICS: &str = "analytics";
pub const ANALYTICS_GROUP: &str = "group_analytics";

/// Events and page views typed on stdin.
#[derive(Debug, Default)]
pub struct AnalyticsFeature;

impl Feature for AnalyticsFeature {
    fn id(&self) -> &str {
        ANALYTICS
    }

    fn group_config(&self) -> Option<GroupConfig> {
        Some(
            GroupConfig::new(ANALYTICS_GROUP)
                .trigger_interval(Duration::from_secs(3))
                .listener(Arc::new(report)),
        )
    }
}

fn report(log: &Log, event: &GroupEvent) {
    match event {
        GroupEvent::BeforeSend => {}
        GroupEvent::Succeeded => debug!("ANALYTICS | Delivered log {:?}", log.id),
        GroupEvent::Failed(reason) => warn!("ANALYTICS | Log {:?} failed: {reason:?}", log.id),
    }
}

/// Every feature the agent knows how to start.
pub fn registry() -> FeatureRegistry {
    let mut registry = FeatureRegistry::new();
    registry.register(ANALYTICS, || Arc::new(AnalyticsFeature));
    registry
}
