// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Explicit registry of the features a host can start.
//!
//! A feature owns one group on the channel and produces logs into it. Hosts
//! register a constructor per feature identifier and start features by name.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::channel::ChannelHandle;
use crate::error::ChannelError;
use crate::group::GroupConfig;

#[async_trait]
pub trait Feature: Send + Sync {
    fn id(&self) -> &str;

    /// Group the feature logs into, if any.
    fn group_config(&self) -> Option<GroupConfig> {
        None
    }

    async fn on_started(&self, channel: &ChannelHandle) -> Result<(), ChannelError> {
        if let Some(config) = self.group_config() {
            channel.add_group(config).await?;
        }
        Ok(())
    }

    async fn on_stopped(&self, channel: &ChannelHandle) -> Result<(), ChannelError> {
        if let Some(config) = self.group_config() {
            channel.remove_group(&config.name).await?;
        }
        Ok(())
    }
}

type Constructor = Box<dyn Fn() -> Arc<dyn Feature> + Send + Sync>;

#[derive(Default)]
pub struct FeatureRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl FeatureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor. A second registration under the same id replaces
    /// the first.
    pub fn register<F>(&mut self, id: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Feature> + Send + Sync + 'static,
    {
        if self
            .constructors
            .insert(id.to_string(), Box::new(constructor))
            .is_some()
        {
            debug!("FEATURES | Replaced constructor of feature {id}");
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    #[must_use]
    pub fn build(&self, id: &str) -> Option<Arc<dyn Feature>> {
        self.constructors.get(id).map(|constructor| constructor())
    }

    /// Builds and starts the named features in order. Unknown ids are skipped.
    pub async fn start(
        &self,
        ids: &[&str],
        channel: &ChannelHandle,
    ) -> Result<Vec<Arc<dyn Feature>>, ChannelError> {
        let mut started = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(feature) = self.build(id) else {
                warn!("FEATURES | Unknown feature {id}, skipping");
                continue;
            };
            feature.on_started(channel).await?;
            debug!("FEATURES | Started feature {id}");
            started.push(feature);
        }
        Ok(started)
    }
}

impl fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}
