// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Live network state, fed by the host platform.
///
/// Cloning shares the same state; every subscriber observes every change.
#[derive(Debug, Clone)]
pub struct NetworkStateMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStateMonitor {
    #[must_use]
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_connected(&self, connected: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
        if changed {
            debug!("NETWORK | Connectivity changed: connected={connected}");
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStateMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
