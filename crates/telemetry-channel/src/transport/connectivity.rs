// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::{CloseSwitch, Transport, TransportRequest, TransportResponse};
use crate::error::TransportError;
use crate::network::NetworkStateMonitor;

/// Holds calls while the network is down and restarts calls interrupted by a
/// connectivity loss.
///
/// Waiting calls leave the queue in arrival order once the network is back.
#[derive(Debug)]
pub struct ConnectivityTransport<T> {
    inner: T,
    network: watch::Receiver<bool>,
    queue: Mutex<()>,
    switch: CloseSwitch,
}

impl<T: Transport> ConnectivityTransport<T> {
    #[must_use]
    pub fn new(inner: T, network: &NetworkStateMonitor) -> Self {
        Self {
            inner,
            network: network.subscribe(),
            queue: Mutex::new(()),
            switch: CloseSwitch::new(),
        }
    }
}

/// Waits until the network reaches `connected`. Returns `false` when the
/// monitor is gone and the state can no longer change.
async fn wait_for_state(network: &mut watch::Receiver<bool>, connected: bool) -> bool {
    network.wait_for(|state| *state == connected).await.is_ok()
}

#[async_trait]
impl<T: Transport> Transport for ConnectivityTransport<T> {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let closed = self.switch.token();
        let mut network = self.network.clone();
        loop {
            if closed.is_cancelled() {
                return Err(TransportError::Closed);
            }

            if !*network.borrow_and_update() {
                debug!(
                    "TRANSPORT | Network down, holding batch of group {}",
                    request.group
                );
                let _turn = tokio::select! {
                    biased;
                    () = closed.cancelled() => return Err(TransportError::Closed),
                    turn = self.queue.lock() => turn,
                };
                tokio::select! {
                    biased;
                    () = closed.cancelled() => return Err(TransportError::Closed),
                    _ = wait_for_state(&mut network, true) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                () = closed.cancelled() => return Err(TransportError::Closed),
                () = async {
                    if !wait_for_state(&mut network, false).await {
                        std::future::pending::<()>().await;
                    }
                } => None,
                result = self.inner.send(request) => Some(result),
            };
            match outcome {
                Some(result) => return result,
                None => debug!(
                    "TRANSPORT | Network lost, re-queueing batch of group {}",
                    request.group
                ),
            }
        }
    }

    fn close(&self) {
        self.switch.close();
        self.inner.close();
    }

    fn reopen(&self) {
        self.inner.reopen();
        self.switch.reopen();
    }
}
