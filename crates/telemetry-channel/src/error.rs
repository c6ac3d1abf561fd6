// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors returned by the channel handle.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel service is not running")]
    Closed,

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}

/// Errors raised by a [`crate::persistence::Persistence`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot serialize log: {0}")]
    Serialization(String),

    #[error("Log is too large ({size} bytes) for a store limited to {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Store is full and no log can be evicted")]
    Full,
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// Errors raised by a [`crate::transport::Transport`].
///
/// Whether an error is worth retrying is decided by
/// [`crate::transport::classify::ErrorClassifier`], not by the error itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("HTTP status {status}")]
    Http {
        status: u16,
        /// Server-provided delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// Connection refused, reset, DNS failure and similar transient I/O errors.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// The request could not be built or the payload could not be encoded.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The transport was closed while the call was queued or in flight.
    #[error("Transport closed")]
    Closed,
}

/// Errors raised while building or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
