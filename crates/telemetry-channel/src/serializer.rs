// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;

use crate::error::PersistenceError;
use crate::log::{Log, LogContainer};

/// Converts logs to and from bytes. The channel treats the encoding as opaque.
pub trait LogSerializer: Send + Sync + Debug {
    fn serialize(&self, log: &Log) -> Result<Vec<u8>, PersistenceError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Log, PersistenceError>;

    fn serialize_container(&self, container: &LogContainer) -> Result<Vec<u8>, PersistenceError>;

    /// Value of the `Content-Type` header for serialized containers.
    fn content_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLogSerializer;

impl LogSerializer for JsonLogSerializer {
    fn serialize(&self, log: &Log) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(log)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Log, PersistenceError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_container(&self, container: &LogContainer) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(container)?)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
