// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line protocol read from stdin.
//!
//! ```text
//! purchase                                  -> event named "purchase"
//! {"name":"purchase","properties":{...}}    -> event with typed properties
//! {"page":"checkout"}                       -> page view
//! !foreground !background !online !offline !flush <group>
//! ```

use serde::Deserialize;
use serde_json::Value;
use telemetry_channel::log::{Log, PropertyValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Log(Log),
    Foreground,
    Background,
    Network(bool),
    Flush(Option<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Invalid JSON event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Event needs either a name or a page")]
    MissingName,
}

#[derive(Debug, Deserialize)]
struct JsonEvent {
    name: Option<String>,
    page: Option<String>,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
    #[serde(default)]
    targets: Vec<String>,
}

/// Parses one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(command) = line.strip_prefix('!') {
        let mut parts = command.split_whitespace();
        let input = match parts.next().unwrap_or_default() {
            "foreground" => Input::Foreground,
            "background" => Input::Background,
            "online" => Input::Network(true),
            "offline" => Input::Network(false),
            "flush" => Input::Flush(parts.next().map(str::to_string)),
            other => return Err(InputError::UnknownCommand(other.to_string())),
        };
        return Ok(Some(input));
    }

    if line.starts_with('{') {
        let event: JsonEvent = serde_json::from_str(line)?;
        let mut log = match (event.name, event.page) {
            (Some(name), _) => Log::event(&name),
            (None, Some(page)) => Log::page(&page),
            (None, None) => return Err(InputError::MissingName),
        };
        for (key, value) in event.properties {
            log = log.with_property(&key, property_value(value));
        }
        for target in &event.targets {
            log = log.with_target(target);
        }
        return Ok(Some(Input::Log(log)));
    }

    Ok(Some(Input::Log(Log::event(line))))
}

fn property_value(value: Value) -> PropertyValue {
    match value {
        Value::String(s) => PropertyValue::String(s),
        Value::Bool(b) => PropertyValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PropertyValue::Long(i),
            None => PropertyValue::Double(n.as_f64().unwrap_or_default()),
        },
        other => PropertyValue::String(other.to_string()),
    }
}
