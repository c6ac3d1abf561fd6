// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default number of logs that triggers a flush of a group.
pub const DEFAULT_TRIGGER_COUNT: usize = 50;

/// Default maximum time a log waits in a group before a flush is forced.
pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of batches a group may have in flight at once.
pub const DEFAULT_MAX_PARALLEL_BATCHES: usize = 3;

/// Page size used when notifying listeners about logs discarded by a disable.
pub const CLEAR_BATCH_SIZE: usize = 100;

/// Backoff table used by the retry decorator.
pub const RETRY_INTERVALS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(5 * 60),
    Duration::from_secs(20 * 60),
];

/// Response header carrying a server-requested retry delay in milliseconds.
pub const RETRY_AFTER_MS_HEADER: &str = "x-ms-retry-after-ms";

/// Time spent in background (and without any new log) after which the next
/// foreground transition opens a new session.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Number of past sessions kept for correlating back-dated logs.
pub const MAX_SESSION_HISTORY: usize = 10;

/// Default upper bound of the on-disk store.
pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 10 * 1024 * 1024;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_INGESTION_URL: &str = "http://127.0.0.1:8126/api/v1/logs";

/// Log type discriminator of the dedicated session boundary log.
pub const START_SESSION_LOG_TYPE: &str = "startSession";

/// Name of the span wrapping the work done on behalf of one group. Its `name`
/// field carries the group name.
pub const GROUP_SPAN: &str = "group";
