// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session stitching.
//!
//! ```text
//!            first log / foreground after idle
//!   (none) ───────────────────────────────────> Session(id)
//!                                                  │  ^
//!                                      background  │  │ foreground < timeout: reuse
//!                                                  v  │
//!                                            [background since t]
//!                                                  │
//!                              foreground ≥ timeout│and no log for ≥ timeout
//!                                                  v
//!                                             Session(new id) + startSession log
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::constants::{MAX_SESSION_HISTORY, SESSION_TIMEOUT};
use crate::listener::{ChannelListener, PrecedingLog};
use crate::log::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    /// Wall-clock start, used to correlate logs carrying past timestamps.
    pub start_time: SystemTime,
}

#[derive(Debug, Default)]
struct TrackerState {
    current: Option<Session>,
    /// Past and current sessions, oldest first.
    history: VecDeque<Session>,
    foreground: bool,
    background_since: Option<Instant>,
    last_log_at: Option<Instant>,
}

/// Stamps every log with the id of the active session and emits a
/// `startSession` log whenever a new session begins.
///
/// Register it with [`ChannelHandle::add_listener`] and feed it lifecycle
/// transitions through [`SessionTracker::on_foreground`] and
/// [`SessionTracker::on_background`].
#[derive(Debug)]
pub struct SessionTracker {
    channel: ChannelHandle,
    group: String,
    timeout: Duration,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(channel: ChannelHandle, group: impl Into<String>) -> Self {
        Self {
            channel,
            group: group.into(),
            timeout: SESSION_TIMEOUT,
            state: Mutex::new(TrackerState::default()),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_foreground(&self) {
        let now = Instant::now();
        let mut state = self.state();
        state.foreground = true;
        let expired = match state.current {
            None => true,
            Some(_) => {
                let background_for = state
                    .background_since
                    .map(|since| now.duration_since(since));
                let idle_for = state.last_log_at.map(|at| now.duration_since(at));
                background_for.is_some_and(|d| d >= self.timeout)
                    && idle_for.map_or(true, |d| d >= self.timeout)
            }
        };
        state.background_since = None;
        if expired {
            let log = Self::start_session(&mut state);
            drop(state);
            if let Err(e) = self.channel.enqueue(log, &self.group) {
                warn!("SESSION | Could not enqueue start of session: {e}");
            }
        } else {
            debug!("SESSION | Back in foreground, keeping the current session");
        }
    }

    pub fn on_background(&self) {
        let mut state = self.state();
        state.foreground = false;
        state.background_since = Some(Instant::now());
        debug!("SESSION | Entered background");
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.state().current
    }

    /// Forgets every recorded session, the current one included.
    pub fn clear_sessions(&self) {
        let mut state = self.state();
        state.history.clear();
        state.current = None;
    }

    /// Makes a new session current and returns its `startSession` log.
    fn start_session(state: &mut TrackerState) -> Log {
        let session = Session {
            id: Uuid::new_v4(),
            start_time: SystemTime::now(),
        };
        debug!("SESSION | Starting session {}", session.id);
        state.current = Some(session);
        state.history.push_back(session);
        while state.history.len() > MAX_SESSION_HISTORY {
            state.history.pop_front();
        }

        Log::start_session(session.id).with_timestamp(session.start_time)
    }

    /// Session that was active at `timestamp`, looked up in the history.
    fn session_at(state: &TrackerState, timestamp: SystemTime) -> Option<Uuid> {
        state
            .history
            .iter()
            .rev()
            .find(|session| session.start_time <= timestamp)
            .map(|session| session.id)
    }
}

impl ChannelListener for SessionTracker {
    /// Stamps the log with its session. When the log opens a session, the
    /// `startSession` log is handed back so the channel stores it first.
    fn on_preparing_log(&self, log: &mut Log, _group: &str) -> Vec<PrecedingLog> {
        if log.is_start_session() || log.session_id.is_some() {
            return Vec::new();
        }

        let mut state = self.state();
        let mut preceding = Vec::new();
        let (current, opened) = match state.current {
            Some(session) => (session, false),
            None => {
                preceding.push(PrecedingLog {
                    group: self.group.clone(),
                    log: Self::start_session(&mut state),
                });
                match state.current {
                    Some(session) => (session, true),
                    None => return preceding,
                }
            }
        };

        // The log that opens a session belongs to it even though its timestamp
        // predates the start.
        log.session_id = match log.timestamp {
            Some(timestamp) if !opened && timestamp < current.start_time => {
                Self::session_at(&state, timestamp)
            }
            _ => Some(current.id),
        };
        state.last_log_at = Some(Instant::now());
        preceding
    }
}
