// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side telemetry log channel.
//!
//! Producers enqueue [`log::Log`] records into named groups through a
//! [`channel::ChannelHandle`]. A single [`channel::ChannelService`] task owns all
//! bookkeeping: it persists every log, decides when a group has to be flushed,
//! reserves batches from [`persistence::Persistence`] and hands them to a
//! decorated [`transport::Transport`].
//!
//! ```text
//!   producers ──enqueue──> ChannelHandle ──cmd──> ChannelService ──put/get──> Persistence
//!                                                     │
//!                                                     v
//!                          ConnectivityTransport -> RetryTransport -> HttpTransport
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod channel;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod features;
pub mod group;
pub mod listener;
pub mod log;
pub mod network;
pub mod persistence;
pub mod serializer;
pub mod session;
pub mod transport;
