// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod features;
mod input;
mod logger;

use anyhow::Context;
use std::path::Path;
use std::{env, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use telemetry_channel::channel::{ChannelHandle, ChannelService};
use telemetry_channel::config::ChannelConfig;
use telemetry_channel::device::StaticDeviceInfo;
use telemetry_channel::listener::ChannelListener;
use telemetry_channel::network::NetworkStateMonitor;
use telemetry_channel::persistence::file::FilePersistence;
use telemetry_channel::persistence::memory::MemoryPersistence;
use telemetry_channel::persistence::Persistence;
use telemetry_channel::session::SessionTracker;
use telemetry_channel::transport::classify::ErrorClassifier;
use telemetry_channel::transport::connectivity::ConnectivityTransport;
use telemetry_channel::transport::http::HttpTransport;
use telemetry_channel::transport::retry::RetryTransport;

use features::{ANALYTICS, ANALYTICS_GROUP};
use input::Input;

const INSTALL_ID_FILE: &str = "install_id";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ChannelConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on telemetry agent startup: {e}");
            return;
        }
    };

    if let Err(e) = run(config).await {
        error!("Telemetry agent stopped: {e:#}");
    }
}

async fn run(config: ChannelConfig) -> anyhow::Result<()> {
    let install_id = match &config.storage_dir {
        Some(dir) => load_install_id(dir).await?,
        None => Uuid::new_v4(),
    };
    info!("Starting telemetry agent, install id {install_id}");

    let persistence: Box<dyn Persistence> = match &config.storage_dir {
        Some(dir) => Box::new(FilePersistence::new(dir.join("logs"))),
        None => {
            warn!("No storage directory configured, logs are kept in memory only");
            Box::new(MemoryPersistence::default())
        }
    };

    let monitor = NetworkStateMonitor::new(true);
    let classifier = ErrorClassifier::new(config.retryable_status_codes.clone());
    let http = HttpTransport::new(&config, install_id).context("cannot build HTTP transport")?;
    let transport = ConnectivityTransport::new(
        RetryTransport::new(http)
            .with_classifier(classifier.clone())
            .with_intervals(config.retry_intervals.clone())
            .with_jitter(true),
        &monitor,
    );

    let (service, handle) = ChannelService::new(persistence, Arc::new(transport));
    let service = service
        .with_classifier(classifier)
        .with_device_info(Arc::new(StaticDeviceInfo::for_current_process(env!(
            "CARGO_PKG_VERSION"
        ))))
        .with_network(&monitor)
        .with_shutdown_timeout(config.shutdown_timeout);
    let service_task = tokio::spawn(service.run());

    handle.set_max_storage_size(config.max_storage_bytes).await?;

    let sessions = Arc::new(SessionTracker::new(handle.clone(), ANALYTICS_GROUP));
    handle
        .add_listener(Arc::clone(&sessions) as Arc<dyn ChannelListener>)
        .await?;

    let started = features::registry().start(&[ANALYTICS], &handle).await?;
    debug!("Started {} features", started.len());
    sessions.on_foreground();

    let result = pump_stdin(&handle, &sessions, &monitor).await;

    info!("Shutting down telemetry agent");
    handle.shutdown().await?;
    service_task.await?;
    result
}

/// Forwards stdin lines to the channel until EOF or ctrl-c.
async fn pump_stdin(
    handle: &ChannelHandle,
    sessions: &SessionTracker,
    monitor: &NetworkStateMonitor,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("cannot read stdin")?,
            result = tokio::signal::ctrl_c() => {
                result.context("cannot listen for ctrl-c")?;
                debug!("Received ctrl-c");
                return Ok(());
            }
        };
        let Some(line) = line else {
            debug!("Reached end of input");
            return Ok(());
        };

        match input::parse_line(&line) {
            Ok(None) => {}
            Ok(Some(Input::Log(log))) => handle.enqueue(log, ANALYTICS_GROUP)?,
            Ok(Some(Input::Foreground)) => sessions.on_foreground(),
            Ok(Some(Input::Background)) => sessions.on_background(),
            Ok(Some(Input::Network(connected))) => monitor.set_connected(connected),
            Ok(Some(Input::Flush(group))) => {
                let group = group.as_deref().unwrap_or(ANALYTICS_GROUP);
                if let Err(e) = handle.flush(group).await {
                    warn!("Cannot flush group {group}: {e}");
                }
            }
            Err(e) => warn!("Ignoring input line: {e}"),
        }
    }
}

/// Reads the install id kept in `dir`, creating it on first start.
async fn load_install_id(dir: &Path) -> anyhow::Result<Uuid> {
    let path = dir.join(INSTALL_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => match Uuid::parse_str(contents.trim()) {
            Ok(id) => return Ok(id),
            Err(e) => warn!("Replacing unreadable install id: {e}"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("cannot read install id"),
    }

    let id = Uuid::new_v4();
    tokio::fs::create_dir_all(dir)
        .await
        .context("cannot create storage directory")?;
    tokio::fs::write(&path, id.to_string())
        .await
        .context("cannot write install id")?;
    Ok(id)
}
