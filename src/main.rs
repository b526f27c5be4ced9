// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ReDrive link daemon
//!
//! Prints telemetry snapshots to stdout as JSON lines; logs go to stderr.

use anyhow::Result;
use bluer::Address;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redrive_link::bluetooth::{BluezTransport, EventBridge};
use redrive_link::obd::is_obd2_device;
use redrive_link::{events, Config, DeviceStatus, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.filter.parse()?),
        )
        .init();

    info!("Starting ReDrive link v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", Config::default_path().display());

    let (events_tx, events_rx) = events::channel();
    let transport = BluezTransport::new(events_tx.clone(), config.discovery_window()).await?;

    let cancel = CancellationToken::new();
    let bridge = EventBridge::new(transport.adapter().clone(), events_tx);
    let bridge_task = tokio::spawn(bridge.run(cancel.clone()));

    let (handle, orchestrator) =
        Orchestrator::spawn(Arc::new(transport), config.link_config(), events_rx);

    if config.demo.enabled {
        handle.set_demo_mode(true);
    }
    handle.check_connected_devices();
    handle.start_discovery_once();

    let subscriber = handle.subscriber().clone();
    let mut telemetry = subscriber.telemetry();
    let mut registry = subscriber.registry();
    let mut notices = subscriber.notices();
    let mut auto_connected: HashSet<Address> = HashSet::new();

    info!("Ready.");

    loop {
        tokio::select! {
            Ok(()) = telemetry.changed() => {
                let snapshot = *telemetry.borrow_and_update();
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            Ok(()) = registry.changed() => {
                let snapshot = registry.borrow_and_update().clone();
                for entry in snapshot.sorted() {
                    debug!("  {} [{}]", entry.device, entry.status.as_str());
                }
                for entry in snapshot.sorted() {
                    if config.bluetooth.auto_connect_obd
                        && entry.status == DeviceStatus::Idle
                        && is_obd2_device(&entry.device, &config.bluetooth.obd_keywords)
                        && auto_connected.insert(entry.device.address)
                    {
                        info!("Auto-connecting to OBD2 adapter {}", entry.device);
                        handle.connect_to_device(entry.device.clone());
                    }
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => warn!("{}", notice),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} notices", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown();
    cancel.cancel();

    if let Err(e) = orchestrator.await {
        error!("Orchestrator task failed: {}", e);
    }
    match bridge_task.await {
        Ok(Err(e)) => error!("Event bridge failed: {}", e),
        Err(e) => error!("Event bridge task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("ReDrive link stopped");
    Ok(())
}
