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

//! Background tasks spawned by the orchestrator.
//!
//! Tasks never touch published state. They talk to the transport and send
//! [`Report`]s back to the owner, which applies them only if the operation
//! is still live.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::OpId;
use crate::bluetooth::{ProfileKind, Transport, SPP_UUID};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::obd::{demo, ObdSession};
use crate::state::{BondState, Device, Telemetry};

/// Results sent from tasks to the orchestrator.
#[derive(Debug)]
pub(crate) enum Report {
    /// Device was already bonded; go on to the profile connection.
    BondPresent { device: Device, op: OpId },
    /// Bonding phase or profile request failed or timed out.
    AttemptFailed {
        device: Device,
        op: OpId,
        reason: String,
        permission_denied: bool,
    },
    /// Profile connection did not complete in time.
    WatchdogExpired { device: Device, op: OpId },
    /// OBD2 handshake done, polling starts.
    ObdReady { device: Device, op: OpId },
    /// One polling round finished.
    ObdTelemetry {
        device: Device,
        op: OpId,
        telemetry: Telemetry,
    },
    /// Hardware loop handed telemetry to the demo generator.
    ObdYielded { device: Device, op: OpId },
    /// Serial link failed during handshake or polling.
    ObdFailed {
        device: Device,
        op: OpId,
        reason: String,
        permission_denied: bool,
    },
    /// Profile disconnect and bond removal done.
    Released { device: Device, op: OpId },
    /// Synthetic snapshot from the demo generator.
    Demo { generation: u64, telemetry: Telemetry },
    /// Startup reconciliation results.
    Reconciled {
        profile_connected: Vec<Device>,
        bonded: Vec<Device>,
    },
}

/// What every task gets to work with.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: Arc<LinkConfig>,
    pub(crate) reports: mpsc::UnboundedSender<Report>,
    pub(crate) demo_mode: watch::Receiver<bool>,
}

impl TaskContext {
    fn report(&self, report: Report) {
        if self.reports.send(report).is_err() {
            debug!("Orchestrator gone, dropping task report");
        }
    }
}

/// Bonding phase of a connection attempt.
///
/// Releases `previous` first when switching devices. The bonding phase is
/// bounded by `connect_timeout`; when a bond has to be created the task
/// just waits, and the owner replaces it once the bond event arrives.
pub(crate) async fn connect_attempt(
    ctx: TaskContext,
    device: Device,
    previous: Option<Device>,
    op: OpId,
) {
    if let Some(previous) = previous {
        info!("Releasing {} before connecting to {}", previous, device);
        release_device(&ctx, &previous).await;
        sleep(ctx.config.switch_settle).await;
    }

    let bound = ctx.config.connect_timeout;
    let error = match timeout(bound, bond(&ctx, &device, op)).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(_) => LinkError::Timeout(bound),
    };

    ctx.report(Report::AttemptFailed {
        permission_denied: error.is_permission_denied(),
        reason: error.to_string(),
        device,
        op,
    });
}

async fn bond(ctx: &TaskContext, device: &Device, op: OpId) -> Result<(), LinkError> {
    match ctx.transport.bond_state(device.address).await? {
        BondState::Bonded => {
            debug!("{} is already bonded", device);
            ctx.report(Report::BondPresent {
                device: device.clone(),
                op,
            });
            Ok(())
        }
        BondState::Bonding | BondState::None => {
            info!("Requesting bond with {}", device);
            ctx.transport.request_bond(device.address).await?;
            std::future::pending().await
        }
    }
}

/// Ask every audio profile to connect, then arm the watchdog.
pub(crate) async fn connect_profiles(ctx: TaskContext, device: Device, op: OpId) {
    for kind in ProfileKind::ALL {
        let result = match ctx.transport.request_profile_proxy(kind).await {
            Ok(proxy) => proxy.connect(&device).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Requested {:?} connection to {}", kind, device),
            Err(e) if e.is_permission_denied() => {
                ctx.report(Report::AttemptFailed {
                    device,
                    op,
                    reason: e.to_string(),
                    permission_denied: true,
                });
                return;
            }
            Err(e) => warn!("{:?} connect to {} failed: {}", kind, device, e),
        }
    }

    sleep(ctx.config.profile_watchdog).await;
    ctx.report(Report::WatchdogExpired { device, op });
}

/// Disconnect every profile, then drop the bond if configured.
pub(crate) async fn release(ctx: TaskContext, device: Device, op: OpId) {
    release_device(&ctx, &device).await;
    ctx.report(Report::Released { device, op });
}

async fn release_device(ctx: &TaskContext, device: &Device) {
    for kind in ProfileKind::ALL {
        let result = match ctx.transport.request_profile_proxy(kind).await {
            Ok(proxy) => proxy.disconnect(device).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("{:?} disconnect from {} failed: {}", kind, device, e);
        }
    }

    if !ctx.config.unpair_previous_on_switch {
        return;
    }

    sleep(ctx.config.unpair_delay).await;
    match ctx.transport.bond_state(device.address).await {
        Ok(BondState::Bonded) => match ctx.transport.remove_bond(device.address).await {
            Ok(()) => info!("Removed bond with {}", device),
            Err(e) => warn!("Failed to remove bond with {}: {}", device, e),
        },
        Ok(_) => {}
        Err(e) => warn!("Failed to read bond state of {}: {}", device, e),
    }
}

/// OBD2 handshake followed by the polling loop.
pub(crate) async fn obd_session(ctx: TaskContext, device: Device, op: OpId) {
    match run_obd(&ctx, &device, op).await {
        Ok(()) => ctx.report(Report::ObdYielded { device, op }),
        Err(e) => ctx.report(Report::ObdFailed {
            permission_denied: e.is_permission_denied(),
            reason: e.to_string(),
            device,
            op,
        }),
    }
}

/// Returns `Ok(())` only when demo mode takes over.
async fn run_obd(ctx: &TaskContext, device: &Device, op: OpId) -> Result<(), LinkError> {
    info!("Opening serial link to {}", device);
    let socket = ctx.transport.open_stream(device.address, SPP_UUID).await?;

    if let Err(e) = ctx.transport.cancel_discovery().await {
        debug!("Could not cancel discovery before connect: {}", e);
    }

    let stream = socket.connect().await?;
    info!("Serial link to {} established", device);

    let mut session = ObdSession::new(stream, ctx.config.session);
    session.initialize().await?;
    info!("OBD2 adapter {} initialized", device);
    ctx.report(Report::ObdReady {
        device: device.clone(),
        op,
    });

    let mut demo_mode = ctx.demo_mode.clone();
    let mut last = Telemetry::ZERO;
    loop {
        let demo_on = *demo_mode.borrow_and_update();
        if demo_on {
            info!("Demo mode enabled, closing serial link to {}", device);
            return Ok(());
        }

        last = session.poll_round(last).await?;
        ctx.report(Report::ObdTelemetry {
            device: device.clone(),
            op,
            telemetry: last,
        });
        sleep(ctx.config.poll_interval).await;
    }
}

/// Reconciliation: devices already connected through a profile, and
/// bonded devices.
pub(crate) async fn reconcile(ctx: TaskContext) {
    let mut profile_connected: Vec<Device> = Vec::new();
    for kind in ProfileKind::ALL {
        let result = match ctx.transport.request_profile_proxy(kind).await {
            Ok(proxy) => proxy.connected_devices().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(devices) => {
                for device in devices {
                    if !profile_connected.iter().any(|d| d.address == device.address) {
                        profile_connected.push(device);
                    }
                }
            }
            Err(e) => warn!("Cannot list {:?} connections: {}", kind, e),
        }
    }

    let bonded = match ctx.transport.bonded_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Cannot list bonded devices: {}", e);
            Vec::new()
        }
    };

    ctx.report(Report::Reconciled {
        profile_connected,
        bonded,
    });
}

/// Publish a synthetic snapshot every `interval` until cancelled.
pub(crate) async fn demo_generator(
    reports: mpsc::UnboundedSender<Report>,
    interval: Duration,
    generation: u64,
    cancel: CancellationToken,
) {
    info!("Demo generator started");
    loop {
        let telemetry = demo::random_snapshot();
        if reports.send(Report::Demo { generation, telemetry }).is_err() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Demo generator stopped");
                return;
            }
            _ = sleep(interval) => {}
        }
    }
}
