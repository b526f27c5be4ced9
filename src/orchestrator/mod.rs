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

//! Connection orchestrator.
//!
//! A single owner task consumes inbound Bluetooth events, commands from
//! [`OrchestratorHandle`]s and reports from its own background tasks, and is
//! the only writer of the registry and the telemetry snapshot.
//!
//! Per device the status moves Idle, Pairing, Paired, Connecting, Connected,
//! or to Failed from any in-flight state. Every background operation is
//! keyed by address and stamped with an id; a report from an operation that
//! was cancelled or replaced is dropped, so a late timeout can never undo a
//! success and a late success can never revive a failed attempt.

mod pending;
mod tasks;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bluetooth::Transport;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::events::{BluetoothEvent, EventReceiver, ProfileState};
use crate::obd::is_obd2_device;
use crate::registry::DeviceRegistry;
use crate::state::{BondState, Device, DeviceStatus, LinkState, NoticeKind, StateSubscriber};

use pending::{OpKind, PendingOps};
use tasks::{Report, TaskContext};

#[derive(Debug)]
enum Command {
    StartDiscovery,
    StartDiscoveryOnce,
    Connect(Device),
    Disconnect(Device),
    SetDemoMode(bool),
    CheckConnectedDevices,
    Shutdown,
}

/// Cloneable front end to a running [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    subscriber: StateSubscriber,
}

impl OrchestratorHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Orchestrator is not running");
        }
    }

    /// Start a discovery cycle. No-op while one is running.
    pub fn start_discovery(&self) {
        self.send(Command::StartDiscovery);
    }

    /// Start discovery the first time this is called, never again.
    pub fn start_discovery_once(&self) {
        self.send(Command::StartDiscoveryOnce);
    }

    pub fn connect_to_device(&self, device: Device) {
        self.send(Command::Connect(device));
    }

    /// Disconnect all profiles of `device` and remove its bond.
    pub fn disconnect_device(&self, device: Device) {
        self.send(Command::Disconnect(device));
    }

    pub fn set_demo_mode(&self, enabled: bool) {
        self.send(Command::SetDemoMode(enabled));
    }

    /// Adopt devices that are already connected or bonded.
    pub fn check_connected_devices(&self) {
        self.send(Command::CheckConnectedDevices);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn subscriber(&self) -> &StateSubscriber {
        &self.subscriber
    }
}

/// The connection state machine.
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    config: Arc<LinkConfig>,
    state: LinkState,
    registry: DeviceRegistry,
    pending: PendingOps,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports: mpsc::UnboundedReceiver<Report>,
    demo: Option<CancellationToken>,
    demo_generation: u64,
    discovery_started_once: bool,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        events: EventReceiver,
    ) -> (Self, OrchestratorHandle) {
        let state = LinkState::new();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();

        let handle = OrchestratorHandle {
            commands: commands_tx,
            subscriber: state.subscriber(),
        };

        let orchestrator = Self {
            transport,
            config: Arc::new(config),
            state,
            registry: DeviceRegistry::new(),
            pending: PendingOps::new(),
            events,
            commands,
            reports_tx,
            reports,
            demo: None,
            demo_generation: 0,
            discovery_started_once: false,
        };

        (orchestrator, handle)
    }

    /// Create an orchestrator and run it on a new task.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
        events: EventReceiver,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(transport, config, events);
        let task = tokio::spawn(orchestrator.run());
        (handle, task)
    }

    /// Dispatch loop. Returns after shutdown or once every handle is gone.
    pub async fn run(mut self) {
        info!("Orchestrator started");

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event).await,
                Some(report) = self.reports.recv() => self.handle_report(report),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        self.shutdown().await;
        info!("Orchestrator stopped");
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            transport: self.transport.clone(),
            config: self.config.clone(),
            reports: self.reports_tx.clone(),
            demo_mode: self.state.demo_mode_receiver(),
        }
    }

    fn is_obd(&self, device: &Device) -> bool {
        is_obd2_device(device, &self.config.obd_keywords)
    }

    /// Fill in the name from the registry when an event did not carry one.
    fn resolve(&self, device: Device) -> Device {
        if device.name.is_some() {
            return device;
        }
        self.registry.device(&device.address).unwrap_or(device)
    }

    fn set_status(&mut self, device: &Device, status: DeviceStatus) {
        info!("{} -> {}", device, status.as_str());
        let snapshot = self.registry.upsert(device.clone(), status);
        self.state.publish_registry(snapshot);
    }

    fn set_connected(&mut self, device: Option<Device>) {
        let snapshot = self.registry.set_connected(device);
        self.state.publish_registry(snapshot);
    }

    fn zero_unless_demo(&self, lost: NoticeKind) {
        if self.state.is_demo_mode() {
            return;
        }
        info!("OBD2 link lost, telemetry reset");
        self.state.zero_telemetry();
        self.state.notify(lost);
    }

    fn report_error(&self, action: &str, error: LinkError) {
        match error {
            LinkError::PermissionDenied(_) => {
                warn!("Cannot {}: {}", action, error);
                self.state.notify(NoticeKind::PermissionDenied {
                    detail: error.to_string(),
                });
            }
            LinkError::AdapterOff => info!("Cannot {}: {}", action, error),
            _ => error!("Failed to {}: {}", action, error),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::StartDiscovery => self.start_discovery().await,
            Command::StartDiscoveryOnce => {
                if self.discovery_started_once {
                    debug!("Discovery already started once, skipping");
                } else {
                    self.discovery_started_once = true;
                    self.start_discovery().await;
                }
            }
            Command::Connect(device) => self.connect_to_device(device),
            Command::Disconnect(device) => self.disconnect_device(device),
            Command::SetDemoMode(enabled) => self.set_demo_mode(enabled),
            Command::CheckConnectedDevices => {
                info!("Checking already connected devices");
                tokio::spawn(tasks::reconcile(self.task_context()));
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: BluetoothEvent) {
        debug!("Event: {:?}", event);
        match event {
            BluetoothEvent::AdapterPowerChanged { powered: true } => {
                info!("Bluetooth adapter turned on, starting discovery");
                self.start_discovery().await;
            }
            BluetoothEvent::AdapterPowerChanged { powered: false } => self.radio_off(),
            BluetoothEvent::DeviceFound { device } => {
                if device.name.is_none() || self.registry.contains(&device.address) {
                    return;
                }
                info!("Found {}", device);
                self.set_status(&device, DeviceStatus::Idle);
            }
            BluetoothEvent::BondStateChanged { device, state } => {
                let device = self.resolve(device);
                self.on_bond_state(device, state);
            }
            BluetoothEvent::LinkConnected { device } => {
                let device = self.resolve(device);
                debug!("Link up: {}", device);
                if self.is_obd(&device) {
                    self.connect_to_obd2(device);
                }
            }
            BluetoothEvent::LinkDisconnected { device } => {
                let device = self.resolve(device);
                debug!("Link down: {}", device);
                if self.is_obd(&device) {
                    self.on_obd_link_lost(device);
                }
            }
            BluetoothEvent::ProfileStateChanged { device, state } => {
                let device = self.resolve(device);
                match state {
                    ProfileState::Connected => self.on_profile_connected(device),
                    ProfileState::Disconnected => self.on_profile_disconnected(device),
                }
            }
            BluetoothEvent::DiscoveryFinished => {
                info!("Discovery finished");
                self.state.set_discovering(false);
            }
        }
    }

    async fn start_discovery(&mut self) {
        match self.transport.is_powered().await {
            Ok(true) => {}
            Ok(false) => return self.report_error("start discovery", LinkError::AdapterOff),
            Err(e) => return self.report_error("query adapter power", e),
        }

        match self.transport.is_discovering().await {
            Ok(true) => {
                debug!("Discovery already running");
                self.state.set_discovering(true);
                return;
            }
            Ok(false) => {}
            Err(e) => return self.report_error("query discovery state", e),
        }

        let snapshot = self.registry.clear_entries();
        self.state.publish_registry(snapshot);

        match self.transport.start_discovery().await {
            Ok(true) => {
                info!("Discovery started");
                self.state.set_discovering(true);
            }
            Ok(false) => {
                warn!("Adapter refused to start discovery");
                self.state.set_discovering(false);
            }
            Err(e) => self.report_error("start discovery", e),
        }
    }

    fn radio_off(&mut self) {
        info!("Bluetooth adapter turned off");
        let lost = self.registry.connected().cloned();

        self.pending.cancel_all();
        let snapshot = self.registry.clear();
        self.state.publish_registry(snapshot);
        self.state.set_discovering(false);

        if let Some(device) = lost {
            if self.is_obd(&device) {
                self.zero_unless_demo(NoticeKind::ConnectionLost { device });
            }
        }
    }

    fn connect_to_device(&mut self, device: Device) {
        let device = self.resolve(device);
        if self.is_obd(&device) {
            info!("{} looks like an OBD2 adapter, skipping bonding", device);
            self.start_obd2(device);
            return;
        }

        self.pending.cancel(&device.address);

        let previous = self
            .registry
            .connected()
            .filter(|connected| connected.address != device.address)
            .cloned();
        if let Some(previous) = &previous {
            self.detach(previous);
        }

        self.set_status(&device, DeviceStatus::Pairing);
        let ctx = self.task_context();
        self.pending.start(device.address, OpKind::Connect, move |op| {
            tasks::connect_attempt(ctx, device, previous, op)
        });
    }

    fn connect_to_profile(&mut self, device: Device) {
        self.set_status(&device, DeviceStatus::Connecting);
        let ctx = self.task_context();
        self.pending.start(device.address, OpKind::Profile, move |op| {
            tasks::connect_profiles(ctx, device, op)
        });
    }

    /// Event-driven handshake start; leaves a running handshake alone.
    fn connect_to_obd2(&mut self, device: Device) {
        if self.pending.kind_of(&device.address) == Some(OpKind::Obd) {
            debug!("OBD2 handshake with {} already in progress", device);
            return;
        }
        self.start_obd2(device);
    }

    /// Start the handshake, replacing any operation running for the address.
    fn start_obd2(&mut self, device: Device) {
        if self.registry.is_connected_device(&device.address) {
            debug!("{} is already connected", device);
            return;
        }
        if self.state.is_demo_mode() {
            info!("Demo mode holds telemetry, not connecting to {}", device);
            return;
        }

        self.set_status(&device, DeviceStatus::Connecting);
        let ctx = self.task_context();
        self.pending.start(device.address, OpKind::Obd, move |op| {
            tasks::obd_session(ctx, device, op)
        });
    }

    /// Drop local state for `device`: its operation, the connected
    /// reference and, for the OBD2 target, the telemetry.
    fn detach(&mut self, device: &Device) {
        self.pending.cancel(&device.address);

        let was_connected = self.registry.is_connected_device(&device.address);
        if was_connected {
            self.set_connected(None);
        }
        if self.registry.contains(&device.address) {
            self.set_status(device, DeviceStatus::Idle);
        }
        if was_connected && self.is_obd(device) {
            self.zero_unless_demo(NoticeKind::ConnectionLost {
                device: device.clone(),
            });
        }
    }

    fn disconnect_device(&mut self, device: Device) {
        let device = self.resolve(device);
        info!("Disconnecting {}", device);
        self.detach(&device);

        let ctx = self.task_context();
        self.pending.start(device.address, OpKind::Release, move |op| {
            tasks::release(ctx, device, op)
        });
    }

    fn on_bond_state(&mut self, device: Device, state: BondState) {
        let live = self.pending.kind_of(&device.address);
        match state {
            BondState::Bonding => debug!("Bonding with {}", device),
            BondState::Bonded => match live {
                Some(OpKind::Connect) => {
                    self.set_status(&device, DeviceStatus::Paired);
                    self.connect_to_profile(device);
                }
                Some(kind) => debug!("Bond with {} during {:?}, ignored", device, kind),
                None => match self.registry.status(&device.address) {
                    Some(DeviceStatus::Failed) => {
                        info!("Ignoring late bond with {}: attempt already failed", device);
                    }
                    Some(DeviceStatus::Connected) => {}
                    _ => {
                        info!("{} bonded, connecting", device);
                        self.connect_to_device(device);
                    }
                },
            },
            BondState::None => {
                if live == Some(OpKind::Connect) {
                    warn!("Bonding with {} was rejected", device);
                    self.pending.cancel(&device.address);
                    self.fail(
                        &device,
                        NoticeKind::AttemptFailed {
                            device: device.clone(),
                            reason: "bonding rejected".to_string(),
                        },
                    );
                } else {
                    debug!("Bond with {} removed", device);
                }
            }
        }
    }

    fn on_profile_connected(&mut self, device: Device) {
        let live = self.pending.kind_of(&device.address);
        if live.is_none() && self.registry.status(&device.address) == Some(DeviceStatus::Failed) {
            info!("Ignoring late profile connection of {}: attempt already failed", device);
            return;
        }

        if self.is_obd(&device) {
            self.connect_to_obd2(device);
            return;
        }

        self.pending.cancel(&device.address);
        self.set_status(&device, DeviceStatus::Connected);
        self.set_connected(Some(device));
    }

    fn on_profile_disconnected(&mut self, device: Device) {
        let was_connected = self.registry.is_connected_device(&device.address);

        if self.registry.contains(&device.address)
            && self.registry.status(&device.address) != Some(DeviceStatus::Failed)
        {
            self.set_status(&device, DeviceStatus::Idle);
        }

        if !was_connected {
            return;
        }

        self.set_connected(None);
        if self.pending.kind_of(&device.address) == Some(OpKind::Obd) {
            self.pending.cancel(&device.address);
        }
        if self.is_obd(&device) {
            self.zero_unless_demo(NoticeKind::ConnectionLost { device });
        }
    }

    fn on_obd_link_lost(&mut self, device: Device) {
        let was_connected = self.registry.is_connected_device(&device.address);
        let had_loop = self.pending.kind_of(&device.address) == Some(OpKind::Obd);
        if !was_connected && !had_loop {
            return;
        }

        if had_loop {
            self.pending.cancel(&device.address);
        }
        if was_connected {
            self.set_connected(None);
        }
        if self.registry.status(&device.address) != Some(DeviceStatus::Failed) {
            self.set_status(&device, DeviceStatus::Idle);
        }
        self.zero_unless_demo(NoticeKind::ObdDisconnected { device });
    }

    /// Mark the current attempt for `device` failed.
    fn fail(&mut self, device: &Device, notice: NoticeKind) {
        error!("Connection attempt for {} failed", device);
        self.set_status(device, DeviceStatus::Failed);
        if self.registry.is_connected_device(&device.address) {
            self.set_connected(None);
        }
        self.state.notify(notice);
    }

    fn set_demo_mode(&mut self, enabled: bool) {
        if enabled == self.state.is_demo_mode() {
            debug!("Demo mode already {}", if enabled { "on" } else { "off" });
            return;
        }

        info!("Demo mode {}", if enabled { "enabled" } else { "disabled" });
        self.state.set_demo_mode(enabled);
        self.state.zero_telemetry();

        if let Some(token) = self.demo.take() {
            token.cancel();
        }
        if enabled {
            self.demo_generation += 1;
            let token = CancellationToken::new();
            tokio::spawn(tasks::demo_generator(
                self.reports_tx.clone(),
                self.config.demo_interval,
                self.demo_generation,
                token.clone(),
            ));
            self.demo = Some(token);
        }
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Demo {
                generation,
                telemetry,
            } => {
                if self.state.is_demo_mode() && generation == self.demo_generation {
                    debug!(target: "telemetry", demo = true, rpm = telemetry.rpm,
                        speed_kmh = telemetry.speed_kmh, coolant_temp_c = telemetry.coolant_temp_c);
                    self.state.publish_telemetry(telemetry);
                }
            }
            Report::Reconciled {
                profile_connected,
                bonded,
            } => self.apply_reconciliation(profile_connected, bonded),
            Report::BondPresent { device, op } => {
                if self.is_stale(&device, op) {
                    return;
                }
                self.set_status(&device, DeviceStatus::Paired);
                self.connect_to_profile(device);
            }
            Report::AttemptFailed {
                device,
                op,
                reason,
                permission_denied,
            } => {
                if self.is_stale(&device, op) {
                    return;
                }
                self.pending.finish(&device.address, op);
                warn!("Attempt for {} failed: {}", device, reason);
                let notice = if permission_denied {
                    NoticeKind::PermissionDenied { detail: reason }
                } else {
                    NoticeKind::AttemptFailed {
                        device: device.clone(),
                        reason,
                    }
                };
                self.fail(&device, notice);
            }
            Report::WatchdogExpired { device, op } => {
                if self.is_stale(&device, op) {
                    return;
                }
                self.pending.finish(&device.address, op);
                if self.registry.status(&device.address) == Some(DeviceStatus::Connecting) {
                    warn!("Profile connection to {} timed out", device);
                    self.fail(
                        &device,
                        NoticeKind::AttemptFailed {
                            device: device.clone(),
                            reason: format!(
                                "no profile connected within {:?}",
                                self.config.profile_watchdog
                            ),
                        },
                    );
                }
            }
            Report::ObdReady { device, op } => {
                if self.is_stale(&device, op) {
                    return;
                }
                let displaced = self
                    .registry
                    .connected()
                    .filter(|connected| connected.address != device.address)
                    .cloned();
                if let Some(previous) = displaced {
                    info!("{} takes over from {}", device, previous);
                    self.pending.cancel(&previous.address);
                    if self.registry.contains(&previous.address) {
                        self.set_status(&previous, DeviceStatus::Idle);
                    }
                }
                self.set_status(&device, DeviceStatus::Connected);
                self.set_connected(Some(device));
            }
            Report::ObdTelemetry {
                device,
                op,
                telemetry,
            } => {
                if self.is_stale(&device, op)
                    || self.state.is_demo_mode()
                    || !self.registry.is_connected_device(&device.address)
                {
                    return;
                }
                debug!(target: "telemetry", demo = false, rpm = telemetry.rpm,
                    speed_kmh = telemetry.speed_kmh, coolant_temp_c = telemetry.coolant_temp_c);
                self.state.publish_telemetry(telemetry);
            }
            Report::ObdYielded { device, op } => {
                if self.is_stale(&device, op) {
                    return;
                }
                self.pending.finish(&device.address, op);
                if self.registry.is_connected_device(&device.address) {
                    self.set_connected(None);
                }
                self.set_status(&device, DeviceStatus::Idle);
            }
            Report::ObdFailed {
                device,
                op,
                reason,
                permission_denied,
            } => {
                if self.is_stale(&device, op) {
                    return;
                }
                self.pending.finish(&device.address, op);
                error!("OBD2 link to {} failed: {}", device, reason);
                self.set_status(&device, DeviceStatus::Failed);
                if self.registry.is_connected_device(&device.address) {
                    self.set_connected(None);
                }
                if permission_denied {
                    self.state
                        .notify(NoticeKind::PermissionDenied { detail: reason });
                }
                self.zero_unless_demo(NoticeKind::ConnectionLost { device });
            }
            Report::Released { device, op } => {
                if !self.is_stale(&device, op) {
                    info!("Released {}", device);
                    self.pending.finish(&device.address, op);
                }
            }
        }
    }

    fn is_stale(&self, device: &Device, op: pending::OpId) -> bool {
        let stale = !self.pending.is_current(&device.address, op);
        if stale {
            debug!("Dropping result of superseded operation #{} for {}", op, device);
        }
        stale
    }

    fn apply_reconciliation(&mut self, profile_connected: Vec<Device>, bonded: Vec<Device>) {
        for device in profile_connected {
            let device = self.resolve(device);
            info!("{} is already connected", device);
            if self.is_obd(&device) {
                self.connect_to_obd2(device);
            } else {
                self.set_status(&device, DeviceStatus::Connected);
                self.set_connected(Some(device));
            }
        }

        for device in bonded {
            if self.is_obd(&device) {
                info!("Found bonded OBD2 adapter {}", device);
                self.connect_to_obd2(device);
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down orchestrator");
        if let Err(e) = self.transport.cancel_discovery().await {
            debug!("Could not cancel discovery: {}", e);
        }
        self.pending.cancel_all();
        if let Some(token) = self.demo.take() {
            token.cancel();
        }
        self.state.set_discovering(false);
    }
}
