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

//! Shared data model and published state.

use bluer::Address;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::registry::RegistrySnapshot;

/// Platform bond (pairing) state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A remote Bluetooth device as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    #[serde(serialize_with = "serialize_address")]
    pub address: Address,
    pub name: Option<String>,
}

impl Device {
    pub fn new(address: Address, name: Option<String>) -> Self {
        Self { address, name }
    }

    pub fn named(address: Address, name: impl Into<String>) -> Self {
        Self {
            address,
            name: Some(name.into()),
        }
    }

    /// Name for log lines.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

pub(crate) fn serialize_address<S: serde::Serializer>(
    address: &Address,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(address)
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.address)
    }
}

/// Connection status of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    Idle,
    Pairing,
    Paired,
    Connecting,
    Connected,
    Failed,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Idle => "Idle",
            DeviceStatus::Pairing => "Pairing...",
            DeviceStatus::Paired => "Paired",
            DeviceStatus::Connecting => "Connecting...",
            DeviceStatus::Connected => "Connected",
            DeviceStatus::Failed => "Failed",
        }
    }
}

/// Vehicle telemetry snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    pub rpm: i32,
    pub speed_kmh: i32,
    pub coolant_temp_c: i32,
}

impl Telemetry {
    pub const ZERO: Telemetry = Telemetry {
        rpm: 0,
        speed_kmh: 0,
        coolant_temp_c: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// What a user-visible notice is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    /// The OBD2 link failed or was released while hardware owned telemetry.
    ConnectionLost { device: Device },
    /// The OBD2 adapter dropped its baseband link.
    ObdDisconnected { device: Device },
    /// A Bluetooth capability is not granted.
    PermissionDenied { detail: String },
    /// A connection attempt ended in Failed.
    AttemptFailed { device: Device, reason: String },
}

/// A message meant for the user, e.g. a toast.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub at: DateTime<Local>,
    #[serde(flatten)]
    pub kind: NoticeKind,
}

impl Notice {
    pub fn new(kind: NoticeKind) -> Self {
        Self {
            at: Local::now(),
            kind,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NoticeKind::ConnectionLost { device } => {
                write!(f, "Connection lost: {}", device.label())
            }
            NoticeKind::ObdDisconnected { device } => {
                write!(f, "OBD2 device disconnected: {}", device.label())
            }
            NoticeKind::PermissionDenied { detail } => {
                write!(f, "Bluetooth permission required: {}", detail)
            }
            NoticeKind::AttemptFailed { device, reason } => {
                write!(f, "Could not connect to {}: {}", device.label(), reason)
            }
        }
    }
}

/// Published link state.
///
/// The orchestrator holds the only `LinkState` with write access; consumers
/// get receivers and only ever observe whole, immutable snapshots.
#[derive(Debug)]
pub struct LinkState {
    telemetry: watch::Sender<Telemetry>,
    registry: watch::Sender<Arc<RegistrySnapshot>>,
    discovering: watch::Sender<bool>,
    demo_mode: watch::Sender<bool>,
    notices: broadcast::Sender<Notice>,
}

impl Default for LinkState {
    fn default() -> Self {
        let (telemetry, _) = watch::channel(Telemetry::ZERO);
        let (registry, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        let (discovering, _) = watch::channel(false);
        let (demo_mode, _) = watch::channel(false);
        let (notices, _) = broadcast::channel(32);
        Self {
            telemetry,
            registry,
            discovering,
            demo_mode,
            notices,
        }
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view for consumers.
    pub fn subscriber(&self) -> StateSubscriber {
        StateSubscriber {
            telemetry: self.telemetry.subscribe(),
            registry: self.registry.subscribe(),
            discovering: self.discovering.subscribe(),
            demo_mode: self.demo_mode.subscribe(),
            notices: self.notices.clone(),
        }
    }

    pub(crate) fn publish_telemetry(&self, snapshot: Telemetry) {
        self.telemetry.send_replace(snapshot);
    }

    pub(crate) fn zero_telemetry(&self) {
        self.telemetry.send_replace(Telemetry::ZERO);
    }

    pub(crate) fn publish_registry(&self, snapshot: Arc<RegistrySnapshot>) {
        self.registry.send_replace(snapshot);
    }

    pub(crate) fn set_discovering(&self, discovering: bool) {
        self.discovering.send_if_modified(|current| {
            let changed = *current != discovering;
            *current = discovering;
            changed
        });
    }

    pub(crate) fn set_demo_mode(&self, enabled: bool) {
        self.demo_mode.send_replace(enabled);
    }

    pub(crate) fn notify(&self, kind: NoticeKind) {
        let notice = Notice::new(kind);
        tracing::info!("Notice: {}", notice);
        // No receivers is fine: nobody is showing toasts right now.
        let _ = self.notices.send(notice);
    }

    pub fn telemetry(&self) -> Telemetry {
        *self.telemetry.borrow()
    }

    pub fn is_demo_mode(&self) -> bool {
        *self.demo_mode.borrow()
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.borrow()
    }

    pub(crate) fn demo_mode_receiver(&self) -> watch::Receiver<bool> {
        self.demo_mode.subscribe()
    }
}

/// Consumer side of [`LinkState`].
#[derive(Debug, Clone)]
pub struct StateSubscriber {
    telemetry: watch::Receiver<Telemetry>,
    registry: watch::Receiver<Arc<RegistrySnapshot>>,
    discovering: watch::Receiver<bool>,
    demo_mode: watch::Receiver<bool>,
    notices: broadcast::Sender<Notice>,
}

impl StateSubscriber {
    pub fn telemetry(&self) -> watch::Receiver<Telemetry> {
        self.telemetry.clone()
    }

    pub fn registry(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.registry.clone()
    }

    pub fn discovering(&self) -> watch::Receiver<bool> {
        self.discovering.clone()
    }

    pub fn demo_mode(&self) -> watch::Receiver<bool> {
        self.demo_mode.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn current_telemetry(&self) -> Telemetry {
        *self.telemetry.borrow()
    }

    pub fn current_registry(&self) -> Arc<RegistrySnapshot> {
        self.registry.borrow().clone()
    }
}
