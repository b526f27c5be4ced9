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

//! Inbound system events.

use tokio::sync::mpsc;
use tracing::warn;

use crate::state::{BondState, Device};

/// Connection state reported for an audio profile (Headset, A2DP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Connected,
    Disconnected,
}

/// Events delivered by the platform to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothEvent {
    /// Adapter radio turned on or off.
    AdapterPowerChanged { powered: bool },
    /// Discovery reported a device.
    DeviceFound { device: Device },
    /// Bond (pairing) state of a device changed.
    BondStateChanged { device: Device, state: BondState },
    /// Baseband link to a device came up.
    LinkConnected { device: Device },
    /// Baseband link to a device went down.
    LinkDisconnected { device: Device },
    /// An audio profile connected or disconnected.
    ProfileStateChanged { device: Device, state: ProfileState },
    /// The current discovery cycle ended.
    DiscoveryFinished,
}

/// Sending half of the inbound event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BluetoothEvent>,
}

impl EventSender {
    /// Queue an event for the orchestrator.
    pub fn send(&self, event: BluetoothEvent) {
        if self.tx.send(event).is_err() {
            warn!("Orchestrator stopped, dropping Bluetooth event");
        }
    }
}

/// Receiving half, owned by the orchestrator.
pub type EventReceiver = mpsc::UnboundedReceiver<BluetoothEvent>;

/// Create the inbound event queue.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
