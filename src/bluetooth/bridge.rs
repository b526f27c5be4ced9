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

//! Turns BlueZ property changes into [`BluetoothEvent`]s.

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bluez::describe;
use crate::error::LinkError;
use crate::events::{BluetoothEvent, EventSender, ProfileState};
use crate::state::{BondState, Device};

/// Watches the adapter and every known device.
pub struct EventBridge {
    adapter: Adapter,
    events: EventSender,
    watchers: HashMap<Address, CancellationToken>,
}

impl EventBridge {
    pub fn new(adapter: Adapter, events: EventSender) -> Self {
        Self {
            adapter,
            events,
            watchers: HashMap::new(),
        }
    }

    /// Forward events until `cancel` fires or the adapter goes away.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), LinkError> {
        let adapter_events = self.adapter.events().await?;
        let mut adapter_events = Box::pin(adapter_events);

        for address in self.adapter.device_addresses().await? {
            self.watch(address, &cancel);
        }
        info!("Event bridge watching {} known devices", self.watchers.len());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = adapter_events.next() => match event {
                    Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered))) => {
                        self.events.send(BluetoothEvent::AdapterPowerChanged { powered });
                    }
                    Some(AdapterEvent::DeviceAdded(address)) => self.watch(address, &cancel),
                    Some(AdapterEvent::DeviceRemoved(address)) => {
                        if let Some(token) = self.watchers.remove(&address) {
                            token.cancel();
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        for (_, token) in self.watchers.drain() {
            token.cancel();
        }
        info!("Event bridge stopped");
        Ok(())
    }

    fn watch(&mut self, address: Address, cancel: &CancellationToken) {
        if self.watchers.contains_key(&address) {
            return;
        }
        let token = cancel.child_token();
        self.watchers.insert(address, token.clone());

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_device(adapter, address, events, token).await {
                debug!("Stopped watching {}: {}", address, e);
            }
        });
    }
}

async fn watch_device(
    adapter: Adapter,
    address: Address,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<(), LinkError> {
    let device_events = adapter.device(address)?.events().await?;
    let mut device_events = Box::pin(device_events);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = device_events.next() => match event {
                Some(DeviceEvent::PropertyChanged(property)) => {
                    if !is_tracked(&property) {
                        continue;
                    }
                    let device = describe(&adapter, address).await;
                    for event in map_property(device, &property) {
                        events.send(event);
                    }
                }
                #[allow(unreachable_patterns)]
                Some(_) => {}
                None => return Ok(()),
            },
        }
    }
}

fn is_tracked(property: &DeviceProperty) -> bool {
    matches!(
        property,
        DeviceProperty::Paired(_) | DeviceProperty::Connected(_)
    )
}

/// Events for one device property change.
///
/// A dropped connection is reported as link loss first and profile loss
/// second, so link handling sees the connected device before it is cleared.
fn map_property(device: Device, property: &DeviceProperty) -> Vec<BluetoothEvent> {
    match property {
        DeviceProperty::Paired(paired) => vec![BluetoothEvent::BondStateChanged {
            device,
            state: if *paired {
                BondState::Bonded
            } else {
                BondState::None
            },
        }],
        DeviceProperty::Connected(true) => vec![BluetoothEvent::LinkConnected { device }],
        DeviceProperty::Connected(false) => vec![
            BluetoothEvent::LinkDisconnected {
                device: device.clone(),
            },
            BluetoothEvent::ProfileStateChanged {
                device,
                state: ProfileState::Disconnected,
            },
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obd() -> Device {
        Device::named(Address::new([0, 0x1D, 0xA5, 0, 0, 1]), "OBDII")
    }

    #[test]
    fn test_paired_maps_to_bond_state() {
        assert_eq!(
            map_property(obd(), &DeviceProperty::Paired(true)),
            vec![BluetoothEvent::BondStateChanged {
                device: obd(),
                state: BondState::Bonded,
            }]
        );
        assert_eq!(
            map_property(obd(), &DeviceProperty::Paired(false)),
            vec![BluetoothEvent::BondStateChanged {
                device: obd(),
                state: BondState::None,
            }]
        );
    }

    #[test]
    fn test_disconnect_reports_link_before_profile() {
        let events = map_property(obd(), &DeviceProperty::Connected(false));
        assert_eq!(
            events,
            vec![
                BluetoothEvent::LinkDisconnected { device: obd() },
                BluetoothEvent::ProfileStateChanged {
                    device: obd(),
                    state: ProfileState::Disconnected,
                },
            ]
        );
    }

    #[test]
    fn test_untracked_properties() {
        assert!(!is_tracked(&DeviceProperty::Trusted(true)));
        assert!(map_property(obd(), &DeviceProperty::Trusted(true)).is_empty());
        assert_eq!(
            map_property(obd(), &DeviceProperty::Connected(true)),
            vec![BluetoothEvent::LinkConnected { device: obd() }]
        );
    }
}
