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

//! Discovered-device registry.

use bluer::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::state::{Device, DeviceStatus};

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEntry {
    pub device: Device,
    pub status: DeviceStatus,
}

/// Immutable view of the registry handed to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub devices: HashMap<Address, DeviceEntry>,
    pub connected: Option<Device>,
}

impl RegistrySnapshot {
    pub fn status(&self, address: &Address) -> Option<DeviceStatus> {
        self.devices.get(address).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Entries sorted by address, for stable display.
    pub fn sorted(&self) -> Vec<&DeviceEntry> {
        let mut entries: Vec<_> = self.devices.values().collect();
        entries.sort_by_key(|entry| entry.device.address.0);
        entries
    }
}

/// Device registry: address to status, plus the connected-device reference.
///
/// Written only by the orchestrator. Every mutation produces a new
/// [`RegistrySnapshot`]; readers never see a half-applied change.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    current: Arc<RegistrySnapshot>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one entry, keeping all others.
    pub fn upsert(&mut self, device: Device, status: DeviceStatus) -> Arc<RegistrySnapshot> {
        debug!("Registry: {} -> {:?}", device, status);
        let mut next = (*self.current).clone();
        next.devices
            .insert(device.address, DeviceEntry { device, status });
        self.replace(next)
    }

    /// Drop every entry and the connected-device reference together.
    pub fn clear(&mut self) -> Arc<RegistrySnapshot> {
        debug!("Registry cleared");
        self.replace(RegistrySnapshot::default())
    }

    /// Drop every entry but keep the connected-device reference.
    pub fn clear_entries(&mut self) -> Arc<RegistrySnapshot> {
        debug!("Registry entries cleared for a new discovery cycle");
        let next = RegistrySnapshot {
            devices: HashMap::new(),
            connected: self.current.connected.clone(),
        };
        self.replace(next)
    }

    pub fn set_connected(&mut self, device: Option<Device>) -> Arc<RegistrySnapshot> {
        let mut next = (*self.current).clone();
        next.connected = device;
        self.replace(next)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.clone()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.current.devices.contains_key(address)
    }

    pub fn status(&self, address: &Address) -> Option<DeviceStatus> {
        self.current.status(address)
    }

    pub fn connected(&self) -> Option<&Device> {
        self.current.connected.as_ref()
    }

    pub fn is_connected_device(&self, address: &Address) -> bool {
        self.connected().map(|d| &d.address) == Some(address)
    }

    /// Best known record for an address (registry entry or connected device).
    pub fn device(&self, address: &Address) -> Option<Device> {
        self.current
            .devices
            .get(address)
            .map(|entry| entry.device.clone())
            .or_else(|| {
                self.current
                    .connected
                    .as_ref()
                    .filter(|d| &d.address == address)
                    .cloned()
            })
    }

    fn replace(&mut self, next: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        self.current = Arc::new(next);
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(last: u8, name: &str) -> Device {
        Device::named(Address::new([0x00, 0x1D, 0xA5, 0x00, 0x00, last]), name)
    }

    #[test]
    fn test_upsert_preserves_others() {
        let mut registry = DeviceRegistry::new();
        let a = device(1, "OBDII");
        let b = device(2, "Headphones");

        registry.upsert(a.clone(), DeviceStatus::Idle);
        registry.upsert(b.clone(), DeviceStatus::Idle);
        registry.upsert(a.clone(), DeviceStatus::Connecting);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.status(&a.address), Some(DeviceStatus::Connecting));
        assert_eq!(snapshot.status(&b.address), Some(DeviceStatus::Idle));
    }

    #[test]
    fn test_snapshot_is_stable() {
        let mut registry = DeviceRegistry::new();
        let a = device(1, "OBDII");

        let before = registry.upsert(a.clone(), DeviceStatus::Idle);
        registry.upsert(a.clone(), DeviceStatus::Failed);

        assert_eq!(before.status(&a.address), Some(DeviceStatus::Idle));
        assert_eq!(registry.status(&a.address), Some(DeviceStatus::Failed));
    }

    #[test]
    fn test_clear_drops_connected_device() {
        let mut registry = DeviceRegistry::new();
        let a = device(1, "OBDII");
        registry.upsert(a.clone(), DeviceStatus::Connected);
        registry.set_connected(Some(a.clone()));

        let snapshot = registry.clear();
        assert!(snapshot.is_empty());
        assert!(snapshot.connected.is_none());
    }

    #[test]
    fn test_clear_entries_keeps_connected_device() {
        let mut registry = DeviceRegistry::new();
        let a = device(1, "OBDII");
        registry.upsert(a.clone(), DeviceStatus::Connected);
        registry.set_connected(Some(a.clone()));

        let snapshot = registry.clear_entries();
        assert!(snapshot.is_empty());
        assert!(registry.is_connected_device(&a.address));
        assert_eq!(registry.device(&a.address), Some(a));
    }

    #[test]
    fn test_sorted_entries() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(device(9, "B"), DeviceStatus::Idle);
        registry.upsert(device(3, "A"), DeviceStatus::Idle);

        let snapshot = registry.snapshot();
        let names: Vec<_> = snapshot
            .sorted()
            .iter()
            .map(|e| e.device.label().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
