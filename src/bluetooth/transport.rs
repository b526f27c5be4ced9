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

//! Platform Bluetooth capabilities used by the orchestrator.
//!
//! Everything asynchronous the platform reports (bond changes, profile
//! changes, discovered devices) arrives as a [`BluetoothEvent`] on the
//! event queue, not through these traits.
//!
//! [`BluetoothEvent`]: crate::events::BluetoothEvent

use async_trait::async_trait;
use bluer::Address;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::constants::ProfileKind;
use crate::error::LinkError;
use crate::state::{BondState, Device};

/// A connected bidirectional byte stream.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SerialLink for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An RFCOMM socket that has been created but not yet connected.
#[async_trait]
pub trait SerialSocket: Send {
    async fn connect(self: Box<Self>) -> Result<Box<dyn SerialLink>, LinkError>;
}

/// Proxy for one audio profile.
#[async_trait]
pub trait ProfileConnector: Send + Sync {
    /// Ask the platform to connect the profile.
    ///
    /// Returns once the request is issued; the outcome arrives as a
    /// profile state event.
    async fn connect(&self, device: &Device) -> Result<(), LinkError>;

    async fn disconnect(&self, device: &Device) -> Result<(), LinkError>;

    /// Devices this profile currently has connected.
    async fn connected_devices(&self) -> Result<Vec<Device>, LinkError>;
}

/// Adapter-level operations.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn is_powered(&self) -> Result<bool, LinkError>;

    async fn is_discovering(&self) -> Result<bool, LinkError>;

    /// Start one discovery cycle. `Ok(false)` means the platform refused.
    async fn start_discovery(&self) -> Result<bool, LinkError>;

    async fn cancel_discovery(&self) -> Result<(), LinkError>;

    async fn bond_state(&self, address: Address) -> Result<BondState, LinkError>;

    /// Start bonding. Completion is reported as a bond state event.
    async fn request_bond(&self, address: Address) -> Result<(), LinkError>;

    async fn remove_bond(&self, address: Address) -> Result<(), LinkError>;

    async fn request_profile_proxy(
        &self,
        kind: ProfileKind,
    ) -> Result<Arc<dyn ProfileConnector>, LinkError>;

    /// Create an RFCOMM socket to the service `uuid` on `address`.
    async fn open_stream(
        &self,
        address: Address,
        uuid: Uuid,
    ) -> Result<Box<dyn SerialSocket>, LinkError>;

    async fn bonded_devices(&self) -> Result<Vec<Device>, LinkError>;
}
