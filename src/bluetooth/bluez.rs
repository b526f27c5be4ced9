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

//! BlueZ transport implementation.

use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::constants::ProfileKind;
use super::transport::{ProfileConnector, SerialLink, SerialSocket, Transport};
use crate::error::LinkError;
use crate::events::{BluetoothEvent, EventSender, ProfileState};
use crate::state::{BondState, Device};

/// Look up the advertised name of `address`.
pub(crate) async fn describe(adapter: &Adapter, address: Address) -> Device {
    let name = match adapter.device(address) {
        Ok(device) => device.name().await.ok().flatten(),
        Err(_) => None,
    };
    Device::new(address, name)
}

/// [`Transport`] over the system BlueZ daemon.
pub struct BluezTransport {
    session: Session,
    adapter: Adapter,
    events: EventSender,
    discovery_window: Duration,
    discovery: Mutex<Option<CancellationToken>>,
    headset: Arc<BluezProfile>,
    a2dp: Arc<BluezProfile>,
}

impl BluezTransport {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(events: EventSender, discovery_window: Duration) -> Result<Self, LinkError> {
        info!("Initializing BlueZ transport...");

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self::with_adapter(session, adapter, events, discovery_window))
    }

    pub fn with_adapter(
        session: Session,
        adapter: Adapter,
        events: EventSender,
        discovery_window: Duration,
    ) -> Self {
        let profile = |kind| {
            Arc::new(BluezProfile {
                kind,
                adapter: adapter.clone(),
                events: events.clone(),
            })
        };
        let headset = profile(ProfileKind::Headset);
        let a2dp = profile(ProfileKind::A2dp);

        Self {
            session,
            adapter,
            events,
            discovery_window,
            discovery: Mutex::new(None),
            headset,
            a2dp,
        }
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn is_powered(&self) -> Result<bool, LinkError> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn is_discovering(&self) -> Result<bool, LinkError> {
        Ok(self.adapter.is_discovering().await?)
    }

    async fn start_discovery(&self) -> Result<bool, LinkError> {
        let stream = self.adapter.discover_devices().await?;

        let token = CancellationToken::new();
        if let Some(previous) = self.discovery.lock().replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let window = self.discovery_window;

        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = &mut deadline => break,
                    event = stream.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            let device = describe(&adapter, address).await;
                            events.send(BluetoothEvent::DeviceFound { device });
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }

            // Dropping the stream stops discovery.
            drop(stream);
            debug!("Discovery window closed");
            events.send(BluetoothEvent::DiscoveryFinished);
        });

        Ok(true)
    }

    async fn cancel_discovery(&self) -> Result<(), LinkError> {
        if let Some(token) = self.discovery.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn bond_state(&self, address: Address) -> Result<BondState, LinkError> {
        let device = self.adapter.device(address)?;
        if device.is_paired().await? {
            Ok(BondState::Bonded)
        } else {
            Ok(BondState::None)
        }
    }

    async fn request_bond(&self, address: Address) -> Result<(), LinkError> {
        let device = self.adapter.device(address)?;
        let events = self.events.clone();

        events.send(BluetoothEvent::BondStateChanged {
            device: Device::new(address, None),
            state: BondState::Bonding,
        });

        // Success shows up as a Paired property change.
        tokio::spawn(async move {
            if let Err(e) = device.pair().await {
                warn!("Pairing with {} failed: {}", address, e);
                events.send(BluetoothEvent::BondStateChanged {
                    device: Device::new(address, None),
                    state: BondState::None,
                });
            }
        });

        Ok(())
    }

    async fn remove_bond(&self, address: Address) -> Result<(), LinkError> {
        Ok(self.adapter.remove_device(address).await?)
    }

    async fn request_profile_proxy(
        &self,
        kind: ProfileKind,
    ) -> Result<Arc<dyn ProfileConnector>, LinkError> {
        let proxy = match kind {
            ProfileKind::Headset => self.headset.clone(),
            ProfileKind::A2dp => self.a2dp.clone(),
        };
        Ok(proxy)
    }

    async fn open_stream(
        &self,
        address: Address,
        uuid: Uuid,
    ) -> Result<Box<dyn SerialSocket>, LinkError> {
        Ok(Box::new(BluezSocket {
            session: self.session.clone(),
            adapter: self.adapter.clone(),
            address,
            uuid,
        }))
    }

    async fn bonded_devices(&self) -> Result<Vec<Device>, LinkError> {
        let mut devices = Vec::new();
        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            if device.is_paired().await? {
                devices.push(Device::new(address, device.name().await?));
            }
        }
        Ok(devices)
    }
}

/// Audio profile proxy backed by `connect_profile` / `disconnect_profile`.
struct BluezProfile {
    kind: ProfileKind,
    adapter: Adapter,
    events: EventSender,
}

#[async_trait]
impl ProfileConnector for BluezProfile {
    async fn connect(&self, device: &Device) -> Result<(), LinkError> {
        let remote = self.adapter.device(device.address)?;
        let uuid = self.kind.uuid();
        let kind = self.kind;
        let events = self.events.clone();
        let device = device.clone();

        tokio::spawn(async move {
            match remote.connect_profile(&uuid).await {
                Ok(()) => events.send(BluetoothEvent::ProfileStateChanged {
                    device,
                    state: ProfileState::Connected,
                }),
                Err(e) => debug!("{:?} connect to {} failed: {}", kind, device, e),
            }
        });

        Ok(())
    }

    async fn disconnect(&self, device: &Device) -> Result<(), LinkError> {
        let remote = self.adapter.device(device.address)?;
        remote.disconnect_profile(&self.kind.uuid()).await?;
        self.events.send(BluetoothEvent::ProfileStateChanged {
            device: device.clone(),
            state: ProfileState::Disconnected,
        });
        Ok(())
    }

    async fn connected_devices(&self) -> Result<Vec<Device>, LinkError> {
        let uuid = self.kind.uuid();
        let mut devices = Vec::new();
        for address in self.adapter.device_addresses().await? {
            let remote = self.adapter.device(address)?;
            if !remote.is_connected().await? {
                continue;
            }
            let offers_profile = remote
                .uuids()
                .await?
                .is_some_and(|uuids| uuids.contains(&uuid));
            if offers_profile {
                devices.push(Device::new(address, remote.name().await?));
            }
        }
        Ok(devices)
    }
}

/// RFCOMM client socket, connected through a BlueZ profile registration.
struct BluezSocket {
    session: Session,
    adapter: Adapter,
    address: Address,
    uuid: Uuid,
}

#[async_trait]
impl SerialSocket for BluezSocket {
    async fn connect(self: Box<Self>) -> Result<Box<dyn SerialLink>, LinkError> {
        let profile = Profile {
            uuid: self.uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = Box::pin(self.session.register_profile(profile).await?);
        let remote = self.adapter.device(self.address)?;
        let address = self.address;

        let request = async {
            while let Some(request) = handle.next().await {
                if request.device() == address {
                    return request.accept().map_err(LinkError::from);
                }
                debug!("Rejecting RFCOMM request from {}", request.device());
                request.reject(ReqError::Rejected);
            }
            Err(LinkError::Bluetooth("RFCOMM profile unregistered".to_string()))
        };
        let connect = async { remote.connect_profile(&self.uuid).await.map_err(LinkError::from) };

        let (_, stream) = tokio::try_join!(connect, request)?;
        Ok(Box::new(BluezLink {
            stream,
            _profile: handle,
        }))
    }
}

pin_project! {
    /// Connected RFCOMM stream. Keeps the profile registered while open.
    struct BluezLink {
        #[pin]
        stream: bluer::rfcomm::Stream,
        _profile: Pin<Box<ProfileHandle>>,
    }
}

impl AsyncRead for BluezLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for BluezLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
