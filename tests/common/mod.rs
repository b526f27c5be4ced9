//! Test doubles: an in-memory transport and a scripted ELM327 adapter.

#![allow(dead_code)]

use async_trait::async_trait;
use bluer::Address;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use redrive_link::bluetooth::{ProfileConnector, ProfileKind, SerialLink, SerialSocket, Transport};
use redrive_link::events::{self, BluetoothEvent, EventSender};
use redrive_link::{
    BondState, Device, DeviceStatus, LinkConfig, LinkError, Orchestrator, OrchestratorHandle,
    RegistrySnapshot, Telemetry,
};

/// Answers one command, or stays silent with `None`.
pub type Reply = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A well-behaved adapter reporting 1726 rpm, 80 km/h, 85 °C.
pub fn elm327() -> Reply {
    scripted("41 0C 1A F8", "41 0D 50", "41 05 7D")
}

/// Adapter with custom PID replies.
pub fn scripted(rpm: &'static str, speed: &'static str, coolant: &'static str) -> Reply {
    Arc::new(move |command: &str| {
        let body = match command {
            "ATZ" => "\r\rELM327 v1.5",
            "ATE0" | "ATL0" | "ATH0" | "ATSP0" => "OK",
            "010C" => rpm,
            "010D" => speed,
            "0105" => coolant,
            _ => "?",
        };
        Some(format!("{}\r\r>", body))
    })
}

fn spawn_adapter(
    mut end: DuplexStream,
    address: Address,
    reply: Reply,
    state: Arc<Mutex<FakeState>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut pending = String::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return,
                read = end.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                },
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));
            while let Some(pos) = pending.find('\r') {
                let command: String = pending.drain(..=pos).collect();
                let command = command.trim().to_string();
                state.lock().commands.push((address, command.clone()));
                if let Some(answer) = reply(&command) {
                    if end.write_all(answer.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

#[derive(Default)]
pub struct FakeState {
    pub powered: bool,
    pub discovering: bool,
    pub discovery_starts: usize,
    pub discovery_cancels: usize,
    pub bonded: HashSet<Address>,
    pub bond_requests: Vec<Address>,
    pub removed_bonds: Vec<Address>,
    pub profile_connects: Vec<(ProfileKind, Address)>,
    pub profile_disconnects: Vec<(ProfileKind, Address)>,
    pub profile_connected: HashMap<ProfileKind, Vec<Device>>,
    pub bonded_devices: Vec<Device>,
    pub adapters: HashMap<Address, Reply>,
    pub stream_opens: Vec<(Address, Uuid)>,
    /// Serial connects to these addresses never complete.
    pub stalled: HashSet<Address>,
    /// Every command an adapter received, in order.
    pub commands: Vec<(Address, String)>,
    pub links: Vec<CancellationToken>,
}

/// In-memory [`Transport`] recording every call.
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let state = FakeState {
            powered: true,
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Make `address` answer serial connections with `reply`.
    pub fn add_adapter(&self, address: Address, reply: Reply) {
        self.with(|s| s.adapters.insert(address, reply));
    }

    /// Close every open serial link from the adapter side.
    pub fn drop_serial_links(&self) {
        self.with(|s| {
            for link in s.links.drain(..) {
                link.cancel();
            }
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn is_powered(&self) -> Result<bool, LinkError> {
        Ok(self.with(|s| s.powered))
    }

    async fn is_discovering(&self) -> Result<bool, LinkError> {
        Ok(self.with(|s| s.discovering))
    }

    async fn start_discovery(&self) -> Result<bool, LinkError> {
        self.with(|s| s.discovery_starts += 1);
        Ok(true)
    }

    async fn cancel_discovery(&self) -> Result<(), LinkError> {
        self.with(|s| s.discovery_cancels += 1);
        Ok(())
    }

    async fn bond_state(&self, address: Address) -> Result<BondState, LinkError> {
        Ok(self.with(|s| {
            if s.bonded.contains(&address) {
                BondState::Bonded
            } else {
                BondState::None
            }
        }))
    }

    async fn request_bond(&self, address: Address) -> Result<(), LinkError> {
        self.with(|s| s.bond_requests.push(address));
        Ok(())
    }

    async fn remove_bond(&self, address: Address) -> Result<(), LinkError> {
        self.with(|s| {
            s.bonded.remove(&address);
            s.removed_bonds.push(address);
        });
        Ok(())
    }

    async fn request_profile_proxy(
        &self,
        kind: ProfileKind,
    ) -> Result<Arc<dyn ProfileConnector>, LinkError> {
        Ok(Arc::new(FakeProfile {
            kind,
            state: self.state.clone(),
        }))
    }

    async fn open_stream(
        &self,
        address: Address,
        uuid: Uuid,
    ) -> Result<Box<dyn SerialSocket>, LinkError> {
        let (reply, stalled) = self.with(|s| {
            s.stream_opens.push((address, uuid));
            (s.adapters.get(&address).cloned(), s.stalled.contains(&address))
        });
        Ok(Box::new(FakeSocket {
            address,
            reply,
            stalled,
            state: self.state.clone(),
        }))
    }

    async fn bonded_devices(&self) -> Result<Vec<Device>, LinkError> {
        Ok(self.with(|s| s.bonded_devices.clone()))
    }
}

struct FakeProfile {
    kind: ProfileKind,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl ProfileConnector for FakeProfile {
    async fn connect(&self, device: &Device) -> Result<(), LinkError> {
        self.state
            .lock()
            .profile_connects
            .push((self.kind, device.address));
        Ok(())
    }

    async fn disconnect(&self, device: &Device) -> Result<(), LinkError> {
        self.state
            .lock()
            .profile_disconnects
            .push((self.kind, device.address));
        Ok(())
    }

    async fn connected_devices(&self) -> Result<Vec<Device>, LinkError> {
        Ok(self
            .state
            .lock()
            .profile_connected
            .get(&self.kind)
            .cloned()
            .unwrap_or_default())
    }
}

struct FakeSocket {
    address: Address,
    reply: Option<Reply>,
    stalled: bool,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl SerialSocket for FakeSocket {
    async fn connect(self: Box<Self>) -> Result<Box<dyn SerialLink>, LinkError> {
        let FakeSocket {
            address,
            reply,
            stalled,
            state,
        } = *self;
        if stalled {
            std::future::pending::<()>().await;
        }
        let Some(reply) = reply else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no serial service").into());
        };
        let (client, adapter) = duplex(1024);
        let cancel = CancellationToken::new();
        state.lock().links.push(cancel.clone());
        spawn_adapter(adapter, address, reply, state, cancel);
        Ok(Box::new(client))
    }
}

/// A running orchestrator wired to a [`FakeTransport`].
pub struct Harness {
    pub transport: FakeTransport,
    pub events: EventSender,
    pub handle: OrchestratorHandle,
    pub task: JoinHandle<()>,
    markers: AtomicU8,
}

impl Harness {
    pub fn start() -> Self {
        Self::start_with(FakeTransport::new(), LinkConfig::default())
    }

    pub fn start_with(transport: FakeTransport, config: LinkConfig) -> Self {
        let (events, events_rx) = events::channel();
        let (handle, task) = Orchestrator::spawn(Arc::new(transport.clone()), config, events_rx);
        Self {
            transport,
            events,
            handle,
            task,
            markers: AtomicU8::new(0),
        }
    }

    pub fn send(&self, event: BluetoothEvent) {
        self.events.send(event);
    }

    pub fn registry(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.handle.subscriber().registry()
    }

    pub fn telemetry(&self) -> watch::Receiver<Telemetry> {
        self.handle.subscriber().telemetry()
    }

    /// Wait until the registry satisfies `f`.
    pub async fn wait_registry(&self, f: impl FnMut(&Arc<RegistrySnapshot>) -> bool) {
        let mut rx = self.registry();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(f))
            .await
            .expect("registry condition not reached")
            .expect("orchestrator stopped");
    }

    pub async fn wait_status(&self, address: Address, status: DeviceStatus) {
        self.wait_registry(|r| r.status(&address) == Some(status))
            .await;
    }

    pub async fn wait_telemetry(&self, f: impl FnMut(&Telemetry) -> bool) {
        let mut rx = self.telemetry();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(f))
            .await
            .expect("telemetry condition not reached")
            .expect("orchestrator stopped");
    }

    /// Returns once every event sent before it has been handled.
    pub async fn sync(&self) {
        let n = self.markers.fetch_add(1, Ordering::Relaxed);
        let marker = Device::named(Address::new([0xFE, 0, 0, 0, 0, n]), "sync-marker");
        let address = marker.address;
        self.send(BluetoothEvent::DeviceFound { device: marker });
        self.wait_registry(|r| r.devices.contains_key(&address)).await;
    }
}

pub fn obd_adapter(last: u8) -> Device {
    Device::named(Address::new([0x00, 0x1D, 0xA5, 0x00, 0x00, last]), "OBDII")
}

pub fn headset(last: u8) -> Device {
    Device::named(Address::new([0x38, 0x18, 0x4C, 0x00, 0x00, last]), "WH-1000XM4")
}
