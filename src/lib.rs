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

//! ReDrive link engine.
//!
//! Discovers and connects Bluetooth Classic devices and reads live vehicle
//! telemetry from ELM327 OBD-II adapters.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod events;
pub mod obd;
pub mod orchestrator;
pub mod registry;
pub mod state;

pub use config::{Config, LinkConfig};
pub use error::LinkError;
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use registry::{DeviceEntry, RegistrySnapshot};
pub use state::{
    BondState, Device, DeviceStatus, Notice, NoticeKind, StateSubscriber, Telemetry,
};
