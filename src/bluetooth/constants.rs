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

//! Bluetooth Classic service class UUIDs.

use uuid::Uuid;

/// Serial Port Profile UUID, used by ELM327 adapters.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Headset profile UUID.
pub const HEADSET_UUID: Uuid = Uuid::from_u128(0x00001108_0000_1000_8000_00805F9B34FB);

/// A2DP audio sink UUID.
pub const A2DP_SINK_UUID: Uuid = Uuid::from_u128(0x0000110B_0000_1000_8000_00805F9B34FB);

/// Audio profiles the orchestrator connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Headset,
    A2dp,
}

impl ProfileKind {
    /// Profiles tried on every profile connection, in order.
    pub const ALL: [ProfileKind; 2] = [ProfileKind::Headset, ProfileKind::A2dp];

    pub fn uuid(&self) -> Uuid {
        match self {
            ProfileKind::Headset => HEADSET_UUID,
            ProfileKind::A2dp => A2DP_SINK_UUID,
        }
    }
}
