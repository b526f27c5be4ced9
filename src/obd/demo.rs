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

//! Synthetic telemetry for demo mode.

use rand::Rng;
use std::ops::RangeInclusive;

use crate::state::Telemetry;

pub const DEMO_RPM: RangeInclusive<i32> = 700..=4000;
pub const DEMO_SPEED_KMH: RangeInclusive<i32> = 0..=280;
pub const DEMO_COOLANT_TEMP_C: RangeInclusive<i32> = 70..=110;

/// A random but plausible snapshot.
pub fn random_snapshot() -> Telemetry {
    let mut rng = rand::thread_rng();
    Telemetry {
        rpm: rng.gen_range(DEMO_RPM),
        speed_kmh: rng.gen_range(DEMO_SPEED_KMH),
        coolant_temp_c: rng.gen_range(DEMO_COOLANT_TEMP_C),
    }
}
