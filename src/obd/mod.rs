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

//! OBD-II over ELM327.
//!
//! Framing and PID decoding, the adapter session, and the demo generator.

pub mod demo;
pub mod protocol;
pub mod session;

pub use protocol::{decode_response, normalize_response, DecodeError, Pid, INIT_COMMANDS};
pub use session::{ObdSession, SessionTiming};

use crate::state::Device;

/// Name fragments of common ELM327 adapters.
pub const DEFAULT_OBD_KEYWORDS: [&str; 3] = ["obd", "elm", "unreallx"];

/// Name-based guess whether `device` is an OBD2 adapter.
///
/// Case-insensitive substring match of the advertised name. Devices without
/// a name never match. No capability probe is made.
pub fn is_obd2_device<S: AsRef<str>>(device: &Device, keywords: &[S]) -> bool {
    let Some(name) = device.name.as_deref() else {
        return false;
    };
    let name = name.to_lowercase();
    keywords
        .iter()
        .any(|keyword| name.contains(&keyword.as_ref().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluer::Address;

    fn named(name: Option<&str>) -> Device {
        Device::new(Address::new([1, 2, 3, 4, 5, 6]), name.map(str::to_string))
    }

    #[test]
    fn test_obd2_heuristic() {
        assert!(is_obd2_device(&named(Some("OBDII")), &DEFAULT_OBD_KEYWORDS));
        assert!(is_obd2_device(&named(Some("vLinker ELM327")), &DEFAULT_OBD_KEYWORDS));
        assert!(is_obd2_device(&named(Some("UnrealLX Dongle")), &DEFAULT_OBD_KEYWORDS));
        assert!(!is_obd2_device(&named(Some("WH-1000XM4")), &DEFAULT_OBD_KEYWORDS));
        assert!(!is_obd2_device(&named(None), &DEFAULT_OBD_KEYWORDS));
    }

    #[test]
    fn test_custom_keywords() {
        let keywords = vec!["Vgate".to_string()];
        assert!(is_obd2_device(&named(Some("vgate icar")), &keywords));
        assert!(!is_obd2_device(&named(Some("OBDII")), &keywords));
    }
}
