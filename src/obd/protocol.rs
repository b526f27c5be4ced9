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

//! ELM327 command framing and OBD-II PID decoding.

use thiserror::Error;

/// Terminator of every command sent to the adapter.
pub const COMMAND_TERMINATOR: char = '\r';

/// Prompt the adapter prints when it is ready for the next command.
pub const PROMPT: char = '>';

/// Adapter initialisation sequence, sent in this order after connecting.
pub const INIT_COMMANDS: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATH0", "ATSP0"];

/// Reset command; its reply is a version banner rather than "OK".
pub const RESET_COMMAND: &str = "ATZ";

/// Mode 01 response marker.
const MODE_01_RESPONSE: u8 = 0x41;

/// Why a single PID read produced no value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("adapter reported NO DATA")]
    NoData,

    #[error("adapter reported ERROR")]
    AdapterError,

    #[error("unsupported command {0}")]
    UnsupportedCommand(String),

    #[error("malformed response {0:?}")]
    Malformed(String),
}

/// Mode 01 PIDs polled for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    EngineRpm,
    VehicleSpeed,
    CoolantTemp,
}

impl Pid {
    /// Polling order of one telemetry round.
    pub const POLL_ORDER: [Pid; 3] = [Pid::EngineRpm, Pid::VehicleSpeed, Pid::CoolantTemp];

    pub fn command(&self) -> &'static str {
        match self {
            Pid::EngineRpm => "010C",
            Pid::VehicleSpeed => "010D",
            Pid::CoolantTemp => "0105",
        }
    }

    pub fn parse(command: &str) -> Option<Self> {
        match command.trim().to_uppercase().as_str() {
            "010C" => Some(Pid::EngineRpm),
            "010D" => Some(Pid::VehicleSpeed),
            "0105" => Some(Pid::CoolantTemp),
            _ => None,
        }
    }

    fn code(&self) -> u8 {
        match self {
            Pid::EngineRpm => 0x0C,
            Pid::VehicleSpeed => 0x0D,
            Pid::CoolantTemp => 0x05,
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Pid::EngineRpm => 2,
            Pid::VehicleSpeed | Pid::CoolantTemp => 1,
        }
    }

    fn value(&self, data: &[u8]) -> i32 {
        match self {
            Pid::EngineRpm => (i32::from(data[0]) * 256 + i32::from(data[1])) / 4,
            Pid::VehicleSpeed => i32::from(data[0]),
            Pid::CoolantTemp => i32::from(data[0]) - 40,
        }
    }

    /// Decode a normalized response to this PID.
    pub fn decode(&self, response: &str) -> Result<i32, DecodeError> {
        check_adapter_status(response)?;

        let bytes = hex_tokens(response);
        let needed = 2 + self.data_len();
        if bytes.len() < needed || bytes[0] != MODE_01_RESPONSE || bytes[1] != self.code() {
            return Err(DecodeError::Malformed(response.to_string()));
        }

        Ok(self.value(&bytes[2..needed]))
    }
}

/// Frame a command for the wire.
pub fn frame_command(command: &str) -> Vec<u8> {
    let mut framed = String::with_capacity(command.len() + 1);
    framed.push_str(command);
    framed.push(COMMAND_TERMINATOR);
    framed.into_bytes()
}

/// Normalize a raw adapter reply: drop carriage returns and the prompt,
/// turn line feeds into spaces, trim.
pub fn normalize_response(raw: &str) -> String {
    raw.replace('\r', "")
        .replace('\n', " ")
        .replace(PROMPT, "")
        .trim()
        .to_string()
}

/// Decode a normalized response to `command`.
pub fn decode_response(command: &str, response: &str) -> Result<i32, DecodeError> {
    check_adapter_status(response)?;
    let pid = Pid::parse(command)
        .ok_or_else(|| DecodeError::UnsupportedCommand(command.to_string()))?;
    pid.decode(response)
}

/// Whether an initialisation reply is acceptable for `command`.
pub fn init_reply_ok(command: &str, response: &str) -> bool {
    command == RESET_COMMAND || response.contains("OK")
}

fn check_adapter_status(response: &str) -> Result<(), DecodeError> {
    if response.contains("NO DATA") {
        return Err(DecodeError::NoData);
    }
    if response.contains("ERROR") {
        return Err(DecodeError::AdapterError);
    }
    Ok(())
}

/// Bytes of every two-hex-digit token; echo and banner noise is dropped.
fn hex_tokens(response: &str) -> Vec<u8> {
    response
        .split_whitespace()
        .filter(|token| token.len() == 2 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .filter_map(|token| u8::from_str_radix(token, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_command() {
        assert_eq!(frame_command("ATZ"), b"ATZ\r".to_vec());
        assert_eq!(frame_command("010C"), b"010C\r".to_vec());
    }

    #[test]
    fn test_normalize_response() {
        assert_eq!(normalize_response("41 0C 1A F8\r\n\r\n>"), "41 0C 1A F8");
        assert_eq!(normalize_response("\rOK\r\r>"), "OK");
        assert_eq!(normalize_response("SEARCHING...\n41 0D 50\n>"), "SEARCHING... 41 0D 50");
    }

    #[test]
    fn test_decode_rpm() {
        assert_eq!(decode_response("010C", "41 0C 1A F8"), Ok(1726));
    }

    #[test]
    fn test_decode_speed() {
        assert_eq!(decode_response("010D", "41 0D 50"), Ok(80));
    }

    #[test]
    fn test_decode_coolant_temp() {
        assert_eq!(decode_response("0105", "41 05 7D"), Ok(85));
        assert_eq!(decode_response("0105", "41 05 00"), Ok(-40));
    }

    #[test]
    fn test_decode_skips_echo_and_noise() {
        // Echo left on and a searching banner before the payload.
        assert_eq!(
            decode_response("010D", "010D SEARCHING... 41 0D 50"),
            Ok(80)
        );
        assert_eq!(decode_response("010c", "41 0c 1a f8"), Ok(1726));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(decode_response("010C", "NO DATA"), Err(DecodeError::NoData));
        assert_eq!(
            decode_response("010D", "CAN ERROR"),
            Err(DecodeError::AdapterError)
        );
        assert!(matches!(
            decode_response("010C", "41 0C 1A"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_response("010D", "41 0C 50"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_response("0111", "41 11 20"),
            Err(DecodeError::UnsupportedCommand(_))
        ));
        assert!(matches!(
            decode_response("0105", ""),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_init_reply_ok() {
        assert!(init_reply_ok("ATZ", "ELM327 v1.5"));
        assert!(init_reply_ok("ATE0", "ATE0 OK"));
        assert!(!init_reply_ok("ATSP0", "?"));
    }

    #[test]
    fn test_pid_commands() {
        let commands: Vec<_> = Pid::POLL_ORDER.iter().map(Pid::command).collect();
        assert_eq!(commands, vec!["010C", "010D", "0105"]);
        assert_eq!(Pid::parse("010d"), Some(Pid::VehicleSpeed));
        assert_eq!(Pid::parse("ATZ"), None);
    }
}
