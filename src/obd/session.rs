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

//! Command/response session with an ELM327 adapter.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::protocol::{
    decode_response, frame_command, init_reply_ok, normalize_response, Pid, INIT_COMMANDS, PROMPT,
};
use crate::state::Telemetry;

/// Timing of one adapter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Wall-clock budget for collecting one reply.
    pub read_timeout: Duration,
    /// Pause after an initialisation command that did not answer OK.
    pub init_settle: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            init_settle: Duration::from_millis(300),
        }
    }
}

/// One open serial link to an ELM327 adapter.
///
/// I/O errors are returned to the caller and end the session; decode
/// failures only cost the value of a single PID.
pub struct ObdSession<S> {
    stream: S,
    timing: SessionTiming,
    buf: Vec<u8>,
}

impl<S> ObdSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timing: SessionTiming) -> Self {
        Self {
            stream,
            timing,
            buf: vec![0u8; 1024],
        }
    }

    /// Send one command followed by the carriage return terminator.
    pub async fn send_command(&mut self, command: &str) -> io::Result<()> {
        debug!("Sending OBD command: {}", command);
        self.stream.write_all(&frame_command(command)).await?;
        self.stream.flush().await
    }

    /// Collect one reply, normalized.
    ///
    /// Reads until the `>` prompt shows up or the read budget runs out,
    /// whichever comes first. Whatever arrived by then is the reply.
    pub async fn read_response(&mut self) -> io::Result<String> {
        let deadline = Instant::now() + self.timing.read_timeout;
        let mut raw = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Read budget elapsed before prompt");
                break;
            }

            match timeout(remaining, self.stream.read(&mut self.buf)).await {
                Err(_) => {
                    debug!("Read budget elapsed before prompt");
                    break;
                }
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial link closed by adapter",
                    ));
                }
                Ok(Ok(n)) => {
                    let chunk = String::from_utf8_lossy(&self.buf[..n]);
                    raw.push_str(&chunk);
                    if chunk.contains(PROMPT) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        let response = normalize_response(&raw);
        debug!("Read response: {:?}", response);
        Ok(response)
    }

    /// Send a command and return its normalized reply.
    pub async fn query(&mut self, command: &str) -> io::Result<String> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Run the adapter initialisation sequence.
    ///
    /// A reply other than OK is logged and followed by a short pause;
    /// initialisation continues regardless.
    pub async fn initialize(&mut self) -> io::Result<()> {
        for command in INIT_COMMANDS {
            let response = self.query(command).await?;
            info!("Init command {}: {:?}", command, response);
            if !init_reply_ok(command, &response) {
                warn!("Command {} did not return OK: {:?}", command, response);
                sleep(self.timing.init_settle).await;
            }
        }
        Ok(())
    }

    /// Query one PID.
    ///
    /// `Ok(None)` means the adapter answered but no value could be decoded;
    /// callers keep their last good value.
    pub async fn read_value(&mut self, command: &str) -> io::Result<Option<i32>> {
        let response = self.query(command).await?;
        match decode_response(command, &response) {
            Ok(value) => {
                debug!("Parsed value for {}: {}", command, value);
                Ok(Some(value))
            }
            Err(e) => {
                debug!("No value for {}: {}", command, e);
                Ok(None)
            }
        }
    }

    /// Poll RPM, speed and coolant temperature once, in that order.
    pub async fn poll_round(&mut self, last: Telemetry) -> io::Result<Telemetry> {
        let mut next = last;
        for pid in Pid::POLL_ORDER {
            if let Some(value) = self.read_value(pid.command()).await? {
                match pid {
                    Pid::EngineRpm => next.rpm = value,
                    Pid::VehicleSpeed => next.speed_kmh = value,
                    Pid::CoolantTemp => next.coolant_temp_c = value,
                }
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Minimal scripted adapter: answers each command from `reply`.
    fn spawn_adapter(mut end: DuplexStream, reply: fn(&str) -> Option<String>) {
        tokio::spawn(async move {
            let mut pending = String::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match end.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                while let Some(pos) = pending.find('\r') {
                    let command: String = pending.drain(..=pos).collect();
                    if let Some(answer) = reply(command.trim()) {
                        if end.write_all(answer.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn elm_reply(command: &str) -> Option<String> {
        let body = match command {
            "ATZ" => "\r\rELM327 v1.5",
            "ATE0" | "ATL0" | "ATH0" | "ATSP0" => "OK",
            "010C" => "41 0C 1A F8",
            "010D" => "41 0D 50",
            "0105" => "41 05 7D",
            _ => "?",
        };
        Some(format!("{}\r\r>", body))
    }

    #[tokio::test]
    async fn test_initialize_and_poll() {
        let (client, adapter) = duplex(1024);
        spawn_adapter(adapter, elm_reply);

        let mut session = ObdSession::new(client, SessionTiming::default());
        session.initialize().await.unwrap();

        let telemetry = session.poll_round(Telemetry::ZERO).await.unwrap();
        assert_eq!(
            telemetry,
            Telemetry {
                rpm: 1726,
                speed_kmh: 80,
                coolant_temp_c: 85,
            }
        );
    }

    #[tokio::test]
    async fn test_no_data_keeps_last_value() {
        let (client, adapter) = duplex(1024);
        spawn_adapter(adapter, |command| match command {
            "010D" => Some("41 0D 50\r>".to_string()),
            _ => Some("NO DATA\r\r>".to_string()),
        });

        let last = Telemetry {
            rpm: 900,
            speed_kmh: 10,
            coolant_temp_c: 90,
        };
        let mut session = ObdSession::new(client, SessionTiming::default());

        let first = session.poll_round(last).await.unwrap();
        assert_eq!(first, Telemetry { speed_kmh: 80, ..last });

        let second = session.poll_round(first).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_gives_up_without_prompt() {
        let (client, adapter) = duplex(1024);
        // Partial reply with no prompt.
        spawn_adapter(adapter, |_| Some("41 0C".to_string()));

        let mut session = ObdSession::new(client, SessionTiming::default());
        let started = Instant::now();
        let response = session.query("010C").await.unwrap();

        assert_eq!(response, "41 0C");
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_yields_empty_reply() {
        let (client, adapter) = duplex(1024);
        spawn_adapter(adapter, |_| None);

        let mut session = ObdSession::new(client, SessionTiming::default());
        assert_eq!(session.read_value("010C").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_link_is_io_error() {
        let (client, adapter) = duplex(1024);
        drop(adapter);

        let mut session = ObdSession::new(client, SessionTiming::default());
        assert!(session.query("ATZ").await.is_err());
    }

    #[tokio::test]
    async fn test_init_proceeds_past_rejections() {
        let (client, adapter) = duplex(1024);
        spawn_adapter(adapter, |_| Some("?\r>".to_string()));

        let timing = SessionTiming {
            init_settle: Duration::from_millis(1),
            ..SessionTiming::default()
        };
        let mut session = ObdSession::new(client, timing);
        assert!(session.initialize().await.is_ok());
    }
}
