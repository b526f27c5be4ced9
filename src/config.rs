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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::obd::{SessionTiming, DEFAULT_OBD_KEYWORDS};

const APP_DIR: &str = "redrive";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Connection timing.
    pub timing: TimingConfig,

    /// OBD2 adapter settings.
    pub obd: ObdConfig,

    /// Demo mode settings.
    pub demo: DemoConfig,

    /// Log settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Name fragments that mark a device as an OBD2 adapter.
    pub obd_keywords: Vec<String>,

    /// How long one discovery cycle lasts.
    pub discovery_window_secs: u64,

    /// Connect to OBD2 adapters found during discovery.
    pub auto_connect_obd: bool,

    /// Remove the bond of the previous device when switching devices.
    pub unpair_previous_on_switch: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            obd_keywords: DEFAULT_OBD_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            discovery_window_secs: 12,
            auto_connect_obd: true,
            unpair_previous_on_switch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bound on the bonding phase of a connection attempt.
    pub connect_timeout_ms: u64,

    /// Watchdog on the profile connection phase.
    pub profile_watchdog_ms: u64,

    /// Pause after releasing the previous device.
    pub switch_settle_ms: u64,

    /// Pause between profile disconnect and bond removal.
    pub unpair_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            profile_watchdog_ms: 15_000,
            switch_settle_ms: 1_000,
            unpair_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    /// Budget for collecting one adapter reply.
    pub read_timeout_ms: u64,

    /// Pause between polling rounds.
    pub poll_interval_ms: u64,

    /// Pause after an initialisation command that did not answer OK.
    pub init_settle_ms: u64,
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            poll_interval_ms: 100,
            init_settle_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Start in demo mode.
    pub enabled: bool,

    /// Interval between synthetic snapshots.
    pub interval_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter directive; `RUST_LOG` still applies on top.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "redrive_link=info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Runtime settings for the orchestrator.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            obd_keywords: self.bluetooth.obd_keywords.clone(),
            unpair_previous_on_switch: self.bluetooth.unpair_previous_on_switch,
            connect_timeout: Duration::from_millis(self.timing.connect_timeout_ms),
            profile_watchdog: Duration::from_millis(self.timing.profile_watchdog_ms),
            switch_settle: Duration::from_millis(self.timing.switch_settle_ms),
            unpair_delay: Duration::from_millis(self.timing.unpair_delay_ms),
            poll_interval: Duration::from_millis(self.obd.poll_interval_ms),
            session: SessionTiming {
                read_timeout: Duration::from_millis(self.obd.read_timeout_ms),
                init_settle: Duration::from_millis(self.obd.init_settle_ms),
            },
            demo_interval: Duration::from_millis(self.demo.interval_ms),
        }
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.bluetooth.discovery_window_secs)
    }
}

/// Settings the orchestrator runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub obd_keywords: Vec<String>,
    pub unpair_previous_on_switch: bool,
    pub connect_timeout: Duration,
    pub profile_watchdog: Duration,
    pub switch_settle: Duration,
    pub unpair_delay: Duration,
    pub poll_interval: Duration,
    pub session: SessionTiming,
    pub demo_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Config::default().link_config()
    }
}
