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
//! Handles loading and saving link settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{
    config as limits, GattLayout, DEFAULT_LOCAL_NAME, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
use crate::bluetooth::{CentralOptions, PeripheralOptions};

const APP_DIR: &str = "nus-link";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for received images.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Image transfer settings.
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Local name advertised when hosting.
    pub local_name: String,
    pub service_uuid: Uuid,
    /// Characteristic the central writes to.
    pub write_characteristic_uuid: Uuid,
    /// Characteristic the peripheral notifies on.
    pub notify_characteristic_uuid: Uuid,
    /// Delay before the single reconnect attempt.
    pub connect_retry_delay_ms: u64,
    /// Discovered devices not seen for this long are hidden.
    pub stale_after_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            service_uuid: SERVICE_UUID,
            write_characteristic_uuid: WRITE_CHARACTERISTIC_UUID,
            notify_characteristic_uuid: NOTIFY_CHARACTERISTIC_UUID,
            connect_retry_delay_ms: limits::CONNECT_RETRY_DELAY.as_millis() as u64,
            stale_after_ms: limits::STALE_AFTER.as_millis() as u64,
        }
    }
}

impl BluetoothConfig {
    pub fn layout(&self) -> GattLayout {
        GattLayout {
            service: self.service_uuid,
            write_characteristic: self.write_characteristic_uuid,
            notify_characteristic: self.notify_characteristic_uuid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// PNG served in answer to an image request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,

    /// Base64 characters per outbound image line.
    pub chunk_chars: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            chunk_chars: limits::IMAGE_CHUNK_CHARS,
        }
    }
}

impl Config {
    /// Load configuration from the user config directory, creating it with
    /// defaults on first run.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let mut config = Self::load_from(config_dir.join("config.toml"))?;

        config.data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load configuration from an explicit path, writing defaults if missing.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            info!("Writing default configuration to {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.chunk_chars == 0 {
            bail!("transfer.chunk_chars must be positive");
        }
        if self.bluetooth.local_name.trim().is_empty() {
            bail!("bluetooth.local_name must not be empty");
        }
        let layout = self.bluetooth.layout();
        if layout.write_characteristic == layout.notify_characteristic {
            bail!("write and notify characteristics must differ");
        }
        Ok(())
    }

    pub fn central_options(&self) -> CentralOptions {
        CentralOptions {
            layout: self.bluetooth.layout(),
            connect_retry_delay: Duration::from_millis(self.bluetooth.connect_retry_delay_ms),
            stale_after: Duration::from_millis(self.bluetooth.stale_after_ms),
        }
    }

    pub fn peripheral_options(&self) -> PeripheralOptions {
        PeripheralOptions {
            layout: self.bluetooth.layout(),
            local_name: self.bluetooth.local_name.clone(),
            chunk_chars: self.transfer.chunk_chars,
        }
    }
}
