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

//! Shared domain types observed by every layer of the link.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable platform identifier of a remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Radio power state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl PowerState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, PowerState::PoweredOn)
    }
}

/// A discovered remote endpoint, as of its most recent advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Last seen signal strength in dBm; only negative values are meaningful.
    pub rssi: Option<i16>,
    /// `None` when the advertisement did not say.
    pub connectable: Option<bool>,
    pub preferred_service: Option<Uuid>,
}

impl Device {
    /// Display name used when neither the advertisement nor the platform has one.
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    /// Device known only by identifier (not yet advertised).
    pub fn unnamed(id: DeviceId) -> Self {
        Self {
            id,
            name: Self::UNKNOWN_NAME.to_string(),
            rssi: None,
            connectable: None,
            preferred_service: None,
        }
    }
}

/// The active or most recent connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub device: Device,
    pub services: Vec<Uuid>,
    pub notify_characteristic: Option<Uuid>,
    pub write_characteristic: Option<Uuid>,
}

impl SessionDetail {
    /// Detail for a connection attempt that has not discovered anything yet.
    pub fn pending(device: Device) -> Self {
        Self {
            device,
            services: Vec::new(),
            notify_characteristic: None,
            write_characteristic: None,
        }
    }
}

/// Central-side connection state.
///
/// Equality compares the variant only; failure and disconnect reasons are
/// informational.
#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed(String),
    Disconnected(Option<String>),
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ConnectionState {}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Failed(_) => "Failed",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Peripheral (hosting) role state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Idle,
    Ready,
    Advertising,
    /// At least one central is subscribed; carries the most relevant one.
    Connected(Option<DeviceId>),
    Failed(String),
}

impl PeripheralState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeripheralState::Idle => "Idle",
            PeripheralState::Ready => "Ready",
            PeripheralState::Advertising => "Advertising",
            PeripheralState::Connected(_) => "Connected",
            PeripheralState::Failed(_) => "Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_equality_ignores_reasons() {
        assert_eq!(
            ConnectionState::Failed("timeout".into()),
            ConnectionState::Failed("refused".into())
        );
        assert_eq!(
            ConnectionState::Disconnected(None),
            ConnectionState::Disconnected(Some("link loss".into()))
        );
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
        assert_ne!(ConnectionState::Idle, ConnectionState::Disconnected(None));
    }

    #[test]
    fn test_unnamed_device() {
        let device = Device::unnamed(DeviceId::from("AA:BB"));
        assert_eq!(device.name, "Unknown");
        assert_eq!(device.rssi, None);
        assert_eq!(device.id.as_str(), "AA:BB");
    }

    #[test]
    fn test_power_state() {
        assert!(PowerState::PoweredOn.is_powered_on());
        assert!(!PowerState::default().is_powered_on());
    }
}
