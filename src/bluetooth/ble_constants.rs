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

//! BLE service and characteristic UUIDs (Nordic UART Service layout).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Nordic UART service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// RX characteristic UUID (the central writes commands here).
/// Properties: Write, Write Without Response
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// TX characteristic UUID (the peripheral notifies lines here).
/// Properties: Notify
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Default advertised local name for the hosting role.
pub const DEFAULT_LOCAL_NAME: &str = "QDevice1";

/// Service/characteristic triple carrying the whole line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattLayout {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
}

impl GattLayout {
    /// The Nordic UART Service mapping.
    pub const fn nordic_uart() -> Self {
        Self {
            service: SERVICE_UUID,
            write_characteristic: WRITE_CHARACTERISTIC_UUID,
            notify_characteristic: NOTIFY_CHARACTERISTIC_UUID,
        }
    }
}

impl Default for GattLayout {
    fn default() -> Self {
        Self::nordic_uart()
    }
}

/// Link timing and sizing constants.
pub mod config {
    use super::Duration;

    /// Discovery entries older than this are hidden from device snapshots.
    pub const STALE_AFTER: Duration = Duration::from_secs(6);

    /// Delay before the single automatic reconnect attempt.
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(600);

    /// Maximum queued notifications awaiting platform buffer space.
    pub const NOTIFY_QUEUE_CAPACITY: usize = 100;

    /// Base64 characters per outbound image line.
    pub const IMAGE_CHUNK_CHARS: usize = 180;

    /// Cap on accumulated base64 text (~5 MB decoded).
    pub const MAX_BASE64_CHARS: usize = 7_000_000;

    /// Inbound free text is truncated to this many characters for display.
    pub const MAX_MESSAGE_CHARS: usize = 500;

    /// Hex rendering of non-text payloads is capped at this many hex digits.
    pub const MAX_HEX_CHARS: usize = 512;

    /// Buffered protocol events per broadcast subscriber.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}
