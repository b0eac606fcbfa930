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

//! Tagged events consumed by the link state machines.
//!
//! Every platform callback is delivered as one variant and handled by exactly
//! one transition function of the owning state machine.

use uuid::Uuid;

use crate::bluetooth::TransferError;
use crate::state::{DeviceId, PowerState};

/// One advertisement as reported by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub id: DeviceId,
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Name the platform already knows for this peripheral.
    pub platform_name: Option<String>,
    pub manufacturer_data: Vec<u8>,
    pub services: Vec<Uuid>,
    pub connectable: Option<bool>,
    pub rssi: i16,
}

/// GATT characteristic property flags relevant to the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Deferred work scheduled by the central state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralTimer {
    ConnectRetry,
}

/// Platform callbacks for the central role. `P` is the platform's opaque
/// peripheral handle.
#[derive(Debug, Clone)]
pub enum CentralEvent<P> {
    PowerChanged(PowerState),
    Discovered {
        peripheral: P,
        advertisement: Advertisement,
    },
    Connected {
        id: DeviceId,
    },
    ConnectFailed {
        id: DeviceId,
        reason: String,
    },
    Disconnected {
        id: DeviceId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    ValueUpdated {
        id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteAcknowledged {
        id: DeviceId,
        characteristic: Uuid,
        error: Option<String>,
    },
    TimerFired(CentralTimer),
}

/// An incoming ATT write against the hosted service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Platform token used to answer this request.
    pub request_id: u64,
    pub central: DeviceId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Platform callbacks for the peripheral role.
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    PowerChanged(PowerState),
    ServiceAdded {
        error: Option<String>,
    },
    AdvertisingStarted {
        error: Option<String>,
    },
    Subscribed {
        central: DeviceId,
        characteristic: Uuid,
    },
    Unsubscribed {
        central: DeviceId,
        characteristic: Uuid,
    },
    WriteRequests(Vec<WriteRequest>),
    /// The platform has room for more notifications.
    ReadyToUpdate,
}

/// Structured output of the line protocol codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Message(String),
    ImageStarted {
        filename: String,
        expected_bytes: usize,
    },
    ImageProgress {
        bytes_estimated: usize,
        expected_bytes: usize,
    },
    ImageCompleted {
        data: Vec<u8>,
        filename: String,
    },
    ImageFailed(TransferError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_capabilities() {
        let notify_only = CharacteristicProperties {
            notify: true,
            ..Default::default()
        };
        assert!(notify_only.can_subscribe());
        assert!(!notify_only.can_write());

        let unacked = CharacteristicProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert!(unacked.can_write());
        assert!(!unacked.can_subscribe());
    }
}
