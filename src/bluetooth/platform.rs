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

//! Seams to the BLE platform adapter.
//!
//! Requests return immediately; their outcome arrives later as a
//! [`CentralEvent`](crate::events::CentralEvent) or
//! [`PeripheralEvent`](crate::events::PeripheralEvent).

use std::time::Duration;

use uuid::Uuid;

use super::ble_constants::GattLayout;
use crate::events::{CentralTimer, WriteRequest};
use crate::state::DeviceId;

/// ATT write flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Answer to an ATT write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttResponse {
    Success,
    RequestNotSupported,
}

/// Platform operations needed by the central role.
pub trait CentralPlatform {
    /// Opaque platform-resident peripheral handle.
    type Peripheral: Clone;

    fn start_scan(&mut self, allow_duplicates: bool);
    fn stop_scan(&mut self);
    /// Look up a peripheral the platform already knows by identifier.
    fn retrieve_peripheral(&mut self, id: &DeviceId) -> Option<Self::Peripheral>;
    fn peripheral_name(&self, peripheral: &Self::Peripheral) -> Option<String>;
    fn connect(&mut self, peripheral: &Self::Peripheral);
    fn cancel_connection(&mut self, peripheral: &Self::Peripheral);
    /// `None` discovers every service.
    fn discover_services(&mut self, peripheral: &Self::Peripheral, filter: Option<&[Uuid]>);
    /// `None` discovers every characteristic of `service`.
    fn discover_characteristics(
        &mut self,
        peripheral: &Self::Peripheral,
        service: Uuid,
        filter: Option<&[Uuid]>,
    );
    fn set_notify(&mut self, peripheral: &Self::Peripheral, characteristic: Uuid, enabled: bool);
    fn write(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: Uuid,
        data: &[u8],
        kind: WriteKind,
    );
    /// Deliver `CentralEvent::TimerFired(timer)` after `delay`.
    fn schedule(&mut self, delay: Duration, timer: CentralTimer);
}

/// Platform operations needed by the peripheral role.
pub trait PeripheralPlatform {
    /// Register the service and its write/notify characteristics.
    fn add_service(&mut self, layout: &GattLayout);
    fn remove_all_services(&mut self);
    fn start_advertising(&mut self, service: Uuid, local_name: &str);
    fn stop_advertising(&mut self);
    fn respond(&mut self, request: &WriteRequest, response: AttResponse);
    /// Offer one notification to subscribers. Returns `false` when the
    /// outbound buffer is full; `PeripheralEvent::ReadyToUpdate` follows once
    /// there is room again.
    fn update_value(&mut self, characteristic: Uuid, data: &[u8]) -> bool;
}
