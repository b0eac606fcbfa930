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

//! In-process radio linking one central to one peripheral.
//!
//! Both adapters share a [`Bus`] that turns platform requests into the
//! events the other side would observe. [`Loopback::pump`] delivers queued
//! events one at a time; retry timers run on virtual time and fire once the
//! bus is otherwise idle.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::ble_constants::GattLayout;
use super::central::CentralSession;
use super::gatt_server::PeripheralSession;
use super::platform::{AttResponse, CentralPlatform, PeripheralPlatform, WriteKind};
use crate::events::{
    Advertisement, CentralEvent, CentralTimer, CharacteristicInfo, CharacteristicProperties,
    PeripheralEvent, WriteRequest,
};
use crate::state::{DeviceId, PowerState};

/// Identifier the simulated peripheral advertises under.
pub const PERIPHERAL_ID: &str = "loopback-peripheral";
/// Identifier the simulated central writes as.
pub const CENTRAL_ID: &str = "loopback-central";

const SIMULATED_RSSI: i16 = -42;
const DEFAULT_NOTIFY_CAPACITY: usize = 8;

enum Delivery {
    Central(CentralEvent<DeviceId>),
    Peripheral(PeripheralEvent),
}

struct Bus {
    queue: VecDeque<Delivery>,
    timers: VecDeque<(Duration, CentralTimer)>,
    service: Option<GattLayout>,
    advertised_name: Option<String>,
    scanning: bool,
    connected: bool,
    subscribed: bool,
    failing_connects: usize,
    notify_capacity: usize,
    in_flight: usize,
    peripheral_waiting: bool,
    next_request_id: u64,
    acknowledged_requests: HashSet<u64>,
}

impl Bus {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            timers: VecDeque::new(),
            service: None,
            advertised_name: None,
            scanning: false,
            connected: false,
            subscribed: false,
            failing_connects: 0,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            in_flight: 0,
            peripheral_waiting: false,
            next_request_id: 1,
            acknowledged_requests: HashSet::new(),
        }
    }

    fn to_central(&mut self, event: CentralEvent<DeviceId>) {
        self.queue.push_back(Delivery::Central(event));
    }

    fn to_peripheral(&mut self, event: PeripheralEvent) {
        self.queue.push_back(Delivery::Peripheral(event));
    }

    fn announce(&mut self) {
        let (Some(name), Some(layout)) = (self.advertised_name.clone(), self.service) else {
            return;
        };
        let id = DeviceId::from(PERIPHERAL_ID);
        self.to_central(CentralEvent::Discovered {
            peripheral: id.clone(),
            advertisement: Advertisement {
                id,
                local_name: Some(name),
                platform_name: None,
                manufacturer_data: Vec::new(),
                services: vec![layout.service],
                connectable: Some(true),
                rssi: SIMULATED_RSSI,
            },
        });
    }

    fn drop_link(&mut self, reason: Option<String>) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.in_flight = 0;
        if self.subscribed {
            self.subscribed = false;
            if let Some(layout) = self.service {
                self.to_peripheral(PeripheralEvent::Unsubscribed {
                    central: DeviceId::from(CENTRAL_ID),
                    characteristic: layout.notify_characteristic,
                });
            }
        }
        self.to_central(CentralEvent::Disconnected {
            id: DeviceId::from(PERIPHERAL_ID),
            reason,
        });
    }

    fn next_delivery(&mut self) -> Option<Delivery> {
        let delivery = self.queue.pop_front()?;
        if let Delivery::Central(CentralEvent::ValueUpdated { .. }) = &delivery {
            self.in_flight = self.in_flight.saturating_sub(1);
            if self.peripheral_waiting {
                self.peripheral_waiting = false;
                self.to_peripheral(PeripheralEvent::ReadyToUpdate);
            }
        }
        Some(delivery)
    }
}

/// The simulated radio. Clone handles share one bus.
#[derive(Clone)]
pub struct Loopback {
    bus: Arc<Mutex<Bus>>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(Bus::new())),
        }
    }

    pub fn central(&self) -> LoopbackCentral {
        LoopbackCentral {
            bus: self.bus.clone(),
        }
    }

    pub fn peripheral(&self) -> LoopbackPeripheral {
        LoopbackPeripheral {
            bus: self.bus.clone(),
        }
    }

    /// Report a power state to both roles.
    pub fn set_power(&self, power: PowerState) {
        let mut bus = self.bus.lock();
        if !power.is_powered_on() {
            bus.drop_link(Some("Bluetooth powered off".to_string()));
            bus.service = None;
            bus.advertised_name = None;
            bus.scanning = false;
        }
        bus.to_central(CentralEvent::PowerChanged(power));
        bus.to_peripheral(PeripheralEvent::PowerChanged(power));
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.bus.lock().failing_connects = count;
    }

    /// Notifications the peripheral may have in flight before it is told to wait.
    pub fn set_notify_capacity(&self, capacity: usize) {
        self.bus.lock().notify_capacity = capacity.max(1);
    }

    /// Drop the link as if the peripheral went out of range.
    pub fn drop_link(&self, reason: &str) {
        self.bus.lock().drop_link(Some(reason.to_string()));
    }

    pub fn is_idle(&self) -> bool {
        let bus = self.bus.lock();
        bus.queue.is_empty() && bus.timers.is_empty()
    }

    /// Deliver queued events until the bus is idle. Returns how many were
    /// delivered.
    pub fn pump(
        &self,
        central: &mut CentralSession<LoopbackCentral>,
        peripheral: &mut PeripheralSession<LoopbackPeripheral>,
    ) -> usize {
        let mut delivered = 0;
        loop {
            // Never hold the lock while a session runs
            let next = {
                let mut bus = self.bus.lock();
                match bus.next_delivery() {
                    Some(delivery) => Some(delivery),
                    None => bus
                        .timers
                        .pop_front()
                        .map(|(delay, timer)| {
                            trace!("Virtual timer fired after {:?}", delay);
                            Delivery::Central(CentralEvent::TimerFired(timer))
                        }),
                }
            };
            match next {
                Some(Delivery::Central(event)) => central.handle_event(event),
                Some(Delivery::Peripheral(event)) => peripheral.handle_event(event),
                None => return delivered,
            }
            delivered += 1;
        }
    }
}

/// Central-role adapter on the loopback bus.
pub struct LoopbackCentral {
    bus: Arc<Mutex<Bus>>,
}

impl LoopbackCentral {
    fn characteristics(layout: &GattLayout) -> [CharacteristicInfo; 2] {
        [
            CharacteristicInfo {
                uuid: layout.write_characteristic,
                properties: CharacteristicProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            },
            CharacteristicInfo {
                uuid: layout.notify_characteristic,
                properties: CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            },
        ]
    }
}

impl CentralPlatform for LoopbackCentral {
    type Peripheral = DeviceId;

    fn start_scan(&mut self, _allow_duplicates: bool) {
        let mut bus = self.bus.lock();
        bus.scanning = true;
        bus.announce();
    }

    fn stop_scan(&mut self) {
        self.bus.lock().scanning = false;
    }

    fn retrieve_peripheral(&mut self, id: &DeviceId) -> Option<DeviceId> {
        let bus = self.bus.lock();
        (id.as_str() == PERIPHERAL_ID && bus.service.is_some()).then(|| id.clone())
    }

    fn peripheral_name(&self, _peripheral: &DeviceId) -> Option<String> {
        self.bus.lock().advertised_name.clone()
    }

    fn connect(&mut self, peripheral: &DeviceId) {
        let mut bus = self.bus.lock();
        let id = peripheral.clone();
        if bus.failing_connects > 0 {
            bus.failing_connects -= 1;
            bus.to_central(CentralEvent::ConnectFailed {
                id,
                reason: "Simulated connection failure".to_string(),
            });
        } else if id.as_str() != PERIPHERAL_ID || bus.advertised_name.is_none() {
            bus.to_central(CentralEvent::ConnectFailed {
                id,
                reason: "Peripheral is not advertising".to_string(),
            });
        } else {
            debug!("Loopback link up");
            bus.connected = true;
            bus.to_central(CentralEvent::Connected { id });
        }
    }

    fn cancel_connection(&mut self, _peripheral: &DeviceId) {
        self.bus.lock().drop_link(None);
    }

    fn discover_services(&mut self, peripheral: &DeviceId, filter: Option<&[Uuid]>) {
        let mut bus = self.bus.lock();
        let services = bus
            .service
            .map(|layout| layout.service)
            .filter(|service| filter.map_or(true, |f| f.contains(service)))
            .into_iter()
            .collect();
        bus.to_central(CentralEvent::ServicesDiscovered {
            id: peripheral.clone(),
            services,
        });
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &DeviceId,
        service: Uuid,
        filter: Option<&[Uuid]>,
    ) {
        let mut bus = self.bus.lock();
        let characteristics = match bus.service {
            Some(layout) if layout.service == service => Self::characteristics(&layout)
                .into_iter()
                .filter(|c| filter.map_or(true, |f| f.contains(&c.uuid)))
                .collect(),
            _ => Vec::new(),
        };
        bus.to_central(CentralEvent::CharacteristicsDiscovered {
            id: peripheral.clone(),
            service,
            characteristics,
        });
    }

    fn set_notify(&mut self, _peripheral: &DeviceId, characteristic: Uuid, enabled: bool) {
        let mut bus = self.bus.lock();
        if !bus.connected || bus.subscribed == enabled {
            return;
        }
        bus.subscribed = enabled;
        let central = DeviceId::from(CENTRAL_ID);
        if enabled {
            bus.to_peripheral(PeripheralEvent::Subscribed {
                central,
                characteristic,
            });
        } else {
            bus.to_peripheral(PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            });
        }
    }

    fn write(&mut self, _peripheral: &DeviceId, characteristic: Uuid, data: &[u8], kind: WriteKind) {
        let mut bus = self.bus.lock();
        if !bus.connected {
            return;
        }
        let request_id = bus.next_request_id;
        bus.next_request_id += 1;
        if kind == WriteKind::WithResponse {
            bus.acknowledged_requests.insert(request_id);
        }
        bus.to_peripheral(PeripheralEvent::WriteRequests(vec![WriteRequest {
            request_id,
            central: DeviceId::from(CENTRAL_ID),
            characteristic,
            value: data.to_vec(),
        }]));
    }

    fn schedule(&mut self, delay: Duration, timer: CentralTimer) {
        self.bus.lock().timers.push_back((delay, timer));
    }
}

/// Peripheral-role adapter on the loopback bus.
pub struct LoopbackPeripheral {
    bus: Arc<Mutex<Bus>>,
}

impl PeripheralPlatform for LoopbackPeripheral {
    fn add_service(&mut self, layout: &GattLayout) {
        let mut bus = self.bus.lock();
        bus.service = Some(*layout);
        bus.to_peripheral(PeripheralEvent::ServiceAdded { error: None });
    }

    fn remove_all_services(&mut self) {
        let mut bus = self.bus.lock();
        bus.drop_link(Some("Service removed".to_string()));
        bus.service = None;
    }

    fn start_advertising(&mut self, _service: Uuid, local_name: &str) {
        let mut bus = self.bus.lock();
        bus.advertised_name = Some(local_name.to_string());
        bus.to_peripheral(PeripheralEvent::AdvertisingStarted { error: None });
        if bus.scanning {
            bus.announce();
        }
    }

    fn stop_advertising(&mut self) {
        self.bus.lock().advertised_name = None;
    }

    fn respond(&mut self, request: &WriteRequest, response: AttResponse) {
        let mut bus = self.bus.lock();
        if !bus.acknowledged_requests.remove(&request.request_id) {
            return;
        }
        let error = match response {
            AttResponse::Success => None,
            AttResponse::RequestNotSupported => Some("Request not supported".to_string()),
        };
        bus.to_central(CentralEvent::WriteAcknowledged {
            id: DeviceId::from(PERIPHERAL_ID),
            characteristic: request.characteristic,
            error,
        });
    }

    fn update_value(&mut self, characteristic: Uuid, data: &[u8]) -> bool {
        let mut bus = self.bus.lock();
        if !bus.subscribed {
            // Nobody listening; the platform discards it
            return true;
        }
        if bus.in_flight >= bus.notify_capacity {
            bus.peripheral_waiting = true;
            return false;
        }
        bus.in_flight += 1;
        bus.to_central(CentralEvent::ValueUpdated {
            id: DeviceId::from(PERIPHERAL_ID),
            characteristic,
            value: data.to_vec(),
        });
        true
    }
}
