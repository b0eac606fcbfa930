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

//! Central (initiator) connection state machine.
//!
//! Consumes [`CentralEvent`]s one at a time and drives a [`CentralPlatform`].
//! Observers follow the published state through `watch`/`broadcast` channels.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{config, GattLayout};
use super::platform::{CentralPlatform, WriteKind};
use super::protocol::{hex_dump, Command};
use super::reassembler::LineReassembler;
use super::registry::DeviceRegistry;
use crate::error::LinkError;
use crate::events::{
    Advertisement, CentralEvent, CentralTimer, CharacteristicInfo, ProtocolEvent,
};
use crate::state::{ConnectionState, Device, DeviceId, PowerState, SessionDetail};

/// Tunables for the central role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralOptions {
    pub layout: GattLayout,
    pub connect_retry_delay: Duration,
    pub stale_after: Duration,
}

impl Default for CentralOptions {
    fn default() -> Self {
        Self {
            layout: GattLayout::default(),
            connect_retry_delay: config::CONNECT_RETRY_DELAY,
            stale_after: config::STALE_AFTER,
        }
    }
}

/// Peripheral being connected to, or connected.
struct Link<P> {
    peripheral: P,
    device: Device,
    connected: bool,
}

/// Greeting sent once per session after the write characteristic resolves.
pub fn central_greeting() -> String {
    format!(
        "HELLO from Central @ {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub struct CentralSession<A: CentralPlatform> {
    platform: A,
    options: CentralOptions,
    registry: DeviceRegistry<A::Peripheral>,
    power: PowerState,
    scan_intent: bool,
    scanning: bool,
    link: Option<Link<A::Peripheral>>,
    pending_target: Option<DeviceId>,
    retry_used: bool,
    retry_pending: bool,
    unfiltered_discovery: bool,
    notify_characteristic: Option<Uuid>,
    write_characteristic: Option<CharacteristicInfo>,
    handshake_sent: bool,
    reassembler: LineReassembler,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<Device>>,
    detail_tx: watch::Sender<Option<SessionDetail>>,
    scanning_tx: watch::Sender<bool>,
    power_tx: watch::Sender<PowerState>,
    events_tx: broadcast::Sender<ProtocolEvent>,
}

impl<A: CentralPlatform> CentralSession<A> {
    pub fn new(platform: A, options: CentralOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (devices_tx, _) = watch::channel(Vec::new());
        let (detail_tx, _) = watch::channel(None);
        let (scanning_tx, _) = watch::channel(false);
        let (power_tx, _) = watch::channel(PowerState::Unknown);
        let (events_tx, _) = broadcast::channel(config::EVENT_CHANNEL_CAPACITY);

        Self {
            platform,
            registry: DeviceRegistry::new(options.layout.service, options.stale_after),
            options,
            power: PowerState::Unknown,
            scan_intent: false,
            scanning: false,
            link: None,
            pending_target: None,
            retry_used: false,
            retry_pending: false,
            unfiltered_discovery: false,
            notify_characteristic: None,
            write_characteristic: None,
            handshake_sent: false,
            reassembler: LineReassembler::new(),
            state_tx,
            devices_tx,
            detail_tx,
            scanning_tx,
            power_tx,
            events_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.devices_tx.subscribe()
    }

    pub fn subscribe_detail(&self) -> watch::Receiver<Option<SessionDetail>> {
        self.detail_tx.subscribe()
    }

    pub fn subscribe_scanning(&self) -> watch::Receiver<bool> {
        self.scanning_tx.subscribe()
    }

    pub fn subscribe_power(&self) -> watch::Receiver<PowerState> {
        self.power_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ProtocolEvent> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn platform(&self) -> &A {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut A {
        &mut self.platform
    }

    /// Dispatch one platform callback.
    pub fn handle_event(&mut self, event: CentralEvent<A::Peripheral>) {
        match event {
            CentralEvent::PowerChanged(power) => self.on_power_changed(power),
            CentralEvent::Discovered {
                peripheral,
                advertisement,
            } => self.on_discovered(peripheral, advertisement),
            CentralEvent::Connected { id } => self.on_connected(&id),
            CentralEvent::ConnectFailed { id, reason } => self.on_connect_failed(&id, reason),
            CentralEvent::Disconnected { id, reason } => self.on_disconnected(&id, reason),
            CentralEvent::ServicesDiscovered { id, services } => {
                self.on_services_discovered(&id, services)
            }
            CentralEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => self.on_characteristics_discovered(&id, service, &characteristics),
            CentralEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => self.on_value_updated(&id, characteristic, &value),
            CentralEvent::WriteAcknowledged {
                id,
                characteristic,
                error,
            } => {
                if let Some(e) = error {
                    warn!("Write to {} on {} failed: {}", characteristic, id, e);
                }
            }
            CentralEvent::TimerFired(timer) => self.on_timer(timer),
        }
    }

    /// Enable or disable discovery. The intent survives radio power cycles.
    pub fn set_scanning_enabled(&mut self, enabled: bool) {
        self.scan_intent = enabled;
        if enabled {
            self.start_scanning();
        } else {
            self.stop_scanning();
        }
    }

    /// Connect to a device by identifier.
    pub fn connect(&mut self, id: &DeviceId) {
        if let Some(link) = &self.link {
            if link.connected && &link.device.id == id {
                debug!("Already connected to {}", id);
                self.state_tx.send_replace(ConnectionState::Connected);
                return;
            }
        }

        if let Some(previous) = self.link.take() {
            info!("Abandoning link to {} for {}", previous.device.id, id);
            self.platform.cancel_connection(&previous.peripheral);
            self.reset_session();
        }

        self.scan_intent = false;
        self.stop_scanning();
        self.pending_target = None;
        self.retry_used = false;
        self.retry_pending = false;
        self.state_tx.send_replace(ConnectionState::Connecting);

        if self.registry.get(id).is_none() {
            match self.platform.retrieve_peripheral(id) {
                Some(peripheral) => {
                    let name = self.platform.peripheral_name(&peripheral);
                    debug!("Retrieved {} from the platform", id);
                    self.registry.insert_retrieved(id.clone(), peripheral, name);
                }
                None => {
                    info!("{} not known yet, waiting for it to advertise", id);
                    self.pending_target = Some(id.clone());
                    self.start_scanning();
                    return;
                }
            }
        }

        self.begin_connect(id);
    }

    pub fn connect_device(&mut self, device: &Device) {
        self.connect(&device.id);
    }

    /// Tear down the current link, unsubscribing first.
    pub fn disconnect(&mut self) {
        self.pending_target = None;
        let Some(link) = self.link.take() else {
            debug!("Disconnect requested without a link");
            return;
        };

        if link.connected {
            if let Some(notify) = self.notify_characteristic {
                self.platform.set_notify(&link.peripheral, notify, false);
            }
        }
        info!("Disconnecting from {}", link.device.id);
        self.platform.cancel_connection(&link.peripheral);
        self.reset_session();
        self.state_tx
            .send_replace(ConnectionState::Disconnected(None));
        self.publish_devices();
    }

    /// Forget any pending auto-connect target and per-session flags.
    pub fn clear_connection_intent(&mut self) {
        self.pending_target = None;
        self.retry_used = false;
        self.retry_pending = false;
        self.handshake_sent = false;
    }

    /// Send one text line to the connected peripheral.
    pub fn send(&mut self, text: &str) -> Result<(), LinkError> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.connected)
            .ok_or(LinkError::NotConnected)?;
        let write = self
            .write_characteristic
            .ok_or(LinkError::NoWriteCharacteristic)?;

        let kind = if write.properties.write_without_response {
            WriteKind::WithoutResponse
        } else {
            WriteKind::WithResponse
        };
        debug!("Sending {} bytes to {}", text.len(), link.device.id);
        self.platform
            .write(&link.peripheral, write.uuid, text.as_bytes(), kind);
        Ok(())
    }

    pub fn send_toggle(&mut self, on: bool) -> Result<(), LinkError> {
        self.send(Command::toggle(on).as_str())
    }

    pub fn request_image(&mut self) -> Result<(), LinkError> {
        self.send(Command::GetImage.as_str())
    }

    /// Recompute the visible device list (ages out stale entries).
    pub fn refresh_devices(&mut self) {
        self.publish_devices();
    }

    fn on_power_changed(&mut self, power: PowerState) {
        info!("Bluetooth power state: {:?}", power);
        self.power = power;
        self.power_tx.send_if_modified(|current| {
            let changed = *current != power;
            *current = power;
            changed
        });

        if power.is_powered_on() {
            if self.scan_intent || self.pending_target.is_some() {
                self.start_scanning();
            }
            return;
        }

        if self.scanning {
            self.scanning = false;
            self.scanning_tx.send_replace(false);
        }
        if let Some(link) = self.link.take() {
            warn!("Radio went away while linked to {}", link.device.id);
            self.reset_session();
            self.state_tx.send_replace(ConnectionState::Disconnected(Some(
                "Bluetooth powered off".to_string(),
            )));
        }
        self.registry.clear();
        self.publish_devices();
    }

    fn on_discovered(&mut self, peripheral: A::Peripheral, advertisement: Advertisement) {
        let id = advertisement.id.clone();
        self.registry.upsert(peripheral, &advertisement);

        if self.pending_target.as_ref() == Some(&id) {
            info!("Pending target {} discovered", id);
            self.pending_target = None;
            self.stop_scanning();
            self.begin_connect(&id);
        }
        self.publish_devices();
    }

    fn on_connected(&mut self, id: &DeviceId) {
        let Some(link) = self.link.as_mut().filter(|link| &link.device.id == id) else {
            debug!("Ignoring connect from {}", id);
            return;
        };
        info!("Connected to {} ({})", link.device.name, id);
        link.connected = true;
        self.handshake_sent = false;
        self.retry_pending = false;
        self.unfiltered_discovery = false;
        self.state_tx.send_replace(ConnectionState::Connected);

        let preferred = link
            .device
            .preferred_service
            .unwrap_or(self.options.layout.service);
        self.platform
            .discover_services(&link.peripheral, Some(&[preferred]));
        self.publish_devices();
    }

    fn on_connect_failed(&mut self, id: &DeviceId, reason: String) {
        if !self.is_current(id) {
            debug!("Ignoring connect failure for {}: {}", id, reason);
            return;
        }

        if !self.retry_used {
            warn!(
                "Connect to {} failed ({}), retrying in {:?}",
                id, reason, self.options.connect_retry_delay
            );
            self.retry_used = true;
            self.retry_pending = true;
            self.state_tx.send_replace(ConnectionState::Connecting);
            self.platform
                .schedule(self.options.connect_retry_delay, CentralTimer::ConnectRetry);
            return;
        }

        error!("Connect to {} failed: {}", id, reason);
        self.link = None;
        self.reset_session();
        self.state_tx.send_replace(ConnectionState::Failed(reason));
        self.publish_devices();
    }

    fn on_timer(&mut self, timer: CentralTimer) {
        match timer {
            CentralTimer::ConnectRetry => {
                if !self.retry_pending {
                    return;
                }
                self.retry_pending = false;
                if let Some(link) = self.link.as_ref().filter(|link| !link.connected) {
                    info!("Retrying connect to {}", link.device.id);
                    self.platform.connect(&link.peripheral);
                }
            }
        }
    }

    fn on_disconnected(&mut self, id: &DeviceId, reason: Option<String>) {
        if !self.is_current(id) {
            debug!("Ignoring disconnect from {}", id);
            return;
        }
        match &reason {
            Some(reason) => warn!("Disconnected from {}: {}", id, reason),
            None => info!("Disconnected from {}", id),
        }
        self.link = None;
        self.reset_session();
        self.state_tx
            .send_replace(ConnectionState::Disconnected(reason));
        self.publish_devices();
    }

    fn on_services_discovered(&mut self, id: &DeviceId, services: Vec<Uuid>) {
        let Some(link) = self.link.as_ref().filter(|link| &link.device.id == id) else {
            return;
        };
        debug!("Services on {}: {:?}", id, services);
        let layout = self.options.layout;

        if services.contains(&layout.service) {
            self.platform.discover_characteristics(
                &link.peripheral,
                layout.service,
                Some(&[layout.write_characteristic, layout.notify_characteristic]),
            );
        } else if !self.unfiltered_discovery {
            debug!("Preferred service missing on {}, discovering all", id);
            self.unfiltered_discovery = true;
            self.platform.discover_services(&link.peripheral, None);
        } else {
            for service in &services {
                self.platform
                    .discover_characteristics(&link.peripheral, *service, None);
            }
        }

        self.detail_tx.send_modify(|detail| {
            if let Some(detail) = detail {
                for service in &services {
                    if !detail.services.contains(service) {
                        detail.services.push(*service);
                    }
                }
            }
        });
    }

    fn on_characteristics_discovered(
        &mut self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[CharacteristicInfo],
    ) {
        let Some(link) = self.link.as_ref().filter(|link| &link.device.id == id) else {
            return;
        };
        debug!(
            "{} characteristics on {} / {}",
            characteristics.len(),
            id,
            service
        );
        let layout = self.options.layout;

        if self.notify_characteristic.is_none() {
            let notify = characteristics
                .iter()
                .find(|c| c.uuid == layout.notify_characteristic && c.properties.can_subscribe())
                .or_else(|| characteristics.iter().find(|c| c.properties.can_subscribe()));
            if let Some(notify) = notify {
                info!("Subscribing to {}", notify.uuid);
                self.notify_characteristic = Some(notify.uuid);
                self.platform.set_notify(&link.peripheral, notify.uuid, true);
            }
        }

        if self.write_characteristic.is_none() {
            self.write_characteristic = characteristics
                .iter()
                .find(|c| c.uuid == layout.write_characteristic && c.properties.can_write())
                .or_else(|| characteristics.iter().find(|c| c.properties.can_write()))
                .copied();
        }

        let (notify, write) = (
            self.notify_characteristic,
            self.write_characteristic.map(|c| c.uuid),
        );
        self.detail_tx.send_modify(|detail| {
            if let Some(detail) = detail {
                detail.notify_characteristic = notify;
                detail.write_characteristic = write;
            }
        });

        if write.is_some() && !self.handshake_sent {
            self.handshake_sent = true;
            if let Err(e) = self.send(&central_greeting()) {
                warn!("Failed to send greeting: {}", e);
            }
        }
    }

    fn on_value_updated(&mut self, id: &DeviceId, characteristic: Uuid, value: &[u8]) {
        if !self.is_current(id) {
            return;
        }
        debug!("{} bytes from {} on {}", value.len(), id, characteristic);

        let events = match std::str::from_utf8(value) {
            Ok(text) if !text.is_empty() => self.reassembler.feed_payload(text),
            _ => vec![ProtocolEvent::Message(hex_dump(value))],
        };
        for event in events {
            let _ = self.events_tx.send(event);
        }
    }

    fn begin_connect(&mut self, id: &DeviceId) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        let device = entry.device();
        let peripheral = entry.peripheral.clone();

        info!("Connecting to {} ({})", device.name, id);
        self.detail_tx
            .send_replace(Some(SessionDetail::pending(device.clone())));
        self.platform.connect(&peripheral);
        self.link = Some(Link {
            peripheral,
            device,
            connected: false,
        });
    }

    fn start_scanning(&mut self) {
        if self.scanning {
            return;
        }
        if !self.power.is_powered_on() {
            debug!("Scan deferred until the radio is powered on");
            return;
        }
        info!("Starting scan");
        self.platform.start_scan(true);
        self.scanning = true;
        self.scanning_tx.send_replace(true);
    }

    fn stop_scanning(&mut self) {
        if !self.scanning {
            return;
        }
        info!("Stopping scan");
        self.platform.stop_scan();
        self.scanning = false;
        self.scanning_tx.send_replace(false);
    }

    fn is_current(&self, id: &DeviceId) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| &link.device.id == id)
    }

    fn reset_session(&mut self) {
        self.notify_characteristic = None;
        self.write_characteristic = None;
        self.handshake_sent = false;
        self.retry_used = false;
        self.retry_pending = false;
        self.unfiltered_discovery = false;
        self.reassembler.reset();
        self.detail_tx.send_replace(None);
    }

    fn publish_devices(&mut self) {
        let connected = self
            .link
            .as_ref()
            .filter(|link| link.connected)
            .map(|link| link.device.id.clone());
        let snapshot = self.registry.snapshot(connected.as_ref());
        self.devices_tx.send_if_modified(|devices| {
            if *devices == snapshot {
                return false;
            }
            *devices = snapshot;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::{
        NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
    };
    use crate::events::CharacteristicProperties;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan,
        StopScan,
        Connect(DeviceId),
        Cancel(DeviceId),
        DiscoverServices(Option<Vec<Uuid>>),
        DiscoverCharacteristics(Uuid, Option<Vec<Uuid>>),
        SetNotify(Uuid, bool),
        Write(Uuid, String, WriteKind),
        Schedule(Duration, CentralTimer),
    }

    #[derive(Default)]
    struct RecordingPlatform {
        calls: Vec<Call>,
        known: HashSet<DeviceId>,
    }

    impl RecordingPlatform {
        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }

        fn writes(&self) -> Vec<String> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Write(_, text, _) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl CentralPlatform for RecordingPlatform {
        type Peripheral = DeviceId;

        fn start_scan(&mut self, allow_duplicates: bool) {
            assert!(allow_duplicates);
            self.calls.push(Call::StartScan);
        }

        fn stop_scan(&mut self) {
            self.calls.push(Call::StopScan);
        }

        fn retrieve_peripheral(&mut self, id: &DeviceId) -> Option<DeviceId> {
            self.known.get(id).cloned()
        }

        fn peripheral_name(&self, _peripheral: &DeviceId) -> Option<String> {
            Some("Remembered".to_string())
        }

        fn connect(&mut self, peripheral: &DeviceId) {
            self.calls.push(Call::Connect(peripheral.clone()));
        }

        fn cancel_connection(&mut self, peripheral: &DeviceId) {
            self.calls.push(Call::Cancel(peripheral.clone()));
        }

        fn discover_services(&mut self, _peripheral: &DeviceId, filter: Option<&[Uuid]>) {
            self.calls
                .push(Call::DiscoverServices(filter.map(|f| f.to_vec())));
        }

        fn discover_characteristics(
            &mut self,
            _peripheral: &DeviceId,
            service: Uuid,
            filter: Option<&[Uuid]>,
        ) {
            self.calls
                .push(Call::DiscoverCharacteristics(service, filter.map(|f| f.to_vec())));
        }

        fn set_notify(&mut self, _peripheral: &DeviceId, characteristic: Uuid, enabled: bool) {
            self.calls.push(Call::SetNotify(characteristic, enabled));
        }

        fn write(&mut self, _peripheral: &DeviceId, characteristic: Uuid, data: &[u8], kind: WriteKind) {
            self.calls.push(Call::Write(
                characteristic,
                String::from_utf8_lossy(data).into_owned(),
                kind,
            ));
        }

        fn schedule(&mut self, delay: Duration, timer: CentralTimer) {
            self.calls.push(Call::Schedule(delay, timer));
        }
    }

    fn session() -> CentralSession<RecordingPlatform> {
        let mut session = CentralSession::new(RecordingPlatform::default(), CentralOptions::default());
        session.handle_event(CentralEvent::PowerChanged(PowerState::PoweredOn));
        session
    }

    fn discover(session: &mut CentralSession<RecordingPlatform>, id: &str, rssi: i16) {
        session.handle_event(CentralEvent::Discovered {
            peripheral: DeviceId::from(id),
            advertisement: Advertisement {
                id: DeviceId::from(id),
                local_name: Some(format!("Device {}", id)),
                services: vec![SERVICE_UUID],
                connectable: Some(true),
                rssi,
                ..Default::default()
            },
        });
    }

    fn nus_characteristics() -> Vec<CharacteristicInfo> {
        vec![
            CharacteristicInfo {
                uuid: WRITE_CHARACTERISTIC_UUID,
                properties: CharacteristicProperties {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
            },
            CharacteristicInfo {
                uuid: NOTIFY_CHARACTERISTIC_UUID,
                properties: CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            },
        ]
    }

    fn connect_fully(session: &mut CentralSession<RecordingPlatform>, id: &str) {
        let id = DeviceId::from(id);
        session.connect(&id);
        session.handle_event(CentralEvent::Connected { id: id.clone() });
        session.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![SERVICE_UUID],
        });
        session.handle_event(CentralEvent::CharacteristicsDiscovered {
            id,
            service: SERVICE_UUID,
            characteristics: nus_characteristics(),
        });
    }

    #[test]
    fn test_connect_failure_retries_exactly_once() {
        let mut session = session();
        discover(&mut session, "a", -50);
        let mut state = session.subscribe_state();
        let id = DeviceId::from("a");

        session.connect(&id);
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connecting);

        session.handle_event(CentralEvent::ConnectFailed {
            id: id.clone(),
            reason: "busy".into(),
        });
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connecting);
        assert!(session.platform().calls.contains(&Call::Schedule(
            Duration::from_millis(600),
            CentralTimer::ConnectRetry
        )));

        session.handle_event(CentralEvent::TimerFired(CentralTimer::ConnectRetry));
        session.handle_event(CentralEvent::ConnectFailed {
            id: id.clone(),
            reason: "still busy".into(),
        });
        match &*state.borrow_and_update() {
            ConnectionState::Failed(reason) => assert_eq!(reason, "still busy"),
            other => panic!("expected Failed, got {:?}", other),
        }

        // A late failure for the abandoned attempt is not reported again
        session.handle_event(CentralEvent::ConnectFailed {
            id,
            reason: "late".into(),
        });
        assert!(!state.has_changed().unwrap());
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::Connect(_))),
            2
        );
    }

    #[test]
    fn test_retry_timer_ignored_after_disconnect() {
        let mut session = session();
        discover(&mut session, "a", -50);
        let id = DeviceId::from("a");
        session.connect(&id);
        session.handle_event(CentralEvent::ConnectFailed {
            id,
            reason: "busy".into(),
        });
        session.disconnect();
        session.handle_event(CentralEvent::TimerFired(CentralTimer::ConnectRetry));
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::Connect(_))),
            1
        );
    }

    #[test]
    fn test_handshake_narrowed_discovery_and_single_greeting() {
        let mut session = session();
        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");

        let calls = &session.platform().calls;
        assert!(calls.contains(&Call::DiscoverServices(Some(vec![SERVICE_UUID]))));
        assert!(calls.contains(&Call::DiscoverCharacteristics(
            SERVICE_UUID,
            Some(vec![WRITE_CHARACTERISTIC_UUID, NOTIFY_CHARACTERISTIC_UUID])
        )));
        assert!(calls.contains(&Call::SetNotify(NOTIFY_CHARACTERISTIC_UUID, true)));

        // Characteristics reported twice must not greet twice
        session.handle_event(CentralEvent::CharacteristicsDiscovered {
            id: DeviceId::from("a"),
            service: SERVICE_UUID,
            characteristics: nus_characteristics(),
        });
        let writes = session.platform().writes();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].starts_with("HELLO from Central @ "));
        assert!(session.platform().calls.iter().any(|c| matches!(
            c,
            Call::Write(uuid, _, WriteKind::WithoutResponse) if *uuid == WRITE_CHARACTERISTIC_UUID
        )));

        let detail = session.subscribe_detail().borrow().clone().unwrap();
        assert_eq!(detail.services, vec![SERVICE_UUID]);
        assert_eq!(detail.notify_characteristic, Some(NOTIFY_CHARACTERISTIC_UUID));
        assert_eq!(detail.write_characteristic, Some(WRITE_CHARACTERISTIC_UUID));
    }

    #[test]
    fn test_fallback_discovery_selects_by_properties() {
        let other_service = Uuid::from_u128(0xfff0);
        let tx = Uuid::from_u128(0xfff1);
        let rx = Uuid::from_u128(0xfff2);
        let mut session = session();
        discover(&mut session, "a", -50);
        let id = DeviceId::from("a");

        session.connect(&id);
        session.handle_event(CentralEvent::Connected { id: id.clone() });
        session.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![],
        });
        assert!(session
            .platform()
            .calls
            .contains(&Call::DiscoverServices(None)));

        session.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![other_service],
        });
        assert!(session
            .platform()
            .calls
            .contains(&Call::DiscoverCharacteristics(other_service, None)));

        session.handle_event(CentralEvent::CharacteristicsDiscovered {
            id,
            service: other_service,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: tx,
                    properties: CharacteristicProperties {
                        indicate: true,
                        ..Default::default()
                    },
                },
                CharacteristicInfo {
                    uuid: rx,
                    properties: CharacteristicProperties {
                        write: true,
                        ..Default::default()
                    },
                },
            ],
        });
        let calls = &session.platform().calls;
        assert!(calls.contains(&Call::SetNotify(tx, true)));
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Write(uuid, _, WriteKind::WithResponse) if *uuid == rx)));
    }

    #[test]
    fn test_non_nus_preferred_service_widens_discovery() {
        let heart_rate = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
        let uart = Uuid::from_u128(0xfff0);
        let mut session = session();
        let id = DeviceId::from("hr");
        session.handle_event(CentralEvent::Discovered {
            peripheral: id.clone(),
            advertisement: Advertisement {
                id: id.clone(),
                local_name: Some("Strap".into()),
                services: vec![heart_rate],
                connectable: Some(true),
                rssi: -55,
                ..Default::default()
            },
        });

        session.connect(&id);
        session.handle_event(CentralEvent::Connected { id: id.clone() });
        assert!(session
            .platform()
            .calls
            .contains(&Call::DiscoverServices(Some(vec![heart_rate]))));

        // The narrowed answer lacks the UART service, so every service is requested
        session.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![heart_rate],
        });
        assert_eq!(
            session.platform().calls.last(),
            Some(&Call::DiscoverServices(None))
        );
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::DiscoverCharacteristics(..))),
            0
        );

        session.handle_event(CentralEvent::ServicesDiscovered {
            id,
            services: vec![heart_rate, uart],
        });
        let calls = &session.platform().calls;
        assert!(calls.contains(&Call::DiscoverCharacteristics(heart_rate, None)));
        assert!(calls.contains(&Call::DiscoverCharacteristics(uart, None)));
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::DiscoverServices(None))),
            1
        );
    }

    #[test]
    fn test_terminal_failure_clears_detail() {
        let mut session = session();
        discover(&mut session, "a", -50);
        let id = DeviceId::from("a");
        session.connect(&id);
        assert!(session.subscribe_detail().borrow().is_some());

        session.handle_event(CentralEvent::ConnectFailed {
            id: id.clone(),
            reason: "busy".into(),
        });
        session.handle_event(CentralEvent::TimerFired(CentralTimer::ConnectRetry));
        session.handle_event(CentralEvent::ConnectFailed {
            id,
            reason: "busy".into(),
        });
        assert!(matches!(session.state(), ConnectionState::Failed(_)));
        assert!(session.subscribe_detail().borrow().is_none());
    }

    #[test]
    fn test_disconnect_unsubscribes_before_teardown() {
        let mut session = session();
        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");
        let mut state = session.subscribe_state();

        session.disconnect();

        let calls = &session.platform().calls;
        let unsubscribe = calls
            .iter()
            .position(|c| *c == Call::SetNotify(NOTIFY_CHARACTERISTIC_UUID, false))
            .unwrap();
        let cancel = calls
            .iter()
            .position(|c| *c == Call::Cancel(DeviceId::from("a")))
            .unwrap();
        assert!(unsubscribe < cancel);
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected(None));
        assert_eq!(session.send("x"), Err(LinkError::NotConnected));

        // The platform's confirmation arrives afterwards and changes nothing
        session.handle_event(CentralEvent::Disconnected {
            id: DeviceId::from("a"),
            reason: None,
        });
        assert!(!state.has_changed().unwrap());
    }

    #[test]
    fn test_spontaneous_disconnect_clears_session() {
        let mut session = session();
        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");

        session.handle_event(CentralEvent::Disconnected {
            id: DeviceId::from("a"),
            reason: Some("link lost".into()),
        });
        match session.state() {
            ConnectionState::Disconnected(reason) => {
                assert_eq!(reason.as_deref(), Some("link lost"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.subscribe_detail().borrow().is_none());

        // A fresh connect performs a full handshake again
        connect_fully(&mut session, "a");
        assert_eq!(session.platform().writes().len(), 2);
    }

    #[test]
    fn test_connect_unknown_waits_for_discovery() {
        let mut session = session();
        let id = DeviceId::from("later");
        session.connect(&id);
        assert!(session.is_scanning());
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::Connect(_))),
            0
        );

        discover(&mut session, "other", -40);
        assert!(session.is_scanning());

        discover(&mut session, "later", -60);
        assert!(!session.is_scanning());
        assert_eq!(session.platform().calls.last(), Some(&Call::Connect(id)));
    }

    #[test]
    fn test_connect_retrieves_known_peripheral() {
        let mut session = session();
        let id = DeviceId::from("bonded");
        session.platform_mut().known.insert(id.clone());

        session.connect(&id);
        assert!(!session.is_scanning());
        assert_eq!(session.platform().calls.last(), Some(&Call::Connect(id)));
        let detail = session.subscribe_detail().borrow().clone().unwrap();
        assert_eq!(detail.device.name, "Remembered");
    }

    #[test]
    fn test_connect_when_connected_reemits() {
        let mut session = session();
        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");
        let calls_before = session.platform().calls.len();
        let mut state = session.subscribe_state();

        session.connect(&DeviceId::from("a"));
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(session.platform().calls.len(), calls_before);
    }

    #[test]
    fn test_power_cycle_clears_registry_and_resumes_scan() {
        let mut session = session();
        session.set_scanning_enabled(true);
        discover(&mut session, "a", -50);
        let devices = session.subscribe_devices();
        assert_eq!(devices.borrow().len(), 1);

        session.handle_event(CentralEvent::PowerChanged(PowerState::PoweredOff));
        assert!(!session.is_scanning());
        assert!(devices.borrow().is_empty());
        assert_eq!(*session.subscribe_power().borrow(), PowerState::PoweredOff);

        session.handle_event(CentralEvent::PowerChanged(PowerState::PoweredOn));
        assert!(session.is_scanning());
        assert_eq!(
            session
                .platform()
                .count(|c| *c == Call::StartScan),
            2
        );
    }

    #[test]
    fn test_scan_deferred_until_powered() {
        let mut session = CentralSession::new(RecordingPlatform::default(), CentralOptions::default());
        session.set_scanning_enabled(true);
        assert!(!session.is_scanning());
        session.handle_event(CentralEvent::PowerChanged(PowerState::PoweredOn));
        assert!(session.is_scanning());
        assert!(*session.subscribe_scanning().borrow());

        session.set_scanning_enabled(false);
        assert_eq!(session.platform().calls.last(), Some(&Call::StopScan));
    }

    #[test]
    fn test_inbound_values_become_protocol_events() {
        let mut session = session();
        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");
        let mut events = session.subscribe_events();
        let id = DeviceId::from("a");

        for line in ["hello", "IMG_BEGIN pic.png 9", "AQIDBAUGBwgJ", "IMG_END"] {
            session.handle_event(CentralEvent::ValueUpdated {
                id: id.clone(),
                characteristic: NOTIFY_CHARACTERISTIC_UUID,
                value: line.as_bytes().to_vec(),
            });
        }
        session.handle_event(CentralEvent::ValueUpdated {
            id,
            characteristic: NOTIFY_CHARACTERISTIC_UUID,
            value: vec![0xff, 0x00],
        });

        assert_eq!(events.try_recv().unwrap(), ProtocolEvent::Message("hello".into()));
        assert!(matches!(
            events.try_recv().unwrap(),
            ProtocolEvent::ImageStarted { expected_bytes: 9, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ProtocolEvent::ImageProgress { bytes_estimated: 9, expected_bytes: 9 }
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            ProtocolEvent::ImageCompleted {
                data: (1..=9).collect(),
                filename: "pic.png".into(),
            }
        );
        assert_eq!(events.try_recv().unwrap(), ProtocolEvent::Message("0xFF00".into()));
    }

    #[test]
    fn test_send_commands() {
        let mut session = session();
        assert_eq!(session.request_image(), Err(LinkError::NotConnected));

        discover(&mut session, "a", -50);
        connect_fully(&mut session, "a");
        session.send_toggle(true).unwrap();
        session.send_toggle(false).unwrap();
        session.request_image().unwrap();

        let writes = session.platform().writes();
        assert_eq!(&writes[1..], &["ON", "OFF", "GET_IMAGE"]);
    }

    #[test]
    fn test_connected_device_survives_in_snapshot() {
        let mut session = session();
        discover(&mut session, "a", -50);
        discover(&mut session, "b", -30);
        connect_fully(&mut session, "a");
        let devices = session.subscribe_devices();
        let ids: Vec<_> = devices.borrow().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec![DeviceId::from("b"), DeviceId::from("a")]);
    }

    #[test]
    fn test_clear_connection_intent_drops_pending_target() {
        let mut session = session();
        session.connect(&DeviceId::from("ghost"));
        session.clear_connection_intent();
        discover(&mut session, "ghost", -50);
        assert_eq!(
            session
                .platform()
                .count(|c| matches!(c, Call::Connect(_))),
            0
        );
    }
}
