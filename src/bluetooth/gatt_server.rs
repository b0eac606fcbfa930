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

//! Peripheral (hosting) state machine: GATT service registration,
//! advertising, subscriber tracking, write handling and notify backpressure.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::ble_constants::{config, GattLayout, DEFAULT_LOCAL_NAME};
use super::image::image_lines;
use super::notify_queue::NotifyQueue;
use super::platform::{AttResponse, PeripheralPlatform};
use super::protocol::{hex_dump, truncate_chars, Command};
use crate::error::LinkError;
use crate::events::{PeripheralEvent, WriteRequest};
use crate::state::{DeviceId, PeripheralState, PowerState};

/// Hosting configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralOptions {
    pub layout: GattLayout,
    pub local_name: String,
    pub chunk_chars: usize,
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            layout: GattLayout::default(),
            local_name: DEFAULT_LOCAL_NAME.to_string(),
            chunk_chars: config::IMAGE_CHUNK_CHARS,
        }
    }
}

/// Greeting notified to every new subscriber.
pub fn peripheral_greeting(local_name: &str) -> String {
    format!(
        "HELLO from {} @ {}",
        local_name,
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub struct PeripheralSession<A: PeripheralPlatform> {
    platform: A,
    options: PeripheralOptions,
    power: PowerState,
    hosting: bool,
    service_added: bool,
    advertising: bool,
    subscribers: BTreeSet<DeviceId>,
    queue: NotifyQueue,
    selected_image: Option<PathBuf>,
    state_tx: watch::Sender<PeripheralState>,
    toggle_tx: watch::Sender<bool>,
    messages_tx: broadcast::Sender<String>,
}

impl<A: PeripheralPlatform> PeripheralSession<A> {
    pub fn new(platform: A, options: PeripheralOptions) -> Self {
        let (state_tx, _) = watch::channel(PeripheralState::Idle);
        let (toggle_tx, _) = watch::channel(false);
        let (messages_tx, _) = broadcast::channel(config::EVENT_CHANNEL_CAPACITY);

        Self {
            platform,
            options,
            power: PowerState::Unknown,
            hosting: false,
            service_added: false,
            advertising: false,
            subscribers: BTreeSet::new(),
            queue: NotifyQueue::new(),
            selected_image: None,
            state_tx,
            toggle_tx,
            messages_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeripheralState> {
        self.state_tx.subscribe()
    }

    /// Remote ON/OFF flag.
    pub fn subscribe_toggle(&self) -> watch::Receiver<bool> {
        self.toggle_tx.subscribe()
    }

    /// Inbound free-text messages from centrals.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages_tx.subscribe()
    }

    pub(crate) fn message_sender(&self) -> broadcast::Sender<String> {
        self.messages_tx.clone()
    }

    pub fn state(&self) -> PeripheralState {
        self.state_tx.borrow().clone()
    }

    pub fn toggle(&self) -> bool {
        *self.toggle_tx.borrow()
    }

    pub fn queued_notifications(&self) -> usize {
        self.queue.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &DeviceId> {
        self.subscribers.iter()
    }

    pub fn options(&self) -> &PeripheralOptions {
        &self.options
    }

    pub fn platform(&self) -> &A {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut A {
        &mut self.platform
    }

    /// Register the service (once) and advertise, now or as soon as the
    /// radio is powered on.
    pub fn start_hosting(&mut self) {
        self.hosting = true;
        if !self.power.is_powered_on() {
            info!("Radio not ready, hosting will start once powered on");
            return;
        }

        if !self.service_added {
            info!("Registering service {}", self.options.layout.service);
            self.platform.add_service(&self.options.layout);
            self.service_added = true;
        }
        if !self.advertising {
            info!("Advertising as {}", self.options.local_name);
            self.platform
                .start_advertising(self.options.layout.service, &self.options.local_name);
            self.advertising = true;
        }
    }

    pub fn stop_hosting(&mut self) {
        info!("Stopping hosting");
        self.hosting = false;
        if self.advertising {
            self.platform.stop_advertising();
            self.advertising = false;
        }
        self.platform.remove_all_services();
        self.service_added = false;
        self.subscribers.clear();
        self.queue.clear();

        let next = if self.power.is_powered_on() {
            PeripheralState::Ready
        } else {
            PeripheralState::Idle
        };
        self.set_state(next);
    }

    /// Apply new hosting options; advertising restarts with them.
    pub fn update_config(&mut self, options: PeripheralOptions) {
        if options == self.options {
            return;
        }
        let layout_changed = options.layout != self.options.layout;
        self.options = options;

        if layout_changed && self.service_added {
            self.platform.remove_all_services();
            self.service_added = false;
        }
        if self.advertising {
            debug!("Restarting advertising with new configuration");
            self.platform.stop_advertising();
            self.advertising = false;
        }
        if self.hosting {
            self.start_hosting();
        }
    }

    /// Image served in answer to `GET_IMAGE`.
    pub fn set_selected_image(&mut self, path: Option<PathBuf>) {
        self.selected_image = path;
    }

    /// Notify one free-form line to subscribers.
    pub fn send_text(&mut self, text: &str) -> Result<(), LinkError> {
        if self.subscribers.is_empty() {
            return Err(LinkError::NoSubscribers);
        }
        self.notify(text.as_bytes().to_vec());
        Ok(())
    }

    /// Dispatch one platform callback.
    pub fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::PowerChanged(power) => self.on_power_changed(power),
            PeripheralEvent::ServiceAdded { error } => match error {
                None => debug!("Service registered"),
                Some(reason) => {
                    error!("Service registration failed: {}", reason);
                    self.service_added = false;
                    self.set_state(PeripheralState::Failed(reason));
                }
            },
            PeripheralEvent::AdvertisingStarted { error } => match error {
                None => {
                    if self.subscribers.is_empty() {
                        self.set_state(PeripheralState::Advertising);
                    }
                }
                Some(reason) => {
                    error!("Advertising failed: {}", reason);
                    self.advertising = false;
                    self.set_state(PeripheralState::Failed(reason));
                }
            },
            PeripheralEvent::Subscribed {
                central,
                characteristic,
            } => self.on_subscribed(central, characteristic),
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => self.on_unsubscribed(&central, characteristic),
            PeripheralEvent::WriteRequests(requests) => {
                for request in &requests {
                    self.on_write(request);
                }
            }
            PeripheralEvent::ReadyToUpdate => self.flush_queue(),
        }
    }

    fn on_power_changed(&mut self, power: PowerState) {
        info!("Bluetooth power state: {:?}", power);
        self.power = power;

        match power {
            PowerState::PoweredOn => {
                self.set_state(PeripheralState::Ready);
                if self.hosting {
                    self.start_hosting();
                }
            }
            _ => {
                // The platform drops services and advertising with the radio
                self.service_added = false;
                self.advertising = false;
                self.subscribers.clear();
                self.queue.clear();
                match power {
                    PowerState::Unsupported => {
                        self.set_state(PeripheralState::Failed("Bluetooth unsupported".into()))
                    }
                    PowerState::Unauthorized => {
                        self.set_state(PeripheralState::Failed("Bluetooth unauthorized".into()))
                    }
                    _ => self.set_state(PeripheralState::Idle),
                }
            }
        }
    }

    fn on_subscribed(&mut self, central: DeviceId, characteristic: uuid::Uuid) {
        if characteristic != self.options.layout.notify_characteristic {
            debug!("Ignoring subscription to {}", characteristic);
            return;
        }
        info!("Central {} subscribed", central);
        self.subscribers.insert(central.clone());
        self.set_state(PeripheralState::Connected(Some(central)));

        let greeting = peripheral_greeting(&self.options.local_name);
        self.notify(greeting.into_bytes());
        self.flush_queue();
    }

    fn on_unsubscribed(&mut self, central: &DeviceId, characteristic: uuid::Uuid) {
        if characteristic != self.options.layout.notify_characteristic
            || !self.subscribers.remove(central)
        {
            return;
        }
        info!("Central {} unsubscribed", central);

        match self.subscribers.iter().next().cloned() {
            Some(remaining) => self.set_state(PeripheralState::Connected(Some(remaining))),
            None => {
                self.queue.clear();
                self.toggle_tx.send_if_modified(|on| std::mem::replace(on, false));
                self.set_state(PeripheralState::Advertising);
            }
        }
    }

    fn on_write(&mut self, request: &WriteRequest) {
        // Acknowledge before interpreting
        if request.characteristic != self.options.layout.write_characteristic {
            warn!("Rejecting write to {}", request.characteristic);
            self.platform
                .respond(request, AttResponse::RequestNotSupported);
            return;
        }
        self.platform.respond(request, AttResponse::Success);

        let Ok(text) = std::str::from_utf8(&request.value) else {
            let dump = hex_dump(&request.value);
            debug!("Binary write from {}: {}", request.central, dump);
            let _ = self.messages_tx.send(dump);
            return;
        };
        let text = text.trim();
        match Command::parse(text) {
            Some(command @ (Command::On | Command::Off)) => {
                let on = command == Command::On;
                info!("Remote toggle from {}: {}", request.central, on);
                self.toggle_tx.send_if_modified(|current| {
                    let changed = *current != on;
                    *current = on;
                    changed
                });
            }
            Some(Command::GetImage) => {
                info!("Image requested by {}", request.central);
                self.send_image();
            }
            None => {
                let message = truncate_chars(text, config::MAX_MESSAGE_CHARS);
                debug!("Message from {}: {}", request.central, message);
                let _ = self.messages_tx.send(message);
            }
        }
    }

    fn send_image(&mut self) {
        let lines = image_lines(self.selected_image.as_deref(), self.options.chunk_chars);
        for line in lines {
            self.notify(line.into_bytes());
        }
    }

    fn notify(&mut self, payload: Vec<u8>) {
        // Anything queued goes first
        if !self.queue.is_empty() {
            self.queue.push(payload);
            return;
        }
        if !self
            .platform
            .update_value(self.options.layout.notify_characteristic, &payload)
        {
            debug!("Notify buffer full, queueing {} bytes", payload.len());
            self.queue.push(payload);
        }
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let characteristic = self.options.layout.notify_characteristic;
        let platform = &mut self.platform;
        let sent = self
            .queue
            .drain_with(|payload| platform.update_value(characteristic, payload));
        debug!("Flushed {} queued notifications, {} left", sent, self.queue.len());
    }

    fn set_state(&mut self, next: PeripheralState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("Peripheral state: {} -> {}", state.as_str(), next.as_str());
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::{NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
    use crate::bluetooth::protocol::PNG_MAGIC;
    use std::io::Write;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        AddService,
        RemoveAllServices,
        StartAdvertising(String),
        StopAdvertising,
        Respond(u64, AttResponse),
        Notify(String),
    }

    /// Accepts notifications while `budget` allows (`None` = unlimited).
    #[derive(Default)]
    struct RecordingPlatform {
        calls: Vec<Call>,
        budget: Option<usize>,
    }

    impl RecordingPlatform {
        fn notified(&self) -> Vec<String> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Notify(text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl PeripheralPlatform for RecordingPlatform {
        fn add_service(&mut self, layout: &GattLayout) {
            assert_eq!(layout.notify_characteristic, NOTIFY_CHARACTERISTIC_UUID);
            self.calls.push(Call::AddService);
        }

        fn remove_all_services(&mut self) {
            self.calls.push(Call::RemoveAllServices);
        }

        fn start_advertising(&mut self, _service: Uuid, local_name: &str) {
            self.calls.push(Call::StartAdvertising(local_name.to_string()));
        }

        fn stop_advertising(&mut self) {
            self.calls.push(Call::StopAdvertising);
        }

        fn respond(&mut self, request: &WriteRequest, response: AttResponse) {
            self.calls.push(Call::Respond(request.request_id, response));
        }

        fn update_value(&mut self, _characteristic: Uuid, data: &[u8]) -> bool {
            match self.budget.as_mut() {
                Some(0) => return false,
                Some(budget) => *budget -= 1,
                None => {}
            }
            self.calls
                .push(Call::Notify(String::from_utf8_lossy(data).into_owned()));
            true
        }
    }

    fn hosting() -> PeripheralSession<RecordingPlatform> {
        let mut session =
            PeripheralSession::new(RecordingPlatform::default(), PeripheralOptions::default());
        session.handle_event(PeripheralEvent::PowerChanged(PowerState::PoweredOn));
        session.start_hosting();
        session.handle_event(PeripheralEvent::ServiceAdded { error: None });
        session.handle_event(PeripheralEvent::AdvertisingStarted { error: None });
        session
    }

    fn subscribe(session: &mut PeripheralSession<RecordingPlatform>, central: &str) {
        session.handle_event(PeripheralEvent::Subscribed {
            central: DeviceId::from(central),
            characteristic: NOTIFY_CHARACTERISTIC_UUID,
        });
    }

    fn write(session: &mut PeripheralSession<RecordingPlatform>, id: u64, value: &[u8]) {
        session.handle_event(PeripheralEvent::WriteRequests(vec![WriteRequest {
            request_id: id,
            central: DeviceId::from("c1"),
            characteristic: WRITE_CHARACTERISTIC_UUID,
            value: value.to_vec(),
        }]));
    }

    #[test]
    fn test_hosting_deferred_until_powered_on() {
        let mut session =
            PeripheralSession::new(RecordingPlatform::default(), PeripheralOptions::default());
        session.start_hosting();
        assert!(session.platform().calls.is_empty());

        session.handle_event(PeripheralEvent::PowerChanged(PowerState::PoweredOn));
        assert_eq!(
            session.platform().calls,
            vec![Call::AddService, Call::StartAdvertising("QDevice1".into())]
        );
        session.handle_event(PeripheralEvent::AdvertisingStarted { error: None });
        assert_eq!(session.state(), PeripheralState::Advertising);
    }

    #[test]
    fn test_service_registered_once() {
        let mut session = hosting();
        session.start_hosting();
        session.start_hosting();
        assert_eq!(session.platform().count(&Call::AddService), 1);
    }

    #[test]
    fn test_subscribe_greets_and_unsubscribe_returns_to_advertising() {
        let mut session = hosting();
        subscribe(&mut session, "c1");
        assert_eq!(
            session.state(),
            PeripheralState::Connected(Some(DeviceId::from("c1")))
        );
        let notified = session.platform().notified();
        assert_eq!(notified.len(), 1);
        assert!(notified[0].starts_with("HELLO from QDevice1 @ "));

        write(&mut session, 1, b"on");
        assert!(session.toggle());

        session.handle_event(PeripheralEvent::Unsubscribed {
            central: DeviceId::from("c1"),
            characteristic: NOTIFY_CHARACTERISTIC_UUID,
        });
        assert_eq!(session.state(), PeripheralState::Advertising);
        assert!(!session.toggle());
    }

    #[test]
    fn test_notify_backpressure_caps_and_drains_in_order() {
        let mut session = hosting();
        session.platform_mut().budget = Some(0);
        subscribe(&mut session, "c1");

        for i in 0..150 {
            session.send_text(&format!("line {}", i)).unwrap();
        }
        // Greeting and the 50 oldest lines were dropped
        assert_eq!(session.queued_notifications(), 100);
        assert!(session.platform().notified().is_empty());

        session.platform_mut().budget = Some(3);
        session.handle_event(PeripheralEvent::ReadyToUpdate);
        assert_eq!(
            session.platform().notified(),
            vec!["line 50", "line 51", "line 52"]
        );
        assert_eq!(session.queued_notifications(), 97);

        session.platform_mut().budget = None;
        session.handle_event(PeripheralEvent::ReadyToUpdate);
        let notified = session.platform().notified();
        assert_eq!(notified.len(), 100);
        assert_eq!(notified.last().map(String::as_str), Some("line 149"));
        assert_eq!(session.queued_notifications(), 0);
    }

    #[test]
    fn test_new_payloads_wait_behind_queue() {
        let mut session = hosting();
        session.platform_mut().budget = Some(1);
        subscribe(&mut session, "c1");
        session.send_text("first").unwrap();
        session.platform_mut().budget = None;
        session.send_text("second").unwrap();
        assert_eq!(session.queued_notifications(), 2);

        session.handle_event(PeripheralEvent::ReadyToUpdate);
        let notified = session.platform().notified();
        assert_eq!(&notified[1..], &["first", "second"]);
    }

    #[test]
    fn test_writes_acknowledged_before_handling() {
        let mut session = hosting();
        subscribe(&mut session, "c1");
        session.handle_event(PeripheralEvent::WriteRequests(vec![
            WriteRequest {
                request_id: 7,
                central: DeviceId::from("c1"),
                characteristic: NOTIFY_CHARACTERISTIC_UUID,
                value: b"OFF".to_vec(),
            },
            WriteRequest {
                request_id: 8,
                central: DeviceId::from("c1"),
                characteristic: WRITE_CHARACTERISTIC_UUID,
                value: b"GET".to_vec(),
            },
        ]));

        let calls = &session.platform().calls;
        let tail: Vec<_> = calls.iter().skip(3).cloned().collect();
        assert_eq!(
            tail,
            vec![
                Call::Respond(7, AttResponse::RequestNotSupported),
                Call::Respond(8, AttResponse::Success),
                Call::Notify("IMG_ERROR no_file_selected".into()),
            ]
        );
    }

    #[test]
    fn test_inbound_messages_truncated_or_hex() {
        let mut session = hosting();
        let mut messages = session.subscribe_messages();

        write(&mut session, 1, "x".repeat(600).as_bytes());
        write(&mut session, 2, &[0xff, 0xfe]);
        write(&mut session, 3, &[0xff; 300]);
        write(&mut session, 4, b"Off");
        write(&mut session, 5, b"  hi there\r\n");
        write(&mut session, 6, b"");

        let long = messages.try_recv().unwrap();
        assert_eq!(long.chars().count(), 501);
        assert!(long.ends_with('…'));
        assert_eq!(messages.try_recv().unwrap(), "0xFFFE");

        let dump = messages.try_recv().unwrap();
        assert!(dump.starts_with("0xFFFF"));
        assert!(dump.ends_with('…'));
        assert_eq!(dump.chars().count(), 2 + 512 + 1);

        assert_eq!(messages.try_recv().unwrap(), "hi there");
        assert_eq!(messages.try_recv().unwrap(), "");
        assert!(messages.try_recv().is_err());
        assert!(!session.toggle());
    }

    #[test]
    fn test_get_image_streams_selected_png() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        let mut data = PNG_MAGIC.to_vec();
        data.extend(std::iter::repeat(7u8).take(400));
        file.write_all(&data).unwrap();

        let mut session = hosting();
        subscribe(&mut session, "c1");
        session.set_selected_image(Some(file.path().to_path_buf()));
        write(&mut session, 1, b"get_image");

        let notified = session.platform().notified();
        let lines = &notified[1..];
        assert!(lines[0].starts_with("IMG_BEGIN "));
        assert!(lines[0].ends_with(" 408"));
        assert_eq!(lines.last().map(String::as_str), Some("IMG_END"));
        assert!(lines[1..lines.len() - 1].iter().all(|l| l.len() <= 180));
    }

    #[test]
    fn test_stop_hosting_returns_to_ready() {
        let mut session = hosting();
        subscribe(&mut session, "c1");
        session.stop_hosting();
        assert_eq!(session.state(), PeripheralState::Ready);
        assert!(session.platform().calls.contains(&Call::StopAdvertising));
        assert!(session.platform().calls.contains(&Call::RemoveAllServices));
        assert_eq!(session.subscribers().count(), 0);

        // Hosting again registers the service afresh
        session.start_hosting();
        assert_eq!(session.platform().count(&Call::AddService), 2);
    }

    #[test]
    fn test_radio_failures() {
        let mut session =
            PeripheralSession::new(RecordingPlatform::default(), PeripheralOptions::default());
        session.handle_event(PeripheralEvent::PowerChanged(PowerState::Unauthorized));
        assert!(matches!(session.state(), PeripheralState::Failed(_)));

        let mut session = hosting();
        session.handle_event(PeripheralEvent::AdvertisingStarted {
            error: Some("busy".into()),
        });
        assert_eq!(session.state(), PeripheralState::Failed("busy".into()));

        session.handle_event(PeripheralEvent::PowerChanged(PowerState::PoweredOff));
        assert_eq!(session.state(), PeripheralState::Idle);
    }

    #[test]
    fn test_power_cycle_resumes_hosting() {
        let mut session = hosting();
        subscribe(&mut session, "c1");

        session.handle_event(PeripheralEvent::PowerChanged(PowerState::PoweredOff));
        assert_eq!(session.state(), PeripheralState::Idle);
        assert!(session.subscribers().next().is_none());

        session.handle_event(PeripheralEvent::PowerChanged(PowerState::PoweredOn));
        assert_eq!(session.platform().count(&Call::AddService), 2);
        assert_eq!(
            session
                .platform()
                .count(&Call::StartAdvertising("QDevice1".into())),
            2
        );
        session.handle_event(PeripheralEvent::AdvertisingStarted { error: None });
        assert_eq!(session.state(), PeripheralState::Advertising);
    }

    #[test]
    fn test_update_config_restarts_advertising() {
        let mut session = hosting();
        session.update_config(PeripheralOptions {
            local_name: "Renamed".into(),
            ..PeripheralOptions::default()
        });

        let calls = &session.platform().calls;
        assert_eq!(
            &calls[calls.len() - 2..],
            &[Call::StopAdvertising, Call::StartAdvertising("Renamed".into())]
        );
        assert_eq!(session.platform().count(&Call::AddService), 1);
    }

    #[test]
    fn test_send_text_requires_subscriber() {
        let mut session = hosting();
        assert_eq!(session.send_text("hi"), Err(LinkError::NoSubscribers));
    }
}
