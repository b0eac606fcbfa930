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

//! Peripheral role over BlueZ: a GATT application with one write and one
//! notify characteristic, plus an LE advertisement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, Service,
};
use bluer::Adapter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{default_adapter, power_state, watch_power};
use crate::bluetooth::ble_constants::GattLayout;
use crate::bluetooth::{AttResponse, PeripheralPlatform};
use crate::events::{PeripheralEvent, WriteRequest};
use crate::state::DeviceId;

type Events = mpsc::UnboundedSender<PeripheralEvent>;

/// Notifications buffered between the session and BlueZ.
const NOTIFY_CHANNEL_CAPACITY: usize = 32;

pub struct BluezPeripheral {
    adapter: Adapter,
    events: Events,
    app: Arc<Mutex<Option<ApplicationHandle>>>,
    advertisement: Arc<Mutex<Option<AdvertisementHandle>>>,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
    waiting: Arc<AtomicBool>,
    next_request_id: Arc<AtomicU64>,
    _power_task: JoinHandle<()>,
}

impl BluezPeripheral {
    pub async fn new(events: Events) -> Result<Self> {
        let adapter = default_adapter().await?;
        let powered = adapter.is_powered().await?;
        let _ = events.send(PeripheralEvent::PowerChanged(power_state(powered)));

        let power_task = {
            let events = events.clone();
            watch_power(adapter.clone(), move |state| {
                events.send(PeripheralEvent::PowerChanged(state)).is_ok()
            })
        };

        Ok(Self {
            adapter,
            events,
            app: Arc::new(Mutex::new(None)),
            advertisement: Arc::new(Mutex::new(None)),
            notify_tx: None,
            waiting: Arc::new(AtomicBool::new(false)),
            next_request_id: Arc::new(AtomicU64::new(1)),
            _power_task: power_task,
        })
    }

    fn write_characteristic(&self, uuid: Uuid) -> Characteristic {
        let events = self.events.clone();
        let next_request_id = self.next_request_id.clone();
        let (_, control_handle) = characteristic_control();

        Characteristic {
            uuid,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                        // BlueZ answers the ATT request when this future resolves
                        let request = WriteRequest {
                            request_id: next_request_id.fetch_add(1, Ordering::Relaxed),
                            central: DeviceId::new(req.device_address.to_string()),
                            characteristic: uuid,
                            value,
                        };
                        let _ = events.send(PeripheralEvent::WriteRequests(vec![request]));
                        Box::pin(async { Ok::<(), ReqError>(()) })
                    },
                )),
                ..Default::default()
            }),
            control_handle,
            ..Default::default()
        }
    }

    fn notify_characteristic(&mut self, uuid: Uuid) -> Characteristic {
        let (notify_tx, notify_rx) = mpsc::channel::<Vec<u8>>(NOTIFY_CHANNEL_CAPACITY);
        let notify_rx = Arc::new(tokio::sync::Mutex::new(notify_rx));
        self.notify_tx = Some(notify_tx);

        let events = self.events.clone();
        let waiting = self.waiting.clone();
        let sessions = Arc::new(AtomicU64::new(1));
        let (_, control_handle) = characteristic_control();

        Characteristic {
            uuid,
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                    let notify_rx = notify_rx.clone();
                    let events = events.clone();
                    let waiting = waiting.clone();
                    let central = DeviceId::new(format!(
                        "bluez-subscriber-{}",
                        sessions.fetch_add(1, Ordering::Relaxed)
                    ));

                    Box::pin(async move {
                        let _ = events.send(PeripheralEvent::Subscribed {
                            central: central.clone(),
                            characteristic: uuid,
                        });
                        loop {
                            let data = {
                                let mut rx = notify_rx.lock().await;
                                rx.recv().await
                            };
                            let Some(data) = data else {
                                info!("Notify channel closed");
                                break;
                            };
                            debug!("Sending notification: {} bytes", data.len());
                            if let Err(e) = notifier.notify(data).await {
                                error!("Failed to send notification: {}", e);
                                break;
                            }
                            if waiting.swap(false, Ordering::AcqRel) {
                                let _ = events.send(PeripheralEvent::ReadyToUpdate);
                            }
                        }
                        let _ = events.send(PeripheralEvent::Unsubscribed {
                            central,
                            characteristic: uuid,
                        });
                    })
                })),
                ..Default::default()
            }),
            control_handle,
            ..Default::default()
        }
    }
}

impl PeripheralPlatform for BluezPeripheral {
    fn add_service(&mut self, layout: &GattLayout) {
        let application = Application {
            services: vec![Service {
                uuid: layout.service,
                primary: true,
                characteristics: vec![
                    self.write_characteristic(layout.write_characteristic),
                    self.notify_characteristic(layout.notify_characteristic),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let app = self.app.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let error = match adapter.serve_gatt_application(application).await {
                Ok(handle) => {
                    *app.lock() = Some(handle);
                    info!("GATT service registered");
                    None
                }
                Err(e) => Some(e.to_string()),
            };
            let _ = events.send(PeripheralEvent::ServiceAdded { error });
        });
    }

    fn remove_all_services(&mut self) {
        // Dropping the handle unregisters the application
        self.app.lock().take();
        self.notify_tx = None;
    }

    fn start_advertising(&mut self, service: Uuid, local_name: &str) {
        let advertisement = Advertisement {
            service_uuids: vec![service].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(local_name.to_string()),
            ..Default::default()
        };

        let adapter = self.adapter.clone();
        let handle = self.advertisement.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let error = match adapter.advertise(advertisement).await {
                Ok(advertising) => {
                    *handle.lock() = Some(advertising);
                    info!("BLE advertising started");
                    None
                }
                Err(e) => Some(e.to_string()),
            };
            let _ = events.send(PeripheralEvent::AdvertisingStarted { error });
        });
    }

    fn stop_advertising(&mut self) {
        self.advertisement.lock().take();
    }

    fn respond(&mut self, request: &WriteRequest, response: AttResponse) {
        // Already answered from the write callback
        debug!("Write {} answered: {:?}", request.request_id, response);
    }

    fn update_value(&mut self, _characteristic: Uuid, data: &[u8]) -> bool {
        let Some(tx) = &self.notify_tx else {
            return true;
        };
        match tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.waiting.store(true, Ordering::Release);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }
}
