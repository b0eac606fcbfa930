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

//! Central role over BlueZ.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{default_adapter, power_state, watch_power};
use crate::bluetooth::runtime::schedule_timer;
use crate::bluetooth::{CentralPlatform, WriteKind};
use crate::events::{
    Advertisement, CentralEvent, CentralTimer, CharacteristicInfo, CharacteristicProperties,
};
use crate::state::DeviceId;

type Events = mpsc::UnboundedSender<CentralEvent<Device>>;

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

fn device_id(device: &Device) -> DeviceId {
    DeviceId::new(device.address().to_string())
}

pub struct BluezCentral {
    adapter: Adapter,
    events: Events,
    names: Arc<Mutex<HashMap<Address, String>>>,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    scan_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    notify_tasks: HashMap<Uuid, JoinHandle<()>>,
    _power_task: JoinHandle<()>,
}

impl BluezCentral {
    /// Open the default adapter and start reporting its power state on `events`.
    pub async fn new(events: Events) -> Result<Self> {
        let adapter = default_adapter().await?;
        let powered = adapter.is_powered().await?;
        let _ = events.send(CentralEvent::PowerChanged(power_state(powered)));

        let power_task = {
            let events = events.clone();
            watch_power(adapter.clone(), move |state| {
                events.send(CentralEvent::PowerChanged(state)).is_ok()
            })
        };

        Ok(Self {
            adapter,
            events,
            names: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            scan_task: None,
            link_task: None,
            notify_tasks: HashMap::new(),
            _power_task: power_task,
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics.lock().get(&uuid).cloned()
    }
}

async fn advertisement(device: &Device) -> bluer::Result<Advertisement> {
    let manufacturer_data = device
        .manufacturer_data()
        .await?
        .map(|data| data.into_values().flatten().collect())
        .unwrap_or_default();
    Ok(Advertisement {
        id: device_id(device),
        local_name: device.name().await?,
        platform_name: Some(device.alias().await?),
        manufacturer_data,
        services: device
            .uuids()
            .await?
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default(),
        connectable: None,
        rssi: device.rssi().await?.unwrap_or(0),
    })
}

async fn report(device: Device, events: &Events, names: &Mutex<HashMap<Address, String>>) {
    match advertisement(&device).await {
        Ok(advertisement) => {
            if let Some(name) = &advertisement.local_name {
                names.lock().insert(device.address(), name.clone());
            }
            let _ = events.send(CentralEvent::Discovered {
                peripheral: device,
                advertisement,
            });
        }
        Err(e) => debug!("Skipping {}: {}", device.address(), e),
    }
}

async fn scan(adapter: Adapter, events: Events, names: Arc<Mutex<HashMap<Address, String>>>) -> Result<()> {
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        })
        .await?;
    let mut stream = Box::pin(adapter.discover_devices_with_changes().await?);
    let mut watchers = tokio::task::JoinSet::new();

    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = adapter.device(address)?;
        report(device.clone(), &events, &names).await;

        // Signal strength updates arrive as property changes
        let events = events.clone();
        let names = names.clone();
        watchers.spawn(async move {
            let Ok(changes) = device.events().await else {
                return;
            };
            let mut changes = Box::pin(changes);
            while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
                if matches!(
                    property,
                    DeviceProperty::Rssi(_) | DeviceProperty::Name(_) | DeviceProperty::Uuids(_)
                ) {
                    report(device.clone(), &events, &names).await;
                }
            }
        });
    }
    Ok(())
}

async fn wait_for_services(device: &Device) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("services not resolved"));
        }
        tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
    }
    Ok(())
}

impl CentralPlatform for BluezCentral {
    type Peripheral = Device;

    fn start_scan(&mut self, _allow_duplicates: bool) {
        if self.scan_task.is_some() {
            return;
        }
        let (adapter, events, names) = (self.adapter.clone(), self.events.clone(), self.names.clone());
        self.scan_task = Some(tokio::spawn(async move {
            if let Err(e) = scan(adapter, events, names).await {
                warn!("Discovery stopped: {}", e);
            }
        }));
    }

    fn stop_scan(&mut self) {
        // Dropping the discovery stream ends discovery
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn retrieve_peripheral(&mut self, id: &DeviceId) -> Option<Device> {
        let address: Address = id.as_str().parse().ok()?;
        self.adapter.device(address).ok()
    }

    fn peripheral_name(&self, peripheral: &Device) -> Option<String> {
        self.names.lock().get(&peripheral.address()).cloned()
    }

    fn connect(&mut self, peripheral: &Device) {
        let device = peripheral.clone();
        let events = self.events.clone();
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link_task = Some(tokio::spawn(async move {
            let id = device_id(&device);
            if let Err(e) = device.connect().await {
                let _ = events.send(CentralEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                });
                return;
            }
            let _ = events.send(CentralEvent::Connected { id: id.clone() });

            let Ok(changes) = device.events().await else {
                return;
            };
            let mut changes = Box::pin(changes);
            while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
                if let DeviceProperty::Connected(false) = property {
                    let _ = events.send(CentralEvent::Disconnected {
                        id,
                        reason: Some("Link lost".to_string()),
                    });
                    break;
                }
            }
        }));
    }

    fn cancel_connection(&mut self, peripheral: &Device) {
        for (_, task) in self.notify_tasks.drain() {
            task.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.characteristics.lock().clear();

        let device = peripheral.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("Disconnect of {} failed: {}", device.address(), e);
            }
            let _ = events.send(CentralEvent::Disconnected {
                id: device_id(&device),
                reason: None,
            });
        });
    }

    fn discover_services(&mut self, peripheral: &Device, filter: Option<&[Uuid]>) {
        let device = peripheral.clone();
        let events = self.events.clone();
        let filter = filter.map(<[Uuid]>::to_vec);
        tokio::spawn(async move {
            let result = async {
                wait_for_services(&device).await?;
                let mut services = Vec::new();
                for service in device.services().await? {
                    let uuid = service.uuid().await?;
                    if filter.as_ref().map_or(true, |f| f.contains(&uuid)) {
                        services.push(uuid);
                    }
                }
                Ok::<_, anyhow::Error>(services)
            }
            .await;

            let services = result.unwrap_or_else(|e| {
                warn!("Service discovery failed: {}", e);
                Vec::new()
            });
            let _ = events.send(CentralEvent::ServicesDiscovered {
                id: device_id(&device),
                services,
            });
        });
    }

    fn discover_characteristics(&mut self, peripheral: &Device, service: Uuid, filter: Option<&[Uuid]>) {
        let device = peripheral.clone();
        let events = self.events.clone();
        let cache = self.characteristics.clone();
        let filter = filter.map(<[Uuid]>::to_vec);
        tokio::spawn(async move {
            let result = async {
                let mut found = Vec::new();
                for remote in device.services().await? {
                    if remote.uuid().await? != service {
                        continue;
                    }
                    for characteristic in remote.characteristics().await? {
                        let uuid = characteristic.uuid().await?;
                        if !filter.as_ref().map_or(true, |f| f.contains(&uuid)) {
                            continue;
                        }
                        let flags = characteristic.flags().await?;
                        found.push(CharacteristicInfo {
                            uuid,
                            properties: CharacteristicProperties {
                                read: flags.read,
                                write: flags.write,
                                write_without_response: flags.write_without_response,
                                notify: flags.notify,
                                indicate: flags.indicate,
                            },
                        });
                        cache.lock().insert(uuid, characteristic);
                    }
                }
                Ok::<_, anyhow::Error>(found)
            }
            .await;

            let characteristics = result.unwrap_or_else(|e| {
                warn!("Characteristic discovery failed: {}", e);
                Vec::new()
            });
            let _ = events.send(CentralEvent::CharacteristicsDiscovered {
                id: device_id(&device),
                service,
                characteristics,
            });
        });
    }

    fn set_notify(&mut self, peripheral: &Device, characteristic: Uuid, enabled: bool) {
        if let Some(task) = self.notify_tasks.remove(&characteristic) {
            // Dropping the notification stream unsubscribes
            task.abort();
        }
        if !enabled {
            return;
        }
        let Some(remote) = self.characteristic(characteristic) else {
            warn!("Cannot subscribe to unknown characteristic {}", characteristic);
            return;
        };
        let id = device_id(peripheral);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let stream = match remote.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Subscribe to {} failed: {}", characteristic, e);
                    return;
                }
            };
            info!("Subscribed to {}", characteristic);
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                let _ = events.send(CentralEvent::ValueUpdated {
                    id: id.clone(),
                    characteristic,
                    value,
                });
            }
        });
        self.notify_tasks.insert(characteristic, task);
    }

    fn write(&mut self, peripheral: &Device, characteristic: Uuid, data: &[u8], kind: WriteKind) {
        let Some(remote) = self.characteristic(characteristic) else {
            warn!("Cannot write to unknown characteristic {}", characteristic);
            return;
        };
        let id = device_id(peripheral);
        let events = self.events.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            let request = CharacteristicWriteRequest {
                op_type: match kind {
                    WriteKind::WithResponse => WriteOp::Request,
                    WriteKind::WithoutResponse => WriteOp::Command,
                },
                ..Default::default()
            };
            let error = remote
                .write_ext(&data, &request)
                .await
                .err()
                .map(|e| e.to_string());
            if kind == WriteKind::WithResponse || error.is_some() {
                let _ = events.send(CentralEvent::WriteAcknowledged {
                    id,
                    characteristic,
                    error,
                });
            }
        });
    }

    fn schedule(&mut self, delay: Duration, timer: CentralTimer) {
        schedule_timer(&self.events, delay, timer);
    }
}
