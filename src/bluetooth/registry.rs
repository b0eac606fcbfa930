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

//! Device registry: freshest known view of every discovered endpoint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::events::Advertisement;
use crate::state::{Device, DeviceId};

/// One discovered peripheral plus housekeeping.
#[derive(Debug, Clone)]
pub struct RegistryEntry<P> {
    pub peripheral: P,
    pub id: DeviceId,
    pub rssi: Option<i16>,
    pub connectable: Option<bool>,
    pub local_name: Option<String>,
    pub platform_name: Option<String>,
    pub preferred_service: Option<Uuid>,
    pub last_seen: Instant,
}

impl<P> RegistryEntry<P> {
    /// Advertised name, then platform name, then "Unknown".
    pub fn display_name(&self) -> String {
        [&self.local_name, &self.platform_name]
            .into_iter()
            .flatten()
            .map(|name| name.trim())
            .find(|name| !name.is_empty())
            .unwrap_or(Device::UNKNOWN_NAME)
            .to_string()
    }

    pub fn device(&self) -> Device {
        Device {
            id: self.id.clone(),
            name: self.display_name(),
            rssi: self.rssi,
            connectable: self.connectable,
            preferred_service: self.preferred_service,
        }
    }
}

/// Registry of discovered peripherals keyed by identifier.
pub struct DeviceRegistry<P> {
    entries: HashMap<DeviceId, RegistryEntry<P>>,
    well_known_service: Uuid,
    stale_after: Duration,
}

impl<P> DeviceRegistry<P> {
    /// `well_known_service` is preferred when a device advertises it.
    pub fn new(well_known_service: Uuid, stale_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            well_known_service,
            stale_after,
        }
    }

    /// Merge an advertisement into the registry, stamping it as seen now.
    pub fn upsert(&mut self, peripheral: P, advertisement: &Advertisement) {
        self.upsert_at(peripheral, advertisement, Instant::now());
    }

    pub fn upsert_at(&mut self, peripheral: P, advertisement: &Advertisement, now: Instant) {
        let well_known = self.well_known_service;
        let entry = self
            .entries
            .entry(advertisement.id.clone())
            .or_insert_with(|| {
                debug!("Discovered new device: {}", advertisement.id);
                RegistryEntry {
                    peripheral,
                    id: advertisement.id.clone(),
                    rssi: None,
                    connectable: None,
                    local_name: None,
                    platform_name: None,
                    preferred_service: None,
                    last_seen: now,
                }
            });

        entry.rssi = Some(advertisement.rssi);
        entry.connectable = advertisement.connectable;
        if let Some(name) = advertisement
            .local_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            entry.local_name = Some(name.to_string());
        }
        if advertisement.platform_name.is_some() {
            entry.platform_name = advertisement.platform_name.clone();
        }
        if advertisement.services.contains(&well_known) {
            entry.preferred_service = Some(well_known);
        } else if let Some(first) = advertisement.services.first() {
            entry.preferred_service = Some(*first);
        }
        entry.last_seen = now;
    }

    /// Record a peripheral the platform retrieved by identifier (never advertised).
    pub fn insert_retrieved(&mut self, id: DeviceId, peripheral: P, platform_name: Option<String>) {
        self.entries.insert(
            id.clone(),
            RegistryEntry {
                peripheral,
                id,
                rssi: None,
                connectable: None,
                local_name: None,
                platform_name,
                preferred_service: None,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get(&self, id: &DeviceId) -> Option<&RegistryEntry<P>> {
        self.entries.get(id)
    }

    /// Devices to show: valid negative signal strength, and either fresh or
    /// the connected device. Strongest first, ties by name.
    pub fn snapshot(&self, connected: Option<&DeviceId>) -> Vec<Device> {
        self.snapshot_at(Instant::now(), connected)
    }

    pub fn snapshot_at(&self, now: Instant, connected: Option<&DeviceId>) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .entries
            .values()
            .filter(|entry| {
                Some(&entry.id) == connected
                    || now.saturating_duration_since(entry.last_seen) <= self.stale_after
            })
            .filter(|entry| matches!(entry.rssi, Some(rssi) if rssi < 0))
            .map(RegistryEntry::device)
            .collect();

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.name.cmp(&b.name)));
        devices
    }

    /// Forget every entry (radio powered off).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
