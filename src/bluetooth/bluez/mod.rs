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

//! BlueZ implementations of the platform seams (feature `bluez`).
//!
//! Each request spawns a task that performs the D-Bus call and reports the
//! outcome on the role's event channel.

mod central;
mod peripheral;

pub use central::BluezCentral;
pub use peripheral::BluezPeripheral;

use anyhow::Result;
use bluer::{AdapterEvent, AdapterProperty};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::PowerState;

/// Open a BlueZ session on the default adapter, powering it on if needed.
pub(crate) async fn default_adapter() -> Result<bluer::Adapter> {
    let session = bluer::Session::new().await?;
    info!("BlueZ session created");

    let adapter = session.default_adapter().await?;
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }
    Ok(adapter)
}

pub(crate) fn power_state(powered: bool) -> PowerState {
    if powered {
        PowerState::PoweredOn
    } else {
        PowerState::PoweredOff
    }
}

/// Forward adapter power changes to `report` until it returns false.
pub(crate) fn watch_power(
    adapter: bluer::Adapter,
    report: impl Fn(PowerState) -> bool + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(stream) = adapter.events().await else {
            warn!("Adapter events unavailable");
            return;
        };
        let mut stream = Box::pin(stream);
        while let Some(event) = stream.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                info!("Adapter powered: {}", powered);
                if !report(power_state(powered)) {
                    break;
                }
            }
        }
    })
}
