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

//! nus-link: BLE UART-style link with chunked image transfer

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nus_link::bluetooth::loopback::Loopback;
use nus_link::bluetooth::{CentralSession, PeripheralSession};
use nus_link::events::ProtocolEvent;
use nus_link::state::PowerState;
use nus_link::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a central and a peripheral against each other in-process
    Loopback {
        /// PNG served by the peripheral
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Directory received images are written to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Scan and connect over BlueZ
    #[cfg(feature = "bluez")]
    Central {
        /// Device address to connect to once seen
        #[arg(short, long)]
        target: Option<String>,
        /// Request the peripheral's image after connecting
        #[arg(long)]
        get_image: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Advertise and serve the link over BlueZ
    #[cfg(feature = "bluez")]
    Peripheral {
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nus_link=info".parse()?),
        )
        .init();

    info!("Starting nus-link v{}...", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded");

    match cli.command {
        Commands::Loopback { image, output } => {
            let image = image.or_else(|| config.transfer.image_path.clone());
            let output = output_dir(output, &config);
            run_loopback(&config, image, &output)
        }
        #[cfg(feature = "bluez")]
        Commands::Central {
            target,
            get_image,
            output,
        } => {
            let output = output_dir(output, &config);
            bluez::run_central(&config, target, get_image, &output).await
        }
        #[cfg(feature = "bluez")]
        Commands::Peripheral { image } => {
            let image = image.or_else(|| config.transfer.image_path.clone());
            bluez::run_peripheral(&config, image).await
        }
    }
}

fn output_dir(requested: Option<PathBuf>, config: &Config) -> PathBuf {
    requested.unwrap_or_else(|| {
        if config.data_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            config.data_dir.clone()
        }
    })
}

/// Write a received image under `dir`, keeping only the final path component
/// of the sender's filename.
fn save_image(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| "received.png".into());
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, data)?;
    Ok(path)
}

fn report(event: ProtocolEvent, output: &Path) {
    match event {
        ProtocolEvent::Message(text) => info!("Peripheral says: {}", text),
        ProtocolEvent::ImageStarted {
            filename,
            expected_bytes,
        } => info!("Receiving {} ({} bytes)", filename, expected_bytes),
        ProtocolEvent::ImageProgress {
            bytes_estimated,
            expected_bytes,
        } => tracing::debug!("Image progress {}/{}", bytes_estimated, expected_bytes),
        ProtocolEvent::ImageCompleted { data, filename } => {
            match save_image(output, &filename, &data) {
                Ok(path) => info!("Saved {} bytes to {}", data.len(), path.display()),
                Err(e) => warn!("Failed to save {}: {}", filename, e),
            }
        }
        ProtocolEvent::ImageFailed(reason) => warn!("Image transfer failed: {}", reason),
    }
}

fn run_loopback(config: &Config, image: Option<PathBuf>, output: &Path) -> Result<()> {
    let radio = Loopback::new();
    let mut central = CentralSession::new(radio.central(), config.central_options());
    let mut peripheral = PeripheralSession::new(radio.peripheral(), config.peripheral_options());
    if image.is_none() {
        info!("No image selected, image requests will be refused");
    }
    peripheral.set_selected_image(image);

    let mut events = central.subscribe_events();
    let mut messages = peripheral.subscribe_messages();
    let toggle = peripheral.subscribe_toggle();

    radio.set_power(PowerState::PoweredOn);
    peripheral.start_hosting();
    central.set_scanning_enabled(true);
    radio.pump(&mut central, &mut peripheral);

    let devices = central.subscribe_devices().borrow().clone();
    let Some(device) = devices
        .iter()
        .find(|d| d.name == config.bluetooth.local_name)
    else {
        bail!("{} was not discovered", config.bluetooth.local_name);
    };
    info!("Found {} ({}), RSSI {:?}", device.name, device.id, device.rssi);

    central.connect_device(device);
    radio.pump(&mut central, &mut peripheral);
    if !central.state().is_connected() {
        bail!("Connection failed: {:?}", central.state());
    }

    central.send_toggle(true)?;
    central.request_image()?;
    radio.pump(&mut central, &mut peripheral);
    info!("Remote toggle is {}", if *toggle.borrow() { "ON" } else { "OFF" });

    while let Ok(message) = messages.try_recv() {
        info!("Central says: {}", message);
    }
    while let Ok(event) = events.try_recv() {
        report(event, output);
    }

    central.disconnect();
    peripheral.stop_hosting();
    radio.pump(&mut central, &mut peripheral);
    info!("nus-link stopped");
    Ok(())
}

#[cfg(feature = "bluez")]
mod bluez {
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use tokio::sync::mpsc;
    use tracing::info;

    use nus_link::bluetooth::bluez::{BluezCentral, BluezPeripheral};
    use nus_link::bluetooth::runtime::{spawn_central, spawn_peripheral};
    use nus_link::bluetooth::{CentralSession, PeripheralSession};
    use nus_link::state::DeviceId;
    use nus_link::Config;

    pub async fn run_central(
        config: &Config,
        target: Option<String>,
        get_image: bool,
        output: &Path,
    ) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let platform = BluezCentral::new(events_tx).await?;
        let session = CentralSession::new(platform, config.central_options());
        let (handle, task) = spawn_central(session, events_rx);

        let mut events = handle.events();
        let mut state = handle.state.clone();
        let mut devices = handle.devices.clone();
        handle.set_scanning(true)?;
        if let Some(target) = target {
            handle.connect(DeviceId::from(target))?;
        }

        loop {
            tokio::select! {
                Ok(()) = devices.changed() => {
                    for device in devices.borrow_and_update().iter() {
                        info!("{:>5} dBm  {}  {}", device.rssi.unwrap_or_default(), device.id, device.name);
                    }
                }
                Ok(()) = state.changed() => {
                    let current = state.borrow_and_update().clone();
                    info!("Connection: {:?}", current);
                    if current.is_connected() && get_image {
                        handle.request_image().await?;
                    }
                }
                Ok(event) = events.recv() => super::report(event, output),
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        handle.shutdown()?;
        task.await?;
        Ok(())
    }

    pub async fn run_peripheral(config: &Config, image: Option<PathBuf>) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let platform = BluezPeripheral::new(events_tx).await?;
        let mut session = PeripheralSession::new(platform, config.peripheral_options());
        session.set_selected_image(image);
        let (handle, task) = spawn_peripheral(session, events_rx);

        let mut messages = handle.messages();
        let mut state = handle.state.clone();
        let mut toggle = handle.toggle.clone();
        handle.start_hosting()?;

        loop {
            tokio::select! {
                Ok(message) = messages.recv() => info!("Central says: {}", message),
                Ok(()) = toggle.changed() => {
                    info!("Remote toggle: {}", if *toggle.borrow_and_update() { "ON" } else { "OFF" });
                }
                Ok(()) = state.changed() => {
                    info!("Peripheral: {}", state.borrow_and_update().as_str());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        handle.shutdown()?;
        task.await?;
        Ok(())
    }
}
