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

//! Tokio drivers for the link state machines.
//!
//! Each role runs on one task that owns its session. Platform callbacks and
//! application commands arrive over channels and are applied one at a time,
//! so the session itself needs no locking.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::central::CentralSession;
use super::gatt_server::{PeripheralOptions, PeripheralSession};
use super::platform::{CentralPlatform, PeripheralPlatform};
use crate::error::LinkError;
use crate::events::{CentralEvent, CentralTimer, PeripheralEvent, ProtocolEvent};
use crate::state::{ConnectionState, Device, DeviceId, PeripheralState, PowerState, SessionDetail};

/// How often the visible device list is recomputed to age out stale entries.
const DEVICE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

type Reply = oneshot::Sender<Result<(), LinkError>>;

/// Deliver `CentralEvent::TimerFired(timer)` on `events` after `delay`.
pub fn schedule_timer<P: Send + 'static>(
    events: &mpsc::UnboundedSender<CentralEvent<P>>,
    delay: Duration,
    timer: CentralTimer,
) {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(CentralEvent::TimerFired(timer));
    });
}

/// Application requests for the central task.
#[derive(Debug)]
pub enum CentralCommand {
    SetScanning(bool),
    Connect(DeviceId),
    Disconnect,
    ClearIntent,
    Send { text: String, reply: Reply },
    SendToggle { on: bool, reply: Reply },
    RequestImage { reply: Reply },
    Shutdown,
}

/// Handle to a running central task.
#[derive(Clone)]
pub struct CentralHandle {
    commands: mpsc::UnboundedSender<CentralCommand>,
    pub state: watch::Receiver<ConnectionState>,
    pub devices: watch::Receiver<Vec<Device>>,
    pub detail: watch::Receiver<Option<SessionDetail>>,
    pub scanning: watch::Receiver<bool>,
    pub power: watch::Receiver<PowerState>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl CentralHandle {
    /// New receiver for inbound protocol events.
    pub fn events(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub fn set_scanning(&self, enabled: bool) -> Result<(), LinkError> {
        self.command(CentralCommand::SetScanning(enabled))
    }

    pub fn connect(&self, id: DeviceId) -> Result<(), LinkError> {
        self.command(CentralCommand::Connect(id))
    }

    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.command(CentralCommand::Disconnect)
    }

    pub fn clear_connection_intent(&self) -> Result<(), LinkError> {
        self.command(CentralCommand::ClearIntent)
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let text = text.into();
        self.request(|reply| CentralCommand::Send { text, reply }).await
    }

    pub async fn send_toggle(&self, on: bool) -> Result<(), LinkError> {
        self.request(|reply| CentralCommand::SendToggle { on, reply })
            .await
    }

    pub async fn request_image(&self) -> Result<(), LinkError> {
        self.request(|reply| CentralCommand::RequestImage { reply })
            .await
    }

    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.command(CentralCommand::Shutdown)
    }

    fn command(&self, command: CentralCommand) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::RuntimeStopped)
    }

    async fn request(&self, command: impl FnOnce(Reply) -> CentralCommand) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.command(command(tx))?;
        rx.await.map_err(|_| LinkError::RuntimeStopped)?
    }
}

/// Run `session` on its own task, fed by platform `events`.
pub fn spawn_central<A>(
    session: CentralSession<A>,
    events: mpsc::UnboundedReceiver<CentralEvent<A::Peripheral>>,
) -> (CentralHandle, JoinHandle<()>)
where
    A: CentralPlatform + Send + 'static,
    A::Peripheral: Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = CentralHandle {
        commands: commands_tx,
        state: session.subscribe_state(),
        devices: session.subscribe_devices(),
        detail: session.subscribe_detail(),
        scanning: session.subscribe_scanning(),
        power: session.subscribe_power(),
        events: session.event_sender(),
    };
    let task = tokio::spawn(run_central(session, events, commands_rx));
    (handle, task)
}

async fn run_central<A: CentralPlatform>(
    mut session: CentralSession<A>,
    mut events: mpsc::UnboundedReceiver<CentralEvent<A::Peripheral>>,
    mut commands: mpsc::UnboundedReceiver<CentralCommand>,
) {
    info!("Central task started");
    let mut refresh = tokio::time::interval(DEVICE_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = events.recv() => session.handle_event(event),
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All central handles dropped");
                    break;
                };
                match command {
                    CentralCommand::SetScanning(enabled) => session.set_scanning_enabled(enabled),
                    CentralCommand::Connect(id) => session.connect(&id),
                    CentralCommand::Disconnect => session.disconnect(),
                    CentralCommand::ClearIntent => session.clear_connection_intent(),
                    CentralCommand::Send { text, reply } => {
                        let _ = reply.send(session.send(&text));
                    }
                    CentralCommand::SendToggle { on, reply } => {
                        let _ = reply.send(session.send_toggle(on));
                    }
                    CentralCommand::RequestImage { reply } => {
                        let _ = reply.send(session.request_image());
                    }
                    CentralCommand::Shutdown => {
                        session.disconnect();
                        break;
                    }
                }
            }
            _ = refresh.tick() => session.refresh_devices(),
        }
    }
    info!("Central task stopped");
}

/// Application requests for the peripheral task.
#[derive(Debug)]
pub enum PeripheralCommand {
    StartHosting,
    StopHosting,
    UpdateConfig(PeripheralOptions),
    SelectImage(Option<PathBuf>),
    SendText { text: String, reply: Reply },
    Shutdown,
}

/// Handle to a running peripheral task.
#[derive(Clone)]
pub struct PeripheralHandle {
    commands: mpsc::UnboundedSender<PeripheralCommand>,
    pub state: watch::Receiver<PeripheralState>,
    pub toggle: watch::Receiver<bool>,
    messages: broadcast::Sender<String>,
}

impl PeripheralHandle {
    /// New receiver for inbound text messages.
    pub fn messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    pub fn start_hosting(&self) -> Result<(), LinkError> {
        self.command(PeripheralCommand::StartHosting)
    }

    pub fn stop_hosting(&self) -> Result<(), LinkError> {
        self.command(PeripheralCommand::StopHosting)
    }

    pub fn update_config(&self, options: PeripheralOptions) -> Result<(), LinkError> {
        self.command(PeripheralCommand::UpdateConfig(options))
    }

    pub fn set_selected_image(&self, path: Option<PathBuf>) -> Result<(), LinkError> {
        self.command(PeripheralCommand::SelectImage(path))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.command(PeripheralCommand::SendText {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| LinkError::RuntimeStopped)?
    }

    pub fn shutdown(&self) -> Result<(), LinkError> {
        self.command(PeripheralCommand::Shutdown)
    }

    fn command(&self, command: PeripheralCommand) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::RuntimeStopped)
    }
}

/// Run `session` on its own task, fed by platform `events`.
pub fn spawn_peripheral<A>(
    session: PeripheralSession<A>,
    events: mpsc::UnboundedReceiver<PeripheralEvent>,
) -> (PeripheralHandle, JoinHandle<()>)
where
    A: PeripheralPlatform + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = PeripheralHandle {
        commands: commands_tx,
        state: session.subscribe_state(),
        toggle: session.subscribe_toggle(),
        messages: session.message_sender(),
    };
    let task = tokio::spawn(run_peripheral(session, events, commands_rx));
    (handle, task)
}

async fn run_peripheral<A: PeripheralPlatform>(
    mut session: PeripheralSession<A>,
    mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
    mut commands: mpsc::UnboundedReceiver<PeripheralCommand>,
) {
    info!("Peripheral task started");
    loop {
        tokio::select! {
            Some(event) = events.recv() => session.handle_event(event),
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All peripheral handles dropped");
                    break;
                };
                match command {
                    PeripheralCommand::StartHosting => session.start_hosting(),
                    PeripheralCommand::StopHosting => session.stop_hosting(),
                    PeripheralCommand::UpdateConfig(options) => session.update_config(options),
                    PeripheralCommand::SelectImage(path) => session.set_selected_image(path),
                    PeripheralCommand::SendText { text, reply } => {
                        let _ = reply.send(session.send_text(&text));
                    }
                    PeripheralCommand::Shutdown => {
                        session.stop_hosting();
                        break;
                    }
                }
            }
        }
    }
    info!("Peripheral task stopped");
}
