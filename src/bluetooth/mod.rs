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

//! Bluetooth link module.
//!
//! Central and peripheral state machines for a Nordic UART style GATT link,
//! the line protocol they speak, and the platform adapters that drive them.

pub mod ble_constants;
mod central;
mod gatt_server;
mod image;
pub mod loopback;
mod notify_queue;
mod platform;
mod protocol;
mod reassembler;
mod registry;
pub mod runtime;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use central::{central_greeting, CentralOptions, CentralSession};
pub use gatt_server::{peripheral_greeting, PeripheralOptions, PeripheralSession};
pub use image::{encode_image, image_lines};
pub use notify_queue::NotifyQueue;
pub use platform::{AttResponse, CentralPlatform, PeripheralPlatform, WriteKind};
pub use protocol::{
    begin_line, error_line, hex_dump, truncate_chars, Command, TransferError,
    IMG_BEGIN, IMG_END, IMG_ERROR, PNG_MAGIC,
};
pub use reassembler::{chunk_lines, LineReassembler};
pub use registry::{DeviceRegistry, RegistryEntry};
