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

//! Errors returned by link operations that cannot be issued.

use thiserror::Error;

/// Why a command could not be put on the air.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("No write characteristic resolved")]
    NoWriteCharacteristic,

    #[error("No central is subscribed")]
    NoSubscribers,

    #[error("Link runtime has stopped")]
    RuntimeStopped,
}
