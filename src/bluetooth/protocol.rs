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

//! Line protocol keywords, commands and fault reasons.

use thiserror::Error;

use super::ble_constants::config;

/// Starts a chunked image transfer: `IMG_BEGIN <filename> <bytes>`.
pub const IMG_BEGIN: &str = "IMG_BEGIN";
/// Ends a chunked image transfer.
pub const IMG_END: &str = "IMG_END";
/// Aborts a transfer: `IMG_ERROR <reason>`.
pub const IMG_ERROR: &str = "IMG_ERROR";

/// PNG file signature.
pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Commands understood by the hosting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    GetImage,
}

impl Command {
    /// Parse from a received line, ignoring case and surrounding whitespace.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ON" => Some(Self::On),
            "OFF" => Some(Self::Off),
            "GET" | "GET_IMAGE" => Some(Self::GetImage),
            _ => None,
        }
    }

    /// Convert to the canonical wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::GetImage => "GET_IMAGE",
        }
    }

    pub fn toggle(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Machine-readable image transfer fault. `Display` is the wire reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("begin_bad_format")]
    BeginBadFormat,
    #[error("too_large")]
    TooLarge,
    #[error("base64_invalid")]
    Base64Invalid,
    #[error("size_mismatch exp={expected} got={actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("no_file_selected")]
    NoFileSelected,
    #[error("not_png")]
    NotPng,
    #[error("read_failed")]
    ReadFailed,
}

/// `IMG_BEGIN <filename> <bytes>`
pub fn begin_line(filename: &str, bytes: usize) -> String {
    format!("{} {} {}", IMG_BEGIN, filename, bytes)
}

/// `IMG_ERROR <reason>`
pub fn error_line(error: &TransferError) -> String {
    format!("{} {}", IMG_ERROR, error)
}

/// Truncate to `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Render binary data as `0x`-prefixed uppercase hex, capped for display.
pub fn hex_dump(data: &[u8]) -> String {
    let hex = hex::encode_upper(data);
    if hex.len() > config::MAX_HEX_CHARS {
        format!("0x{}…", &hex[..config::MAX_HEX_CHARS])
    } else {
        format!("0x{}", hex)
    }
}
