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

//! Line protocol reassembly: text lines in, structured protocol events out.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use tracing::{debug, warn};

use super::ble_constants::config;
use super::protocol::{TransferError, IMG_BEGIN, IMG_END, IMG_ERROR};
use crate::events::ProtocolEvent;

/// Decoder tolerant of missing padding; unknown characters are stripped
/// before decoding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Finite-state line parser for one logical stream.
///
/// Idle lines pass through as messages; an `IMG_BEGIN` line switches to
/// accumulating base64 until `IMG_END`. Every completed, failed or aborted
/// transfer resets the state.
pub struct LineReassembler {
    receiving_image: bool,
    buffer: String,
    expected_bytes: usize,
    filename: String,
    max_base64_chars: usize,
}

impl LineReassembler {
    /// Create a new reassembler with the default accumulation cap.
    pub fn new() -> Self {
        Self::with_limit(config::MAX_BASE64_CHARS)
    }

    /// Create a reassembler that fails transfers above `max_base64_chars`.
    pub fn with_limit(max_base64_chars: usize) -> Self {
        Self {
            receiving_image: false,
            buffer: String::new(),
            expected_bytes: 0,
            filename: String::new(),
            max_base64_chars,
        }
    }

    /// Feed one line. Returns the event it produced, if any.
    pub fn feed(&mut self, raw: &str) -> Option<ProtocolEvent> {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }

        if self.receiving_image {
            return self.process_chunk_or_end(line);
        }

        let mut fields = line.split_whitespace();
        if fields.next() == Some(IMG_BEGIN) {
            return Some(self.process_begin(fields));
        }

        if line.starts_with(IMG_ERROR) {
            // Residual state from a dropped end marker must not survive an abort
            self.reset();
        }
        Some(ProtocolEvent::Message(line.to_string()))
    }

    /// Feed a characteristic payload that may carry several newline-delimited lines.
    pub fn feed_payload(&mut self, text: &str) -> Vec<ProtocolEvent> {
        text.lines().filter_map(|line| self.feed(line)).collect()
    }

    fn process_begin<'a>(&mut self, mut fields: impl Iterator<Item = &'a str>) -> ProtocolEvent {
        let (Some(filename), Some(bytes)) = (fields.next(), fields.next()) else {
            warn!("Malformed image begin line");
            return ProtocolEvent::ImageFailed(TransferError::BeginBadFormat);
        };

        self.buffer.clear();
        self.filename = filename.to_string();
        self.expected_bytes = bytes.parse().unwrap_or(0);
        self.receiving_image = true;

        debug!(
            "Started image reassembly: {} ({} bytes expected)",
            self.filename, self.expected_bytes
        );

        ProtocolEvent::ImageStarted {
            filename: self.filename.clone(),
            expected_bytes: self.expected_bytes,
        }
    }

    fn process_chunk_or_end(&mut self, line: &str) -> Option<ProtocolEvent> {
        if line == IMG_END {
            return Some(self.complete());
        }

        if self.buffer.len() + line.len() > self.max_base64_chars {
            warn!(
                "Image accumulation exceeded {} base64 chars",
                self.max_base64_chars
            );
            self.reset();
            return Some(ProtocolEvent::ImageFailed(TransferError::TooLarge));
        }

        self.buffer.push_str(line);
        if self.expected_bytes > 0 {
            // base64 expands data 4:3
            Some(ProtocolEvent::ImageProgress {
                bytes_estimated: self.buffer.len() * 3 / 4,
                expected_bytes: self.expected_bytes,
            })
        } else {
            None
        }
    }

    fn complete(&mut self) -> ProtocolEvent {
        let cleaned: String = self
            .buffer
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
            .collect();
        let expected = self.expected_bytes;
        let filename = std::mem::take(&mut self.filename);
        self.reset();

        let data = match LENIENT.decode(cleaned.as_bytes()) {
            Ok(data) => data,
            Err(e) => {
                warn!("Image payload is not valid base64: {}", e);
                return ProtocolEvent::ImageFailed(TransferError::Base64Invalid);
            }
        };

        if expected > 0 && data.len() != expected {
            warn!(
                "Image length mismatch: expected {}, got {}",
                expected,
                data.len()
            );
            return ProtocolEvent::ImageFailed(TransferError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        debug!("Image reassembly complete: {} bytes", data.len());
        ProtocolEvent::ImageCompleted { data, filename }
    }

    /// Reset the reassembler state.
    pub fn reset(&mut self) {
        self.receiving_image = false;
        self.buffer.clear();
        self.expected_bytes = 0;
        self.filename.clear();
    }

    /// Check if an image transfer is in progress.
    pub fn is_receiving_image(&self) -> bool {
        self.receiving_image
    }

    /// Get accumulated base64 length.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper function to split base64 text into fixed-width protocol lines.
pub fn chunk_lines(encoded: &str, chunk_chars: usize) -> Vec<String> {
    if encoded.is_empty() || chunk_chars == 0 {
        return vec![];
    }

    encoded
        .as_bytes()
        .chunks(chunk_chars)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
