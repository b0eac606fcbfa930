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

//! Outbound image-send procedure: file in, protocol lines out.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use super::protocol::{begin_line, error_line, TransferError, IMG_END, PNG_MAGIC};
use super::reassembler::chunk_lines;

/// Build the line sequence for sending `data` as `filename`.
///
/// Payloads of at least 8 bytes must carry the PNG signature.
pub fn encode_image(
    filename: &str,
    data: &[u8],
    chunk_chars: usize,
) -> Result<Vec<String>, TransferError> {
    if data.len() >= PNG_MAGIC.len() && data[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(TransferError::NotPng);
    }

    // The begin line is space separated
    let wire_name: String = filename
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    let encoded = STANDARD.encode(data);
    let mut lines = Vec::with_capacity(encoded.len() / chunk_chars.max(1) + 3);
    lines.push(begin_line(&wire_name, data.len()));
    lines.extend(chunk_lines(&encoded, chunk_chars));
    lines.push(IMG_END.to_string());
    Ok(lines)
}

/// Lines to send in answer to an image request.
///
/// Every failure is reported in-band as a single `IMG_ERROR` line.
pub fn image_lines(selected: Option<&Path>, chunk_chars: usize) -> Vec<String> {
    let Some(path) = selected else {
        warn!("Image requested but no file is selected");
        return vec![error_line(&TransferError::NoFileSelected)];
    };

    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return vec![error_line(&TransferError::ReadFailed)];
        }
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.png".to_string());

    match encode_image(&filename, &data, chunk_chars) {
        Ok(lines) => {
            info!(
                "Sending {} ({} bytes) as {} lines",
                filename,
                data.len(),
                lines.len()
            );
            lines
        }
        Err(e) => {
            warn!("Refusing to send {}: {}", filename, e);
            vec![error_line(&e)]
        }
    }
}
