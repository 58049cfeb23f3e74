//! # Frame Codec
//!
//! `Message` <-> one newline-terminated frame.
//!
//! Compressed frames wrap the LZ4 block (size-prefixed) in a JSON envelope so
//! every frame stays a single line of UTF-8.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::Message;
use crate::error::NetResult;

/// Envelope key marking a compressed frame.
pub const COMPRESSED_KEY: &str = "$c";

/// Envelope key holding the base64 payload.
pub const DATA_KEY: &str = "d";

/// Upper bound on a decompressed payload.
///
/// The size prefix is peer-controlled; anything claiming more is dropped
/// before allocation.
pub const MAX_DECOMPRESSED_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "$c")]
    compressed: bool,
    #[serde(rename = "d")]
    data: String,
}

/// Encodes a message into a newline-terminated frame.
///
/// # Errors
///
/// Returns `NetError::Serialize` if the message cannot be rendered as JSON.
pub fn encode(msg: &Message, compress: bool) -> NetResult<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;

    let mut frame = if compress {
        let packed = lz4_flex::compress_prepend_size(&payload);
        let envelope = Envelope {
            compressed: true,
            data: BASE64.encode(packed),
        };
        serde_json::to_vec(&envelope)?
    } else {
        payload
    };
    frame.push(b'\n');

    trace!(kind = msg.kind(), bytes = frame.len(), compress, "encoded frame");
    Ok(frame)
}

/// Decodes one frame (delimiter already stripped).
///
/// Returns `None` for anything that is not a well-formed message: invalid
/// JSON, a broken envelope, or an unknown `type`.
#[must_use]
pub fn decode(line: &[u8]) -> Option<Message> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let value: Value = serde_json::from_slice(line).ok()?;

    if value.get(COMPRESSED_KEY).and_then(Value::as_bool) == Some(true) {
        let data = value.get(DATA_KEY)?.as_str()?;
        let raw = inflate(data)?;
        return serde_json::from_slice(&raw).ok();
    }

    serde_json::from_value(value).ok()
}

fn inflate(data: &str) -> Option<Vec<u8>> {
    let packed = BASE64.decode(data).ok()?;
    let prefix: [u8; 4] = packed.get(..4)?.try_into().ok()?;
    if u32::from_le_bytes(prefix) as usize > MAX_DECOMPRESSED_BYTES {
        return None;
    }
    lz4_flex::decompress_size_prepended(&packed).ok()
}
