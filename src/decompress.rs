//! Decompressor for stored asset payloads.
//!
//! Records carry a base64 string wrapping exactly one gzip stream. Both
//! entry points share [`to_binary`]; [`to_text`] only adds UTF-8 decoding.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;

use crate::error::ProxyError;

/// Decode a base64 gzip envelope into raw bytes.
///
/// # Errors
///
/// Returns [`ProxyError::Decode`] for invalid base64, an empty payload, or
/// anything that is not a complete gzip stream.
pub fn to_binary(payload: &str) -> Result<Vec<u8>, ProxyError> {
    let compressed = BASE64.decode(payload.trim())?;
    if compressed.is_empty() {
        return Err(ProxyError::Decode("empty payload".to_string()));
    }

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = Vec::with_capacity(compressed.len() * 4);
    decoder.read_to_end(&mut out).map_err(|e| {
        tracing::error!("Failed to decompress payload: {e}");
        ProxyError::Decode(format!("malformed gzip envelope: {e}"))
    })?;
    Ok(out)
}

/// Decode a base64 gzip envelope into UTF-8 text.
///
/// # Errors
///
/// Same as [`to_binary`], plus [`ProxyError::Decode`] when the inflated
/// bytes are not UTF-8.
pub fn to_text(payload: &str) -> Result<String, ProxyError> {
    let bytes = to_binary(payload)?;
    String::from_utf8(bytes).map_err(|e| ProxyError::Decode(format!("payload is not UTF-8: {e}")))
}

#[cfg(test)]
pub(crate) fn compress(bytes: &[u8]) -> String {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    BASE64.encode(encoder.finish().unwrap())
}
