//! Hexadecimal text codec used for raw block writes.

use ::hex::FromHexError;

use crate::error::{PlcError, Result};

/// Encode bytes as lowercase hex, two characters per byte, high nibble first.
pub fn encode(bytes: &[u8]) -> String {
    ::hex::encode(bytes)
}

/// Decode hex text into bytes.
///
/// Accepts upper- and lowercase digits. Fails on odd length or on any
/// character outside `[0-9a-fA-F]`.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    ::hex::decode(text).map_err(|e| match e {
        FromHexError::OddLength => {
            PlcError::format(format!("hex string has odd length {}", text.len()))
        }
        FromHexError::InvalidHexCharacter { c, index } => PlcError::format(format!(
            "invalid hex character {:?} at position {}",
            c, index
        )),
        FromHexError::InvalidStringLength => PlcError::format("invalid hex string length"),
    })
}
