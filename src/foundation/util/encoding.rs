use crate::foundation::{BridgeError, Result};

fn strip_0x(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}

pub fn parse_hex_32bytes(value: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(strip_0x(value))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        BridgeError::SerializationError {
            format: "hex".to_string(),
            details: format!("expected 32 bytes, got {}", raw.len()),
        }
    })
}

pub fn parse_hex_20bytes(value: &str) -> Result<[u8; 20]> {
    let raw = hex::decode(strip_0x(value))?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        BridgeError::SerializationError {
            format: "hex".to_string(),
            details: format!("expected 20 bytes, got {}", raw.len()),
        }
    })
}

/// Interprets the bytes as a big-endian unsigned integer and reduces it
/// modulo `modulus`. Used where a hash seeds an index choice.
pub fn bytes_mod(bytes: &[u8], modulus: u64) -> u64 {
    debug_assert!(modulus > 0);
    let modulus = modulus as u128;
    let mut acc: u128 = 0;
    for byte in bytes {
        acc = (acc << 8 | *byte as u128) % modulus;
    }
    acc as u64
}
