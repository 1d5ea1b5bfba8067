//! Key codec for device-collaboration stores.
//!
//! A device-collaboration store multiplexes every device's logical
//! keyspace onto one physical store. On write the logical key is
//! namespaced with the writing device's id; the device id length rides
//! along as a fixed-width suffix so enumeration can split any physical
//! key back into `(origin device, logical key)` without knowing the
//! writer in advance:
//!
//! ```text
//! physical = device_id ++ logical_key ++ u32_le(device_id.len())
//! ```
//!
//! Encode and decode are pure byte transformations; the local device id
//! is supplied by the caller, which obtains it once from its device
//! provider.

use crate::error::{StoreError, StoreResult};

/// Width of the trailing device-id-length suffix.
pub const DEVICE_ID_LENGTH_SUFFIX: usize = 4;

/// Namespaces `logical_key` under `device_id`.
#[must_use]
pub fn encode(device_id: &str, logical_key: &[u8]) -> Vec<u8> {
    let id_bytes = device_id.as_bytes();
    let mut physical = Vec::with_capacity(
        id_bytes.len() + logical_key.len() + DEVICE_ID_LENGTH_SUFFIX,
    );
    physical.extend_from_slice(id_bytes);
    physical.extend_from_slice(logical_key);
    #[allow(clippy::cast_possible_truncation)]
    physical.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    physical
}

/// Splits a physical key into `(origin device id, logical key)`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidArgument`] when the key is too short for
/// its own length suffix or the device id is not valid UTF-8.
pub fn decode(physical_key: &[u8]) -> StoreResult<(String, Vec<u8>)> {
    if physical_key.len() < DEVICE_ID_LENGTH_SUFFIX {
        return Err(StoreError::InvalidArgument(
            "physical key shorter than its length suffix".to_string(),
        ));
    }
    let (body, suffix) = physical_key.split_at(physical_key.len() - DEVICE_ID_LENGTH_SUFFIX);
    let mut length_bytes = [0u8; DEVICE_ID_LENGTH_SUFFIX];
    length_bytes.copy_from_slice(suffix);
    let id_length = u32::from_le_bytes(length_bytes) as usize;
    if id_length > body.len() {
        return Err(StoreError::InvalidArgument(
            "device id length exceeds physical key".to_string(),
        ));
    }
    let (id_bytes, logical) = body.split_at(id_length);
    let device_id = std::str::from_utf8(id_bytes)
        .map_err(|_| StoreError::InvalidArgument("device id is not utf-8".to_string()))?;
    Ok((device_id.to_string(), logical.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("d", b"k"; "short")]
    #[test_case("device-with-long-identifier-0123456789", b"some/logical/key"; "long id")]
    #[test_case("dev", b""; "empty logical key")]
    fn test_round_trip(device_id: &str, logical: &[u8]) {
        let physical = encode(device_id, logical);
        let (decoded_id, decoded_key) = decode(&physical).expect("decode");
        assert_eq!(decoded_id, device_id);
        assert_eq!(decoded_key, logical);
    }

    #[test]
    fn test_decode_rejects_truncated_keys() {
        assert!(decode(b"ab").is_err());
        // Length suffix claims more bytes than the key holds.
        let mut bogus = encode("device", b"key");
        let len = bogus.len();
        bogus[len - DEVICE_ID_LENGTH_SUFFIX..].copy_from_slice(&1000u32.to_le_bytes());
        assert!(decode(&bogus).is_err());
    }

}
