//! Pluggable payload codec.
//!
//! Payloads cross the codec as `serde_json::Value`, which lets a single
//! object-safe trait serve arbitrary payload types. Forward/backward
//! compatibility of a payload's shape is the task author's concern; the
//! scheduler performs no schema management.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::SchedulerError;

/// Encodes payload values to bytes and back.
pub trait Serializer: Send + Sync {
    /// Encode a payload value.
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SchedulerError>;
    /// Decode stored bytes back into a payload value.
    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, SchedulerError>;
}

/// JSON codec; the default for all tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SchedulerError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<serde_json::Value, SchedulerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a typed payload through a serializer.
pub fn serialize_payload<T: Serialize>(
    serializer: &dyn Serializer,
    payload: &T,
) -> Result<Vec<u8>, SchedulerError> {
    serializer.serialize(&serde_json::to_value(payload)?)
}

/// Decode stored bytes into a typed payload.
pub fn deserialize_payload<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T, SchedulerError> {
    Ok(serde_json::from_value(serializer.deserialize(bytes)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Payload {
        primary_key: i64,
        label: String,
    }

    #[test]
    fn typed_payload_round_trips() {
        let serializer = JsonSerializer;
        let payload = Payload {
            primary_key: 1001,
            label: "import".into(),
        };
        let bytes = serialize_payload(&serializer, &payload).unwrap();
        let decoded: Payload = deserialize_payload(&serializer, &bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let serializer = JsonSerializer;
        assert!(serializer.deserialize(b"\x00\x01not-json").is_err());
    }
}
