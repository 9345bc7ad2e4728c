use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::record::{decode_value, encode_value, ProducerRecord};

/// Snapshot of an event the subscription gave up on, written to the
/// dead-letter topic for offline inspection. Byte fields are base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "base64_opt_bytes")]
    pub state: Option<Vec<u8>>,
    #[serde(with = "base64_opt_bytes")]
    pub event: Option<Vec<u8>>,
}

impl DeadLetterRecord {
    pub fn new(key: Vec<u8>, state: Option<Vec<u8>>, event: Option<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            key,
            state,
            event,
        }
    }

    /// Keyed by a fresh random id so dead-letters for the same event key never
    /// replace each other on a compacted topic.
    pub fn to_producer_record(&self, topic: &str) -> Result<ProducerRecord, CodecError> {
        Ok(ProducerRecord::new(
            topic,
            Uuid::new_v4().hyphenated().to_string().into_bytes(),
            Some(encode_value(self)?),
        ))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, CodecError> {
        decode_value(payload)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_base64_in_json() {
        let record = DeadLetterRecord::new(b"k".to_vec(), None, Some(b"\"Bad\"".to_vec()));
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();

        assert_eq!(json["key"], "aw==");
        assert_eq!(json["state"], serde_json::Value::Null);
        assert_eq!(json["event"], "IkJhZCI=");
    }

    #[test]
    fn producer_record_uses_a_fresh_key_each_time() {
        let record = DeadLetterRecord::new(b"k".to_vec(), Some(b"70".to_vec()), None);
        let first = record.to_producer_record("ledger-dlq").unwrap();
        let second = record.to_producer_record("ledger-dlq").unwrap();

        assert_eq!(first.topic, "ledger-dlq");
        assert_ne!(first.key, second.key);
        assert_ne!(first.key, b"k".to_vec());

        let decoded = DeadLetterRecord::from_payload(first.payload.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
