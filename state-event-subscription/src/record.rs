use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CodecError;

/// A key type usable on the event and state topics.
///
/// Keys travel as raw bytes; values are JSON.
pub trait RecordKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn to_key_bytes(&self) -> Vec<u8>;

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl RecordKey for String {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl RecordKey for Uuid {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.hyphenated().to_string().into_bytes()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = String::from_utf8(bytes.to_vec())?;
        Uuid::parse_str(&text).map_err(|e| CodecError::InvalidKey(e.to_string()))
    }
}

impl RecordKey for i64 {
    fn to_key_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn from_key_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = String::from_utf8(bytes.to_vec())?;
        text.parse()
            .map_err(|e: std::num::ParseIntError| CodecError::InvalidKey(e.to_string()))
    }
}

pub fn encode_value<V: Serialize + ?Sized>(value: &V) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// An immutable (topic, key, value) triple. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<K, V> {
    pub topic: String,
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> Record<K, V> {
    pub fn new(topic: impl Into<String>, key: K, value: Option<V>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
        }
    }
}

/// A record as handed back by a poll, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// A decoded record from the event topic with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent<K, E> {
    pub record: Record<K, E>,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl<K: RecordKey, E: DeserializeOwned> InboundEvent<K, E> {
    /// Decodes key and value. A missing payload decodes to a `None` value.
    pub fn decode(raw: &PolledRecord) -> Result<Self, CodecError> {
        let key = raw.key.as_deref().ok_or(CodecError::MissingKey)?;
        let key = K::from_key_bytes(key)?;
        let value = raw.payload.as_deref().map(decode_value).transpose()?;
        Ok(Self {
            record: Record::new(raw.topic.clone(), key, value),
            partition: raw.partition,
            offset: raw.offset,
            timestamp: raw.timestamp,
        })
    }
}

/// A record to be written inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; `None` lets the producer partition by key.
    pub partition: Option<i32>,
    pub key: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: Vec<u8>, payload: Option<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key,
            payload,
        }
    }

    pub fn json<K: RecordKey, V: Serialize + ?Sized>(
        topic: impl Into<String>,
        key: &K,
        value: &V,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(topic, key.to_key_bytes(), Some(encode_value(value)?)))
    }

    pub fn tombstone<K: RecordKey>(topic: impl Into<String>, key: &K) -> Self {
        Self::new(topic, key.to_key_bytes(), None)
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Next offset to consume for one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}
