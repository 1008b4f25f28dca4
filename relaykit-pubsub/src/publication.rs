//! The message envelope exchanged through the pub/sub layer

use std::collections::HashMap;

use bytes::Bytes;
use redis::streams::StreamId;

use crate::error::{Error, Result};

/// Stream entry field holding the raw payload
pub(crate) const PAYLOAD_FIELD: &str = "payload";
/// Prefix of the stream entry fields carrying metadata
pub(crate) const METADATA_PREFIX: &str = "meta:";

/// A topic-addressed event: destination topic, opaque payload and optional
/// metadata.
///
/// The topic is not validated on construction. An empty topic is rejected
/// when the publication is handed to `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    topic: String,
    payload: Bytes,
    metadata: HashMap<String, String>,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry, replacing any previous value for `key`
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    #[must_use]
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Boundary check applied at publish time
    pub(crate) fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(Error::InvalidPublication(
                "publication topic must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Field/value pairs written with XADD
    pub(crate) fn to_stream_fields(&self) -> Vec<(String, Vec<u8>)> {
        let mut fields = Vec::with_capacity(self.metadata.len() + 1);
        fields.push((PAYLOAD_FIELD.to_string(), self.payload.to_vec()));
        for (key, value) in &self.metadata {
            fields.push((format!("{METADATA_PREFIX}{key}"), value.clone().into_bytes()));
        }
        fields
    }

    /// Rebuild a publication from a stream entry read off `topic`
    pub(crate) fn from_stream_entry(topic: &str, entry: &StreamId) -> Result<Self> {
        let payload = entry
            .map
            .get(PAYLOAD_FIELD)
            .and_then(|v| redis::from_redis_value_ref::<Vec<u8>>(v).ok())
            .ok_or_else(|| {
                Error::BrokerRead(format!(
                    "stream entry {} on '{topic}' has no payload field",
                    entry.id
                ))
            })?;

        let metadata = entry
            .map
            .iter()
            .filter_map(|(field, value)| {
                let key = field.strip_prefix(METADATA_PREFIX)?;
                let value = redis::from_redis_value_ref::<String>(value).ok()?;
                Some((key.to_string(), value))
            })
            .collect();

        Ok(Self {
            topic: topic.to_string(),
            payload: Bytes::from(payload),
            metadata,
        })
    }
}
