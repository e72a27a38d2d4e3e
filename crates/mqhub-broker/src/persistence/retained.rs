//! Serializable retained message record.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mqhub_core::{Publish, QoS};
use serde::{Deserialize, Serialize};

/// Retained message as written to a repository.
///
/// The topic is the storage key and is not repeated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetainedData {
    /// QoS level (0, 1, or 2).
    pub qos: u8,
    /// Message payload bytes. Never empty: an empty retained payload deletes.
    pub payload: Vec<u8>,
    /// Unix timestamp when the message was stored.
    pub stored_at: u64,
}

impl RetainedData {
    pub fn new(qos: u8, payload: Vec<u8>) -> Self {
        Self {
            qos,
            payload,
            stored_at: current_unix_timestamp(),
        }
    }

    /// Capture a retained PUBLISH.
    pub fn from_publish(publish: &Publish) -> Self {
        Self::new(publish.qos as u8, publish.payload.to_vec())
    }

    /// Rebuild the PUBLISH for `topic`, flagged as retained.
    ///
    /// An out-of-range stored QoS degrades to at-most-once.
    pub fn to_publish(&self, topic: &str) -> Publish {
        let qos = QoS::try_from(self.qos).unwrap_or(QoS::AtMostOnce);
        Publish::new(topic, Bytes::from(self.payload.clone()), qos, true)
    }
}

/// Current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
