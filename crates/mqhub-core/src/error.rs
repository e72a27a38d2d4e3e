//! Protocol error types.

use thiserror::Error;

/// MQTT protocol errors detected while validating decoded packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid protocol name: expected 'MQTT' or 'MQIsdp', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Topic too long: {len} bytes (max {max})")]
    TopicTooLong { len: usize, max: usize },

    #[error("Topic too deep: {levels} levels (max {max})")]
    TopicTooDeep { levels: usize, max: usize },

    #[error("Invalid topic name: {0:?}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
