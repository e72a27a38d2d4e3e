//! MQTT 3.1 / 3.1.1 packet types as seen by the broker after decoding.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

/// Protocol level of MQTT 3.1 (protocol name `MQIsdp`).
pub const PROTOCOL_LEVEL_V31: u8 = 3;

/// Protocol level of MQTT 3.1.1 (protocol name `MQTT`).
pub const PROTOCOL_LEVEL_V311: u8 = 4;

/// SUBACK return code for a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(value)),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnackCode::Accepted
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    /// A CONNECT for MQTT 3.1.1 with no credentials, no will and a 60s keep alive.
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_version: PROTOCOL_LEVEL_V311,
            clean_session,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// Whether the client presented neither a username nor a password.
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }

    /// Check the protocol name and level.
    ///
    /// Only MQTT 3.1 (`MQIsdp`, level 3) and MQTT 3.1.1 (`MQTT`, level 4) are
    /// accepted. An empty protocol name is tolerated so that synthetic CONNECTs
    /// built by embedders do not have to fill it in.
    pub fn validate_protocol(&self) -> Result<()> {
        match self.protocol_version {
            PROTOCOL_LEVEL_V31 | PROTOCOL_LEVEL_V311 => {}
            other => return Err(ProtocolError::UnsupportedProtocolVersion(other)),
        }
        match self.protocol_name.as_str() {
            "" | "MQTT" | "MQIsdp" => Ok(()),
            other => Err(ProtocolError::InvalidProtocolName(other.to_string())),
        }
    }
}

/// Will message configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    /// Convert the will into the PUBLISH the broker emits on the client's behalf.
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: Bytes::from(self.message.clone()),
        }
    }
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    /// Topic filters with their requested QoS.
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`].
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// MQTT Packets.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    /// Short packet name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::Connack(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::Puback { .. } => "PUBACK",
            Packet::Pubrec { .. } => "PUBREC",
            Packet::Pubrel { .. } => "PUBREL",
            Packet::Pubcomp { .. } => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::Suback(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::Unsuback { .. } => "UNSUBACK",
            Packet::Pingreq => "PINGREQ",
            Packet::Pingresp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
