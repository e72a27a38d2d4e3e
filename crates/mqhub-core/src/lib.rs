//! mqhub-core - MQTT packet data model shared by the mqhub crates.
//!
//! The types here describe packets after decoding; the wire codec lives
//! outside this workspace. Validation helpers cover the protocol-level rules
//! the broker enforces before touching any shared state.

pub mod error;
pub mod packet;
pub mod topic;

pub use error::{ProtocolError, Result};
pub use packet::*;
