//! mqhub-broker - MQTT 3.1/3.1.1 connection admission, session lifecycle and
//! subscription routing.
//!
//! The crate has no network code. An embedder decodes packets on its own I/O
//! threads, hands each new connection's [`Transport`] to [`Broker::accept`],
//! and feeds the resulting [`Gateway`] with [`Inbound`] events.

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod post_office;
pub mod retained;
pub mod session;
pub mod subscription;

pub use broker::Broker;
pub use config::Config;
pub use connection::{ChannelTransport, Connection, ConnectionId, ConnectionState, Inbound, Transport};
pub use error::{BrokerError, Result};
pub use gateway::{ConnAckResult, Gateway};
pub use post_office::{PostOffice, PublishError, SubscribeError, SubscribeOutcome};
pub use retained::RetainedStore;
pub use session::{BindOutcome, SessionRegistry, SessionSnapshot};
pub use subscription::{Subscriber, SubscriptionDirectory};
