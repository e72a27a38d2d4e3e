//! Storage seams for retained messages and persistent sessions.
//!
//! The broker keeps its working state in memory; repositories are the
//! durable copy consulted on startup (retained messages) and when a
//! persistent session is resumed without an in-memory counterpart.
//!
//! ```text
//! RetainedStore ──put/delete──► RetainedRepository ──► memory | fjall
//! SessionRegistry ─load/save──► SessionRepository  ──► memory | fjall
//! ```
//!
//! With the `persistence` feature, [`FjallStore`] implements both traits on
//! one fjall database, one keyspace each.

#[cfg(feature = "persistence")]
mod fjall_store;
mod retained;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[cfg(feature = "persistence")]
pub use fjall_store::FjallStore;
pub use retained::{current_unix_timestamp, RetainedData};

/// Durable storage for retained messages, keyed by topic name.
pub trait RetainedRepository: Send + Sync + 'static {
    fn get(&self, topic: &str) -> Result<Option<RetainedData>, PersistenceError>;

    fn put(&self, topic: &str, data: &RetainedData) -> Result<(), PersistenceError>;

    fn delete(&self, topic: &str) -> Result<(), PersistenceError>;

    /// Everything currently stored. Called once on startup.
    fn load_all(&self) -> Result<Vec<(String, RetainedData)>, PersistenceError>;
}

/// Durable storage for persistent (non-clean) sessions.
pub trait SessionRepository: Send + Sync + 'static {
    fn load(&self, client_id: &str) -> Result<Option<StoredSession>, PersistenceError>;

    fn save(&self, session: &StoredSession) -> Result<(), PersistenceError>;

    fn delete(&self, client_id: &str) -> Result<(), PersistenceError>;
}

/// The durable part of a persistent session.
///
/// Wills and queued messages are not stored: a will belongs to one network
/// connection and the offline queue is best effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub client_id: String,
    /// `(filter, granted qos)` pairs in filter order.
    pub subscriptions: Vec<(String, u8)>,
}

/// In-memory retained repository.
#[derive(Debug, Default)]
pub struct MemoryRetainedRepository {
    entries: RwLock<AHashMap<String, RetainedData>>,
}

impl MemoryRetainedRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetainedRepository for MemoryRetainedRepository {
    fn get(&self, topic: &str) -> Result<Option<RetainedData>, PersistenceError> {
        Ok(self.entries.read().get(topic).cloned())
    }

    fn put(&self, topic: &str, data: &RetainedData) -> Result<(), PersistenceError> {
        self.entries.write().insert(topic.to_string(), data.clone());
        Ok(())
    }

    fn delete(&self, topic: &str) -> Result<(), PersistenceError> {
        self.entries.write().remove(topic);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(String, RetainedData)>, PersistenceError> {
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(topic, data)| (topic.clone(), data.clone()))
            .collect())
    }
}

/// In-memory session repository.
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<AHashMap<String, StoredSession>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionRepository for MemorySessionRepository {
    fn load(&self, client_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        Ok(self.sessions.read().get(client_id).cloned())
    }

    fn save(&self, session: &StoredSession) -> Result<(), PersistenceError> {
        self.sessions
            .write()
            .insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    fn delete(&self, client_id: &str) -> Result<(), PersistenceError> {
        self.sessions.write().remove(client_id);
        Ok(())
    }
}

/// Errors that can occur during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Failed to open the database
    Open(String),
    /// Failed to create or open a keyspace
    Keyspace(String),
    /// Failed to serialize data
    Serialize(String),
    /// Failed to deserialize data
    Deserialize(String),
    /// Failed to write to the database
    Write(String),
    /// Failed to read from the database
    Read(String),
    /// Failed to sync to disk
    Sync(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "failed to open persistence database: {}", e),
            Self::Keyspace(e) => write!(f, "failed to open keyspace: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Write(e) => write!(f, "write error: {}", e),
            Self::Read(e) => write!(f, "read error: {}", e),
            Self::Sync(e) => write!(f, "sync error: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}
