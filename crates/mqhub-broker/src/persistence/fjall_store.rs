//! fjall-backed repositories.
//!
//! One database with two keyspaces: `retained` (topic -> [`RetainedData`])
//! and `sessions` (client id -> [`StoredSession`]). Values are bincode.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{PersistenceError, RetainedData, RetainedRepository, SessionRepository, StoredSession};

/// Disk store implementing both repository traits.
pub struct FjallStore {
    db: Database,
    retained: Keyspace,
    sessions: Keyspace,
}

impl FjallStore {
    /// Open or create a store in `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let db = Database::builder(path)
            .open()
            .map_err(|e| PersistenceError::Open(e.to_string()))?;

        let retained = db
            .keyspace("retained", KeyspaceCreateOptions::default)
            .map_err(|e| PersistenceError::Keyspace(e.to_string()))?;
        let sessions = db
            .keyspace("sessions", KeyspaceCreateOptions::default)
            .map_err(|e| PersistenceError::Keyspace(e.to_string()))?;

        log::info!("Persistence store opened");
        Ok(Self {
            db,
            retained,
            sessions,
        })
    }

    /// Flush all pending writes to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db
            .persist(PersistMode::SyncAll)
            .map_err(|e| PersistenceError::Sync(e.to_string()))
    }

    fn read<T: DeserializeOwned>(keyspace: &Keyspace, key: &str) -> Result<Option<T>, PersistenceError> {
        let Some(value) = keyspace
            .get(key)
            .map_err(|e| PersistenceError::Read(e.to_string()))?
        else {
            return Ok(None);
        };
        bincode::deserialize(&value)
            .map(Some)
            .map_err(|e| PersistenceError::Deserialize(e.to_string()))
    }

    fn write<T: Serialize>(keyspace: &Keyspace, key: &str, value: &T) -> Result<(), PersistenceError> {
        let bytes =
            bincode::serialize(value).map_err(|e| PersistenceError::Serialize(e.to_string()))?;
        keyspace
            .insert(key, bytes)
            .map_err(|e| PersistenceError::Write(e.to_string()))
    }

    fn remove(keyspace: &Keyspace, key: &str) -> Result<(), PersistenceError> {
        keyspace
            .remove(key)
            .map_err(|e| PersistenceError::Write(e.to_string()))
    }
}

impl RetainedRepository for FjallStore {
    fn get(&self, topic: &str) -> Result<Option<RetainedData>, PersistenceError> {
        Self::read(&self.retained, topic)
    }

    fn put(&self, topic: &str, data: &RetainedData) -> Result<(), PersistenceError> {
        Self::write(&self.retained, topic, data)
    }

    fn delete(&self, topic: &str) -> Result<(), PersistenceError> {
        Self::remove(&self.retained, topic)
    }

    fn load_all(&self) -> Result<Vec<(String, RetainedData)>, PersistenceError> {
        // Collect keys first (Guard consumes self on key()/value())
        let keys: Vec<_> = self
            .retained
            .iter()
            .filter_map(|kv| kv.key().ok())
            .collect();

        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            let topic = String::from_utf8_lossy(&key).into_owned();
            match Self::read::<RetainedData>(&self.retained, &topic) {
                Ok(Some(data)) => messages.push((topic, data)),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping retained message for {}: {}", topic, e),
            }
        }

        log::info!("Loaded {} retained messages from disk", messages.len());
        Ok(messages)
    }
}

impl SessionRepository for FjallStore {
    fn load(&self, client_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        Self::read(&self.sessions, client_id)
    }

    fn save(&self, session: &StoredSession) -> Result<(), PersistenceError> {
        Self::write(&self.sessions, &session.client_id, session)
    }

    fn delete(&self, client_id: &str) -> Result<(), PersistenceError> {
        Self::remove(&self.sessions, client_id)
    }
}
