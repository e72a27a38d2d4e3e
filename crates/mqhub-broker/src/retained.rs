//! Retained message store.
//!
//! At most one message per topic name. The in-memory map is authoritative
//! while the broker runs; the optional repository mirrors every change and
//! seeds the map on startup. Repository failures are logged, never surfaced
//! to publishers.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use mqhub_core::Publish;
use parking_lot::RwLock;

use crate::persistence::{PersistenceError, RetainedData, RetainedRepository};
use crate::subscription::topic_matches_filter;

/// A retained message with the time it was stored.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub publish: Publish,
    pub stored_at: Instant,
}

pub struct RetainedStore {
    messages: RwLock<AHashMap<String, RetainedMessage>>,
    repository: Option<Arc<dyn RetainedRepository>>,
}

impl RetainedStore {
    /// An in-memory store with nothing behind it.
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(AHashMap::new()),
            repository: None,
        }
    }

    /// A store mirrored to `repository`, seeded with what it already holds.
    pub fn with_repository(
        repository: Arc<dyn RetainedRepository>,
    ) -> Result<Self, PersistenceError> {
        let stored = repository.load_all()?;
        let now = Instant::now();
        let messages: AHashMap<_, _> = stored
            .into_iter()
            .filter(|(_, data)| !data.payload.is_empty())
            .map(|(topic, data)| {
                let publish = data.to_publish(&topic);
                (topic, RetainedMessage { publish, stored_at: now })
            })
            .collect();

        log::info!("Loaded {} retained messages", messages.len());
        Ok(Self {
            messages: RwLock::new(messages),
            repository: Some(repository),
        })
    }

    /// Apply a retained PUBLISH: store it, or clear the topic when the
    /// payload is empty.
    pub fn apply(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            self.clear(&publish.topic);
        } else {
            self.set(publish);
        }
    }

    /// Store `publish` as the retained message for its topic.
    pub fn set(&self, publish: &Publish) {
        let mut stored = publish.clone();
        stored.retain = true;
        stored.dup = false;
        stored.packet_id = None;

        self.messages.write().insert(
            publish.topic.clone(),
            RetainedMessage {
                publish: stored,
                stored_at: Instant::now(),
            },
        );

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.put(&publish.topic, &RetainedData::from_publish(publish)) {
                log::warn!(
                    "Failed to persist retained message for '{}': {}",
                    publish.topic,
                    e
                );
            }
        }
    }

    /// Remove the retained message for `topic`, if any.
    pub fn clear(&self, topic: &str) -> bool {
        let removed = self.messages.write().remove(topic).is_some();

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.delete(topic) {
                log::warn!(
                    "Failed to remove persisted retained message for '{}': {}",
                    topic,
                    e
                );
            }
        }
        removed
    }

    pub fn get(&self, topic: &str) -> Option<Publish> {
        self.messages.read().get(topic).map(|m| m.publish.clone())
    }

    /// Retained messages whose topic matches `filter`, ordered by topic.
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        let mut hits: Vec<Publish> = self
            .messages
            .read()
            .iter()
            .filter(|(topic, _)| topic_matches_filter(topic, filter))
            .map(|(_, message)| message.publish.clone())
            .collect();
        hits.sort_by(|a, b| a.topic.cmp(&b.topic));
        hits
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new()
    }
}
