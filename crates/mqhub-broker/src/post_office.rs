//! Publish/subscribe routing.
//!
//! The post office ties the subscription directory, the retained store and
//! the session registry together. Subscription changes are applied to the
//! directory and the owning session under that session's mutex, so a
//! concurrent publisher sees both or neither.

use std::cmp::min;
use std::sync::Arc;

use mqhub_core::topic::{validate_topic, validate_topic_filter, validate_topic_name};
use mqhub_core::{ProtocolError, Publish, QoS, Will};
use thiserror::Error;

use crate::auth::{Authorizer, ClientInfo};
use crate::config::{MqttConfig, SessionConfig};
use crate::connection::ConnectionId;
use crate::retained::RetainedStore;
use crate::session::{Session, SessionRegistry};
use crate::subscription::SubscriptionDirectory;

/// Why a subscription was not granted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("invalid topic filter: {0}")]
    InvalidFilter(#[from] ProtocolError),
    #[error("not authorized to subscribe to '{0}'")]
    NotAuthorized(String),
    #[error("no session for client '{0}'")]
    NoSession(String),
}

/// Why a client publish was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("invalid topic name: {0}")]
    InvalidTopic(#[from] ProtocolError),
    #[error("not authorized to publish to '{0}'")]
    NotAuthorized(String),
}

/// Result of a single SUBSCRIBE filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Subscribed. `retained` holds the matching retained messages, ready
    /// to deliver once the SUBACK has gone out.
    Granted { qos: QoS, retained: Vec<Publish> },
    Denied(SubscribeError),
}

/// What happened to one routed copy of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Delivered,
    Queued,
    Dropped,
}

pub struct PostOffice {
    directory: Arc<SubscriptionDirectory>,
    retained: Arc<RetainedStore>,
    registry: Arc<SessionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    max_qos: QoS,
    max_topic_length: usize,
    max_topic_levels: usize,
    max_queued_messages: usize,
}

impl PostOffice {
    pub fn new(
        directory: Arc<SubscriptionDirectory>,
        retained: Arc<RetainedStore>,
        registry: Arc<SessionRegistry>,
        authorizer: Arc<dyn Authorizer>,
        mqtt: &MqttConfig,
        session: &SessionConfig,
    ) -> Self {
        Self {
            directory,
            retained,
            registry,
            authorizer,
            max_qos: mqtt.max_qos(),
            max_topic_length: mqtt.max_topic_length,
            max_topic_levels: mqtt.max_topic_levels,
            max_queued_messages: session.max_queued_messages,
        }
    }

    /// Subscribe `client` to `filter` at (at most) `qos`.
    ///
    /// The session is only changed while `connection` is still bound to it;
    /// a connection that lost a takeover gets [`SubscribeError::NoSession`].
    pub fn subscribe(
        &self,
        client: &ClientInfo,
        connection: ConnectionId,
        filter: &str,
        qos: QoS,
    ) -> SubscribeOutcome {
        if let Err(e) = validate_topic_filter(filter)
            .and_then(|()| validate_topic(filter.as_bytes(), self.max_topic_length, self.max_topic_levels))
        {
            log::debug!("Rejecting filter '{}' from {}: {}", filter, client.client_id, e);
            return SubscribeOutcome::Denied(e.into());
        }

        if !self.authorizer.can_read(client, filter) {
            return SubscribeOutcome::Denied(SubscribeError::NotAuthorized(filter.to_string()));
        }

        let granted = min(qos, self.max_qos);
        let attached = self.registry.with_session(&client.client_id, |session| {
            if !session.is_bound_to(connection) {
                return false;
            }
            self.directory.add(filter, &session.client_id, granted);
            session.subscriptions.insert(filter.to_string(), granted);
            self.registry.store(session);
            true
        });
        if attached != Some(true) {
            return SubscribeOutcome::Denied(SubscribeError::NoSession(client.client_id.clone()));
        }

        log::debug!(
            "{} subscribed to '{}' at {:?}",
            client.client_id,
            filter,
            granted
        );

        let retained = self
            .retained
            .matching(filter)
            .into_iter()
            .map(|mut publish| {
                publish.qos = min(publish.qos, granted);
                publish
            })
            .collect();
        SubscribeOutcome::Granted {
            qos: granted,
            retained,
        }
    }

    /// Remove `client_id`'s subscription to `filter` if `connection` still
    /// owns the session. Returns whether one was removed.
    pub fn unsubscribe(&self, client_id: &str, connection: ConnectionId, filter: &str) -> bool {
        self.registry
            .with_session(client_id, |session| {
                if !session.is_bound_to(connection) {
                    return false;
                }
                if session.subscriptions.remove(filter).is_none() {
                    return false;
                }
                self.directory.remove(filter, client_id);
                self.registry.store(session);
                true
            })
            .unwrap_or(false)
    }

    /// Route a publish to every matching session.
    ///
    /// A retained publish updates the retained store first (an empty payload
    /// clears it). Each subscriber gets one copy at the lower of the publish
    /// QoS and its granted QoS. Returns the number of sessions that accepted
    /// a copy, either live or queued.
    pub fn publish(&self, publish: Publish) -> usize {
        if publish.retain {
            self.retained.apply(&publish);
        }

        let subscribers = self.directory.matches(&publish.topic);
        let mut accepted = 0;
        for subscriber in subscribers {
            let mut copy = publish.clone();
            copy.qos = min(publish.qos, subscriber.qos);
            copy.retain = false;
            copy.dup = false;
            copy.packet_id = None;

            let route = self
                .registry
                .with_session(&subscriber.client_id, |session| {
                    self.route(session, copy)
                })
                .unwrap_or(Route::Dropped);
            if route != Route::Dropped {
                accepted += 1;
            }
        }

        log::trace!("Routed '{}' to {} sessions", publish.topic, accepted);
        accepted
    }

    /// Deliver to a live connection, or queue for an offline persistent
    /// session. Caller holds the session mutex.
    fn route(&self, session: &mut Session, publish: Publish) -> Route {
        if let Some(connection) = &session.connection {
            match connection.deliver(publish.clone()) {
                Ok(()) => return Route::Delivered,
                Err(e) => {
                    log::debug!("Delivery to {} failed: {}", session.client_id, e);
                }
            }
        }

        // Offline QoS 0 is not kept, matching at-most-once.
        if session.clean || publish.qos == QoS::AtMostOnce {
            return Route::Dropped;
        }

        session.queue.push_back(publish);
        if session.queue.len() > self.max_queued_messages {
            session.queue.pop_front();
            log::warn!(
                "Offline queue of {} full ({}); dropped oldest message",
                session.client_id,
                self.max_queued_messages
            );
        }
        Route::Queued
    }

    /// Check a concrete topic name against syntax and the configured limits.
    pub fn check_topic_name(&self, topic: &str) -> Result<(), ProtocolError> {
        validate_topic_name(topic)?;
        validate_topic(topic.as_bytes(), self.max_topic_length, self.max_topic_levels)
    }

    /// Publish on behalf of a client: topic validation, then `can_write`.
    pub fn publish_from(&self, client: &ClientInfo, publish: Publish) -> Result<usize, PublishError> {
        self.check_topic_name(&publish.topic)?;

        if !self.authorizer.can_write(client, &publish.topic) {
            log::debug!(
                "{} not authorized to publish to '{}'",
                client.client_id,
                publish.topic
            );
            return Err(PublishError::NotAuthorized(publish.topic));
        }
        Ok(self.publish(publish))
    }

    /// Publish a client's will message. A will with an invalid topic is
    /// dropped.
    pub fn fire_will(&self, will: Will) -> usize {
        if let Err(e) = self.check_topic_name(&will.topic) {
            log::warn!("Dropping will for '{}': {}", will.topic, e);
            return 0;
        }
        log::debug!("Publishing will to '{}'", will.topic);
        self.publish(will.to_publish())
    }
}
