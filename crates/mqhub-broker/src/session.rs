//! Session registry: the authoritative client id → session map.
//!
//! Sessions live in a sharded map (`DashMap`) of `Arc<Mutex<Session>>`. The
//! session mutex is the per-client-id critical section; shard locks are only
//! held to look up, insert or conditionally remove an entry and never while
//! waiting on a session mutex. Binds for different client ids therefore never
//! contend, and binds for the same id serialize on that session's mutex.
//!
//! A session removed from the map is first marked `removed` under its mutex;
//! anyone who was waiting on it retries the lookup.
//!
//! Lock order: session mutex → subscription trie locks → connection outbound.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mqhub_core::{Publish, QoS, Will};
use parking_lot::Mutex;

use crate::auth::{Authorizer, ClientInfo};
use crate::connection::{Connection, ConnectionId};
use crate::error::Result;
use crate::persistence::{SessionRepository, StoredSession};
use crate::subscription::SubscriptionDirectory;

/// Per-client session state.
pub struct Session {
    pub(crate) client_id: Arc<str>,
    pub(crate) clean: bool,
    /// filter → granted QoS; mirrored in the subscription directory.
    pub(crate) subscriptions: BTreeMap<String, QoS>,
    pub(crate) will: Option<Will>,
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) client: ClientInfo,
    /// Messages published while a persistent session was offline.
    pub(crate) queue: VecDeque<Publish>,
    /// Whether a bind has ever completed (or the session was restored).
    existed: bool,
    /// Whether `subscriptions` have been added to the directory.
    attached: bool,
    /// Unlinked from the registry; holders must look it up again.
    removed: bool,
}

impl Session {
    fn new(client_id: &str, clean: bool, client: ClientInfo) -> Self {
        Self {
            client_id: Arc::from(client_id),
            clean,
            subscriptions: BTreeMap::new(),
            will: None,
            connection: None,
            client,
            queue: VecDeque::new(),
            existed: false,
            attached: false,
            removed: false,
        }
    }

    fn restored(stored: StoredSession, client: ClientInfo) -> Self {
        let mut session = Self::new(&stored.client_id, false, client);
        session.subscriptions = stored
            .subscriptions
            .into_iter()
            .filter_map(|(filter, qos)| QoS::try_from(qos).ok().map(|qos| (filter, qos)))
            .collect();
        session.existed = true;
        session
    }

    pub(crate) fn is_bound_to(&self, connection: ConnectionId) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.id() == connection)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn to_stored(&self) -> StoredSession {
        StoredSession {
            client_id: self.client_id.to_string(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos as u8))
                .collect(),
        }
    }
}

/// Read-only copy of a session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub clean: bool,
    pub subscriptions: Vec<(String, QoS)>,
    pub will: Option<Will>,
    pub connected: bool,
    pub queued: usize,
}

/// Result of [`SessionRegistry::bind_or_takeover`].
#[derive(Debug)]
pub struct BindOutcome {
    /// A session existed for the client id before this bind.
    pub was_present: bool,
    /// Prior session state was kept (persistent on both sides).
    pub resumed: bool,
    /// Messages queued while offline, to be sent after the CONNACK.
    pub replay: Vec<Publish>,
}

pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<Mutex<Session>>>,
    directory: Arc<SubscriptionDirectory>,
    repository: Arc<dyn SessionRepository>,
    authorizer: Arc<dyn Authorizer>,
    reauthorize_on_connect: bool,
}

impl SessionRegistry {
    pub fn new(
        directory: Arc<SubscriptionDirectory>,
        repository: Arc<dyn SessionRepository>,
        authorizer: Arc<dyn Authorizer>,
        reauthorize_on_connect: bool,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            directory,
            repository,
            authorizer,
            reauthorize_on_connect,
        }
    }

    fn lookup(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    /// The session for `client_id`, creating it (from storage for persistent
    /// sessions) if it is not in memory.
    fn get_or_create(
        &self,
        client_id: &str,
        clean: bool,
        client: &ClientInfo,
    ) -> Result<Arc<Mutex<Session>>> {
        if let Some(slot) = self.lookup(client_id) {
            return Ok(slot);
        }

        let session = if clean {
            Session::new(client_id, true, client.clone())
        } else {
            match self.repository.load(client_id)? {
                Some(stored) => {
                    log::debug!("Restoring stored session for {}", client_id);
                    Session::restored(stored, client.clone())
                }
                None => Session::new(client_id, false, client.clone()),
            }
        };

        let slot = match self.sessions.entry(Arc::from(client_id)) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => vacant.insert(Arc::new(Mutex::new(session))).clone(),
        };
        Ok(slot)
    }

    /// Bind `connection` to `client_id`, evicting any connection already bound.
    ///
    /// Atomic per client id. The evicted connection's transport is closed
    /// before this returns. If either the existing or the new session is
    /// clean, prior state is discarded; otherwise subscriptions are kept and
    /// queued messages are handed back for replay.
    pub fn bind_or_takeover(
        &self,
        client_id: &str,
        clean: bool,
        connection: &Arc<Connection>,
        client: ClientInfo,
    ) -> Result<BindOutcome> {
        loop {
            let slot = self.get_or_create(client_id, clean, &client)?;
            let mut session = slot.lock();
            if session.removed {
                continue;
            }

            let was_present = session.existed;
            let prior_clean = was_present && session.clean;
            if let Some(old) = session.connection.take() {
                if old.id() != connection.id() {
                    log::info!(
                        "Client {} taken over: evicting {} for {}",
                        client_id,
                        old.id(),
                        connection.id()
                    );
                    old.evict();
                }
            }

            let reset = was_present && (session.clean || clean);
            if reset {
                log::debug!("Discarding prior state of session {}", client_id);
                self.detach_all(&mut session);
                session.queue.clear();
                session.will = None;
            }
            if clean && !prior_clean {
                if let Err(e) = self.repository.delete(client_id) {
                    log::warn!("Failed to delete stored session {}: {}", client_id, e);
                }
            }

            session.client = client;
            if !reset && self.reauthorize_on_connect {
                self.reauthorize(&mut session);
            }
            if !session.attached {
                for (filter, qos) in &session.subscriptions {
                    self.directory.add(filter, client_id, *qos);
                }
                session.attached = true;
            }

            session.clean = clean;
            session.existed = true;
            session.connection = Some(connection.clone());
            connection.set_client_id(client_id);
            let replay: Vec<Publish> = session.queue.drain(..).collect();

            if !clean {
                if let Err(e) = self.repository.save(&session.to_stored()) {
                    log::warn!("Failed to persist session {}: {}", client_id, e);
                }
            }

            log::info!(
                "Bound {} to {} (present: {}, clean: {}, replay: {})",
                client_id,
                connection.id(),
                was_present,
                clean,
                replay.len()
            );
            return Ok(BindOutcome {
                was_present,
                resumed: was_present && !reset,
                replay,
            });
        }
    }

    /// Drop subscriptions the authorizer no longer allows.
    fn reauthorize(&self, session: &mut Session) {
        let denied: Vec<String> = session
            .subscriptions
            .keys()
            .filter(|filter| !self.authorizer.can_read(&session.client, filter))
            .cloned()
            .collect();
        for filter in denied {
            log::info!(
                "Dropping subscription '{}' of {}: no longer authorized",
                filter,
                session.client_id
            );
            session.subscriptions.remove(&filter);
            if session.attached {
                self.directory.remove(&filter, &session.client_id);
            }
        }
    }

    /// Remove every subscription of `session` from both the directory and
    /// the session itself.
    fn detach_all(&self, session: &mut Session) {
        if session.attached {
            self.directory.remove_client(
                &session.client_id,
                session.subscriptions.keys().map(String::as_str),
            );
        }
        session.subscriptions.clear();
    }

    /// Remove the session from the registry. Caller holds its mutex.
    fn teardown(&self, slot: &Arc<Mutex<Session>>, session: &mut Session) {
        self.detach_all(session);
        session.removed = true;
        session.connection = None;
        if !session.clean {
            if let Err(e) = self.repository.delete(&session.client_id) {
                log::warn!(
                    "Failed to delete stored session {}: {}",
                    session.client_id,
                    e
                );
            }
        }
        self.sessions
            .remove_if(&*session.client_id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Release `connection`'s claim on `client_id`.
    ///
    /// Does nothing unless the session is still bound to `connection`, so a
    /// concurrent rebind is never undone. With `due_to_clean_session` the
    /// session and its subscriptions are removed entirely. Returns whether
    /// anything changed.
    pub fn unbind(
        &self,
        client_id: &str,
        connection: ConnectionId,
        due_to_clean_session: bool,
    ) -> bool {
        let Some(slot) = self.lookup(client_id) else {
            return false;
        };
        let mut session = slot.lock();
        if session.removed || !session.is_bound_to(connection) {
            log::debug!("Unbind of {} by {} skipped: rebound", client_id, connection);
            return false;
        }

        if due_to_clean_session {
            self.teardown(&slot, &mut session);
            log::debug!("Removed clean session {}", client_id);
        } else {
            session.connection = None;
            log::debug!("Session {} is now offline", client_id);
        }
        true
    }

    /// Remove a session whatever its clean flag, closing any live connection.
    pub fn expire(&self, client_id: &str) -> bool {
        let Some(slot) = self.lookup(client_id) else {
            return false;
        };
        let mut session = slot.lock();
        if session.removed {
            return false;
        }
        if let Some(connection) = session.connection.take() {
            connection.close();
        }
        self.teardown(&slot, &mut session);
        log::info!("Expired session {}", client_id);
        true
    }

    pub fn retrieve(&self, client_id: &str) -> Option<SessionSnapshot> {
        self.with_session(client_id, |session| SessionSnapshot {
            client_id: session.client_id.to_string(),
            clean: session.clean,
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect(),
            will: session.will.clone(),
            connected: session.is_connected(),
            queued: session.queue.len(),
        })
    }

    /// Store (or clear) the will of the session bound to `connection`.
    pub fn set_will(&self, client_id: &str, connection: ConnectionId, will: Option<Will>) -> bool {
        self.with_session(client_id, |session| {
            if !session.is_bound_to(connection) {
                return false;
            }
            session.will = will;
            true
        })
        .unwrap_or(false)
    }

    pub fn will(&self, client_id: &str) -> Option<Will> {
        self.with_session(client_id, |session| session.will.clone())
            .flatten()
    }

    pub fn clear_will(&self, client_id: &str) {
        self.with_session(client_id, |session| session.will = None);
    }

    /// Take the will for publication, if `connection` still owns the session.
    pub fn take_will(&self, client_id: &str, connection: ConnectionId) -> Option<Will> {
        self.with_session(client_id, |session| {
            if session.is_bound_to(connection) {
                session.will.take()
            } else {
                None
            }
        })
        .flatten()
    }

    /// Put publishes that never reached `connection` back at the head of a
    /// persistent session's offline queue. QoS 0 copies are dropped.
    pub fn requeue(&self, client_id: &str, connection: ConnectionId, unsent: Vec<Publish>) -> usize {
        self.with_session(client_id, |session| {
            if session.clean || !session.is_bound_to(connection) {
                return 0;
            }
            let mut count = 0;
            for publish in unsent.into_iter().rev() {
                if publish.qos != QoS::AtMostOnce {
                    session.queue.push_front(publish);
                    count += 1;
                }
            }
            count
        })
        .unwrap_or(0)
    }

    /// Number of sessions, connected or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run `f` under the session's mutex. `None` if there is no session.
    pub(crate) fn with_session<R>(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let slot = self.lookup(client_id)?;
        let mut session = slot.lock();
        if session.removed {
            return None;
        }
        Some(f(&mut session))
    }

    /// Persist a session's subscriptions. Caller holds its mutex.
    pub(crate) fn store(&self, session: &Session) {
        if session.clean {
            return;
        }
        if let Err(e) = self.repository.save(&session.to_stored()) {
            log::warn!("Failed to persist session {}: {}", session.client_id, e);
        }
    }
}
