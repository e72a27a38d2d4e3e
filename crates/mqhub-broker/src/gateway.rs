//! Per-connection actor.
//!
//! A [`Gateway`] owns one [`Connection`] and processes its inbound events
//! strictly in arrival order. The first packet must be CONNECT, which runs the
//! admission pipeline:
//!
//! 1. protocol level (3 or 4) and will topic
//! 2. client identifier policy (empty ids, generated ids)
//! 3. authentication, before any shared state is touched
//! 4. bind-or-takeover in the session registry
//! 5. will registration
//! 6. CONNACK, then replay of messages queued while offline
//!
//! Every rejection sends its CONNACK and then closes the transport. A will
//! with an invalid topic is a protocol violation and closes without one.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, Receiver};
use mqhub_core::{
    Connack, ConnackCode, Connect, Packet, ProtocolError, Publish, QoS, Suback, Subscribe,
    Unsubscribe, SUBACK_FAILURE,
};
use uuid::Uuid;

use crate::auth::{AuthContext, AuthResult, ClientInfo};
use crate::broker::Broker;
use crate::connection::{Connection, ConnectionState, Inbound};
use crate::post_office::{PublishError, SubscribeOutcome};

/// Outcome of [`Gateway::process_connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAckResult {
    /// CONNACK 0 was sent; the connection is established.
    Accepted { session_present: bool },
    /// CONNACK with this code was sent and the connection closed.
    Rejected(ConnackCode),
    /// The connection was closed without completing admission: a protocol
    /// violation, or the transport was lost while the CONNACK went out.
    Closed,
}

impl ConnAckResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnAckResult::Accepted { .. })
    }
}

/// Whether the actor keeps running after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Gateway {
    broker: Arc<Broker>,
    connection: Arc<Connection>,
    control: Receiver<Inbound>,
    /// Set once CONNECT has been accepted.
    client: Option<ClientInfo>,
    clean_session: bool,
}

impl Gateway {
    pub(crate) fn new(
        broker: Arc<Broker>,
        connection: Arc<Connection>,
        control: Receiver<Inbound>,
    ) -> Self {
        Self {
            broker,
            connection,
            control,
            client: None,
            clean_session: true,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The admitted client, once CONNECT has been accepted.
    pub fn client(&self) -> Option<&ClientInfo> {
        self.client.as_ref()
    }

    /// Run the admission pipeline for a CONNECT.
    pub fn process_connect(&mut self, connect: Connect) -> ConnAckResult {
        if self.connection.state() != ConnectionState::Idle {
            return self.refuse("CONNECT after admission");
        }

        if let Err(e) = connect.validate_protocol() {
            log::debug!("{}: {}", self.connection.id(), e);
            return self.reject(ConnackCode::UnacceptableProtocolVersion);
        }
        if let Some(will) = &connect.will {
            if let Err(e) = self.broker.post_office().check_topic_name(&will.topic) {
                log::warn!("{}: will topic '{}': {}", self.connection.id(), will.topic, e);
                return self.refuse("invalid will topic");
            }
        }

        let client_id = match self.resolve_client_id(&connect) {
            Ok(id) => id,
            Err(code) => return self.reject(code),
        };

        if !self
            .connection
            .transition(ConnectionState::Idle, ConnectionState::Authenticating)
        {
            return self.refuse("connection no longer idle");
        }
        let client = match self.authenticate(&connect, &client_id) {
            Ok(client) => client,
            Err(code) => return self.reject(code),
        };

        // Nothing shared has been touched up to here.
        if !self
            .connection
            .transition(ConnectionState::Authenticating, ConnectionState::Binding)
        {
            return self.reject(ConnackCode::ServerUnavailable);
        }

        let registry = self.broker.registry();
        let outcome = match registry.bind_or_takeover(
            &client_id,
            connect.clean_session,
            &self.connection,
            client.clone(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("{}: bind of {} failed: {}", self.connection.id(), client_id, e);
                return self.reject(ConnackCode::ServerUnavailable);
            }
        };

        registry.set_will(&client_id, self.connection.id(), connect.will);
        self.clean_session = connect.clean_session;
        self.client = Some(client);

        let session_present = outcome.resumed;
        let connack = Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
        });
        if let Err(e) = self.connection.establish(connack, outcome.replay) {
            log::debug!("{}: lost during CONNACK: {}", self.connection.id(), e);
            let requeued = registry.requeue(&client_id, self.connection.id(), e.unsent);
            if requeued > 0 {
                log::debug!(
                    "{}: {} messages returned to the queue of {}",
                    self.connection.id(),
                    requeued,
                    client_id
                );
            }
            self.on_transport_closed();
            return ConnAckResult::Closed;
        }

        log::info!(
            "{}: {} connected (clean: {}, session present: {})",
            self.connection.id(),
            client_id,
            connect.clean_session,
            session_present
        );
        ConnAckResult::Accepted { session_present }
    }

    /// Apply the empty-identifier policy. Long identifiers are accepted.
    fn resolve_client_id(&self, connect: &Connect) -> Result<String, ConnackCode> {
        if !connect.client_id.is_empty() {
            return Ok(connect.client_id.clone());
        }
        if !connect.clean_session {
            log::debug!(
                "{}: empty client id requires a clean session",
                self.connection.id()
            );
            return Err(ConnackCode::IdentifierRejected);
        }
        if !self.broker.admission().allow_zero_byte_client_id {
            log::debug!("{}: empty client id not allowed", self.connection.id());
            return Err(ConnackCode::IdentifierRejected);
        }
        let generated = Uuid::new_v4().to_string();
        log::debug!(
            "{}: assigned client id {}",
            self.connection.id(),
            generated
        );
        Ok(generated)
    }

    /// Check credentials. Side-effect free.
    fn authenticate(&self, connect: &Connect, client_id: &str) -> Result<ClientInfo, ConnackCode> {
        if connect.is_anonymous() {
            if self.broker.admission().allow_anonymous {
                return Ok(ClientInfo::anonymous(client_id));
            }
            log::debug!("{}: anonymous connect refused", self.connection.id());
            return Err(ConnackCode::BadUsernamePassword);
        }

        let (Some(username), Some(password)) = (&connect.username, &connect.password) else {
            log::debug!(
                "{}: incomplete credentials for {}",
                self.connection.id(),
                client_id
            );
            return Err(ConnackCode::BadUsernamePassword);
        };

        let ctx = AuthContext {
            client_id,
            username: Some(username.as_str()),
            password: Some(password.as_slice()),
        };
        match self.broker.authenticator().authenticate(&ctx) {
            (AuthResult::Allow, role) => Ok(ClientInfo::authenticated(
                client_id,
                Some(username.clone()),
                role,
            )),
            (AuthResult::DenyServerError, _) => {
                log::warn!(
                    "{}: authenticator unavailable for {}",
                    self.connection.id(),
                    client_id
                );
                Err(ConnackCode::ServerUnavailable)
            }
            (verdict, _) => {
                log::debug!(
                    "{}: authentication of {} as {} failed: {:?}",
                    self.connection.id(),
                    client_id,
                    username,
                    verdict
                );
                Err(ConnackCode::BadUsernamePassword)
            }
        }
    }

    /// Close without a CONNACK.
    fn refuse(&self, reason: &str) -> ConnAckResult {
        log::warn!(
            "{}: {} in state {:?}, closing",
            self.connection.id(),
            reason,
            self.connection.state()
        );
        self.connection.close();
        ConnAckResult::Closed
    }

    fn reject(&self, code: ConnackCode) -> ConnAckResult {
        let connack = Packet::Connack(Connack {
            session_present: false,
            code,
        });
        if let Err(e) = self.connection.send(connack) {
            log::debug!("{}: failed to send CONNACK: {}", self.connection.id(), e);
        }
        self.connection.close();
        log::info!("{}: connection refused: {:?}", self.connection.id(), code);
        ConnAckResult::Rejected(code)
    }

    /// Handle one event. Returns whether the actor should keep running.
    pub fn handle(&mut self, event: Inbound) -> bool {
        let flow = match event {
            Inbound::Packet(packet) => self.handle_packet(packet),
            Inbound::TransportClosed => {
                self.on_transport_closed();
                Flow::Stop
            }
            Inbound::Evicted => {
                log::debug!("{}: evicted by takeover", self.connection.id());
                Flow::Stop
            }
        };
        flow == Flow::Continue
    }

    fn handle_packet(&mut self, packet: Packet) -> Flow {
        let Some(client) = self.client.clone() else {
            if let Packet::Connect(connect) = packet {
                return match self.process_connect(connect) {
                    ConnAckResult::Accepted { .. } => Flow::Continue,
                    _ => Flow::Stop,
                };
            }
            log::warn!(
                "{}: {} ({})",
                self.connection.id(),
                ProtocolError::FirstPacketNotConnect,
                packet.name()
            );
            self.connection.close();
            return Flow::Stop;
        };

        if !self.connection.is_open() {
            self.on_transport_closed();
            return Flow::Stop;
        }

        let result = match packet {
            Packet::Connect(_) => {
                log::warn!("{}: second CONNECT, closing", self.connection.id());
                self.on_transport_closed();
                return Flow::Stop;
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(&client, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(&client, unsubscribe),
            Packet::Publish(publish) => return self.on_publish(&client, publish),
            Packet::Pubrel { packet_id } => self.connection.send(Packet::Pubcomp { packet_id }),
            Packet::Puback { .. } | Packet::Pubrec { .. } | Packet::Pubcomp { .. } => Ok(()),
            Packet::Pingreq => self.connection.send(Packet::Pingresp),
            Packet::Disconnect => {
                self.on_disconnect(&client);
                return Flow::Stop;
            }
            other => {
                log::warn!(
                    "{}: unexpected {} from client, closing",
                    self.connection.id(),
                    other.name()
                );
                self.on_transport_closed();
                return Flow::Stop;
            }
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::debug!("{}: write failed: {}", self.connection.id(), e);
                self.on_transport_closed();
                Flow::Stop
            }
        }
    }

    fn on_subscribe(&self, client: &ClientInfo, subscribe: Subscribe) -> io::Result<()> {
        let post_office = self.broker.post_office();
        let mut return_codes = Vec::with_capacity(subscribe.topics.len());
        let mut retained = Vec::new();
        for (filter, qos) in &subscribe.topics {
            match post_office.subscribe(client, self.connection.id(), filter, *qos) {
                SubscribeOutcome::Granted {
                    qos,
                    retained: matching,
                } => {
                    return_codes.push(qos as u8);
                    retained.extend(matching);
                }
                SubscribeOutcome::Denied(e) => {
                    log::debug!("{}: {}", self.connection.id(), e);
                    return_codes.push(SUBACK_FAILURE);
                }
            }
        }

        self.connection.send(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }))?;
        for publish in retained {
            self.connection.deliver(publish)?;
        }
        Ok(())
    }

    fn on_unsubscribe(&self, client: &ClientInfo, unsubscribe: Unsubscribe) -> io::Result<()> {
        for filter in &unsubscribe.topics {
            self.broker
                .post_office()
                .unsubscribe(&client.client_id, self.connection.id(), filter);
        }
        self.connection.send(Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        })
    }

    fn on_publish(&mut self, client: &ClientInfo, publish: Publish) -> Flow {
        let qos = publish.qos;
        let packet_id = publish.packet_id;
        match self.broker.post_office().publish_from(client, publish) {
            Ok(_) | Err(PublishError::NotAuthorized(_)) => {}
            Err(e @ PublishError::InvalidTopic(_)) => {
                log::warn!("{}: {}, closing", self.connection.id(), e);
                self.on_transport_closed();
                return Flow::Stop;
            }
        }

        let ack = match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => Some(Packet::Puback { packet_id }),
            (QoS::ExactlyOnce, Some(packet_id)) => Some(Packet::Pubrec { packet_id }),
            _ => None,
        };
        if let Some(ack) = ack {
            if let Err(e) = self.connection.send(ack) {
                log::debug!("{}: write failed: {}", self.connection.id(), e);
                self.on_transport_closed();
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Graceful DISCONNECT: the will is discarded.
    fn on_disconnect(&mut self, client: &ClientInfo) {
        let registry = self.broker.registry();
        if registry.take_will(&client.client_id, self.connection.id()).is_some() {
            log::debug!("{}: will discarded on DISCONNECT", self.connection.id());
        }
        self.connection.close();
        registry.unbind(&client.client_id, self.connection.id(), self.clean_session);
        log::info!("{}: {} disconnected", self.connection.id(), client.client_id);
    }

    /// Abnormal end of the connection: publish the will, then unbind.
    fn on_transport_closed(&mut self) {
        self.connection.close();
        let Some(client) = self.client.take() else {
            return;
        };

        let registry = self.broker.registry();
        if let Some(will) = registry.take_will(&client.client_id, self.connection.id()) {
            self.broker.post_office().fire_will(will);
        }
        registry.unbind(&client.client_id, self.connection.id(), self.clean_session);
        log::info!(
            "{}: {} connection lost",
            self.connection.id(),
            client.client_id
        );
    }

    /// Process events until the connection ends.
    ///
    /// A dropped `inbound` sender counts as the transport closing.
    pub fn run(mut self, inbound: Receiver<Inbound>) {
        loop {
            let event = select! {
                recv(inbound) -> event => Some(event.unwrap_or(Inbound::TransportClosed)),
                recv(self.control) -> event => event.ok(),
            };
            let Some(event) = event else {
                continue;
            };
            if !self.handle(event) {
                break;
            }
        }
        log::debug!("{}: actor finished", self.connection.id());
    }

    /// Run the actor on its own named thread.
    pub fn spawn(self, inbound: Receiver<Inbound>) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(self.connection.id().to_string())
            .spawn(move || self.run(inbound))
    }
}
