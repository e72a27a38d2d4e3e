//! A physical client connection as seen by the broker core.
//!
//! The transport itself (socket, codec, event loop) lives outside this crate
//! behind the [`Transport`] trait. A [`Connection`] wraps it with the
//! lifecycle state machine, packet id allocation and an ordered outbound
//! path that any thread may use to deliver publishes.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use mqhub_core::{Packet, Publish, QoS};
use parking_lot::Mutex;
use thiserror::Error;

/// Outbound side of a client transport.
///
/// Implementations must be thread-safe: publishes are delivered from the
/// publisher's thread, control packets from the connection's own actor.
pub trait Transport: Send + Sync + 'static {
    /// Queue a packet for writing.
    fn send(&self, packet: Packet) -> io::Result<()>;

    /// Begin closing the transport. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Transport that hands outbound packets to a crossbeam channel.
///
/// Used by embedders that run their own codec on another thread, and by tests.
pub struct ChannelTransport {
    tx: Sender<Packet>,
    open: AtomicBool,
}

impl ChannelTransport {
    /// A transport and the receiving end of its outbound packets.
    pub fn pair() -> (Arc<Self>, Receiver<Packet>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = Arc::new(Self {
            tx,
            open: AtomicBool::new(true),
        });
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, packet: Packet) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        self.tx
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Process-unique connection identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle.
///
/// `Idle → Authenticating → Binding → Established → Closed`; any failure
/// before binding goes straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Authenticating = 1,
    Binding = 2,
    Established = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Binding,
            3 => ConnectionState::Established,
            _ => ConnectionState::Closed,
        }
    }
}

/// Events consumed by a connection's actor, in order.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded packet from the client.
    Packet(Packet),
    /// The transport went away without a DISCONNECT.
    TransportClosed,
    /// Another connection took over this client identifier.
    Evicted,
}

/// Opening a binding connection failed.
#[derive(Debug, Error)]
#[error("failed to establish connection: {source}")]
pub struct EstablishError {
    pub source: io::Error,
    /// Publishes that never reached the transport, oldest first.
    pub unsent: Vec<Publish>,
}

/// Publishes that arrived while the connection was still binding. They go
/// out after the CONNACK and the session's replay queue.
#[derive(Default)]
struct Outbound {
    held: Vec<Publish>,
}

pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    client_id: OnceLock<String>,
    /// Serializes every write so packets leave in a single order.
    outbound: Mutex<Outbound>,
    next_packet_id: AtomicU16,
    control: Sender<Inbound>,
}

impl Connection {
    /// A new idle connection and the receiver for its control events.
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Self>, Receiver<Inbound>) {
        let (control, control_rx) = crossbeam_channel::bounded(1);
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            transport,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            client_id: OnceLock::new(),
            outbound: Mutex::new(Outbound::default()),
            next_packet_id: AtomicU16::new(1),
            control,
        });
        (connection, control_rx)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The client identifier, once bound.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    /// Record the bound client identifier. Set at most once.
    pub(crate) fn set_client_id(&self, client_id: &str) {
        let _ = self.client_id.set(client_id.to_string());
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Closed && self.transport.is_open()
    }

    /// Allocate the next packet ID. Returns values 1-65535 (0 is invalid).
    pub fn allocate_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a control packet (CONNACK, SUBACK, PINGRESP, ...) immediately.
    pub fn send(&self, packet: Packet) -> io::Result<()> {
        let _guard = self.outbound.lock();
        self.transport.send(packet)
    }

    /// Deliver a publish at the QoS already set on it.
    ///
    /// Publishes delivered while the connection is still binding are held
    /// until [`establish`](Self::establish).
    pub fn deliver(&self, publish: Publish) -> io::Result<()> {
        let mut outbound = self.outbound.lock();
        match self.state() {
            ConnectionState::Established => self.write_publish(publish),
            ConnectionState::Binding => {
                outbound.held.push(publish);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection not established",
            )),
        }
    }

    /// Write `connack`, then `replay` and any held publishes, and open the
    /// connection to direct delivery.
    ///
    /// On failure the publishes that were not written are handed back.
    pub(crate) fn establish(&self, connack: Packet, replay: Vec<Publish>) -> Result<(), EstablishError> {
        let mut outbound = self.outbound.lock();
        let mut pending: VecDeque<Publish> = replay
            .into_iter()
            .chain(std::mem::take(&mut outbound.held))
            .collect();
        let fail = |source: io::Error, pending: VecDeque<Publish>| EstablishError {
            source,
            unsent: pending.into(),
        };

        if !self.transition(ConnectionState::Binding, ConnectionState::Established) {
            let closed = io::Error::new(io::ErrorKind::NotConnected, "connection closed while binding");
            return Err(fail(closed, pending));
        }
        if let Err(e) = self.transport.send(connack) {
            return Err(fail(e, pending));
        }
        while let Some(publish) = pending.pop_front() {
            if let Err(e) = self.write_publish(publish.clone()) {
                pending.push_front(publish);
                return Err(fail(e, pending));
            }
        }
        Ok(())
    }

    fn write_publish(&self, mut publish: Publish) -> io::Result<()> {
        publish.packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(self.allocate_packet_id()),
        };
        self.transport.send(Packet::Publish(publish))
    }

    /// Close the transport. The actor finds out through its inbound channel.
    pub fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.transport.close();
    }

    /// Close because another connection took over the client identifier,
    /// and tell this connection's actor to stand down.
    pub fn evict(&self) {
        self.close();
        match self.control.try_send(Inbound::Evicted) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("{} evicted after its actor exited", self.id);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn publish(topic: &str, qos: QoS) -> Publish {
        Publish::new(topic, Bytes::from_static(b"x"), qos, false)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (t1, _rx1) = ChannelTransport::pair();
        let (t2, _rx2) = ChannelTransport::pair();
        let (c1, _) = Connection::new(t1);
        let (c2, _) = Connection::new(t2);
        assert_ne!(c1.id(), c2.id());
    }

    #[test]
    fn test_state_transitions() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.transition(ConnectionState::Idle, ConnectionState::Authenticating));
        assert!(!conn.transition(ConnectionState::Idle, ConnectionState::Authenticating));
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
    }

    #[test]
    fn test_publishes_held_until_established() {
        let (transport, rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport);
        conn.transition(ConnectionState::Idle, ConnectionState::Authenticating);
        conn.transition(ConnectionState::Authenticating, ConnectionState::Binding);

        conn.deliver(publish("live", QoS::AtMostOnce)).unwrap();
        assert!(rx.try_recv().is_err());

        conn.establish(Packet::Pingresp, vec![publish("replayed", QoS::AtLeastOnce)])
            .unwrap();

        assert!(matches!(rx.try_recv(), Ok(Packet::Pingresp)));
        let topics: Vec<_> = rx
            .try_iter()
            .map(|p| match p {
                Packet::Publish(p) => (p.topic, p.packet_id.is_some()),
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(
            topics,
            vec![("replayed".to_string(), true), ("live".to_string(), false)]
        );
    }

    #[test]
    fn test_failed_establish_returns_unsent_publishes() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport.clone());
        conn.transition(ConnectionState::Idle, ConnectionState::Authenticating);
        conn.transition(ConnectionState::Authenticating, ConnectionState::Binding);
        conn.deliver(publish("held", QoS::AtLeastOnce)).unwrap();
        transport.close();

        let err = conn
            .establish(Packet::Pingresp, vec![publish("replayed", QoS::AtLeastOnce)])
            .unwrap_err();
        let topics: Vec<_> = err.unsent.iter().map(|p| p.topic.as_str()).collect();
        assert_eq!(topics, vec!["replayed", "held"]);
    }

    #[test]
    fn test_establish_after_close_returns_held_publishes() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport);
        conn.transition(ConnectionState::Idle, ConnectionState::Authenticating);
        conn.transition(ConnectionState::Authenticating, ConnectionState::Binding);
        conn.deliver(publish("held", QoS::AtLeastOnce)).unwrap();
        conn.close();

        let err = conn.establish(Packet::Pingresp, Vec::new()).unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::NotConnected);
        assert_eq!(err.unsent.len(), 1);
    }

    #[test]
    fn test_deliver_on_idle_connection_fails() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport);
        let err = conn.deliver(publish("t", QoS::AtMostOnce)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_evict_closes_and_notifies() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, control) = Connection::new(transport.clone());
        conn.evict();
        conn.evict();
        assert!(!transport.is_open());
        assert!(matches!(control.try_recv(), Ok(Inbound::Evicted)));
        assert!(control.try_recv().is_err());
    }

    #[test]
    fn test_packet_ids_skip_zero() {
        let (transport, _rx) = ChannelTransport::pair();
        let (conn, _) = Connection::new(transport);
        conn.next_packet_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(conn.allocate_packet_id(), u16::MAX);
        assert_eq!(conn.allocate_packet_id(), 1);
    }
}
