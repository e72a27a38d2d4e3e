//! Shared harness for the gateway integration tests.
//!
//! Each [`TestClient`] is one connection driven synchronously from the test
//! thread: packets go straight into [`Gateway::handle`] and everything the
//! broker writes back is read from the [`ChannelTransport`] receiver.

// Not every test file uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use mqhub_broker::config::UserConfig;
use mqhub_broker::{Broker, ChannelTransport, ConnAckResult, Config, Gateway, Inbound, Transport};
use mqhub_core::{Connack, Connect, Packet, Publish, QoS, Subscribe, Will};

pub const FAKE_CLIENT_ID: &str = "FAKE_123";
pub const FAKE_CLIENT_ID2: &str = "FAKE_456";
pub const TEST_USER: &str = "fakeuser";
pub const TEST_PWD: &[u8] = b"fakepwd";
pub const EVIL_TEST_USER: &str = "eviluser";
pub const EVIL_TEST_PWD: &[u8] = b"unsecret";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A broker with default configuration adjusted by `configure`.
pub fn broker_with(configure: impl FnOnce(&mut Config)) -> Arc<Broker> {
    init_logging();
    let mut config = Config::default();
    configure(&mut config);
    Arc::new(Broker::new(config).expect("broker"))
}

pub fn broker() -> Arc<Broker> {
    broker_with(|_| {})
}

/// A broker that knows `fakeuser`/`fakepwd` only.
pub fn broker_with_users(configure: impl FnOnce(&mut Config)) -> Arc<Broker> {
    broker_with(|config| {
        config.auth.enabled = true;
        config.auth.users = vec![UserConfig {
            username: TEST_USER.to_string(),
            password: Some(String::from_utf8(TEST_PWD.to_vec()).expect("utf8")),
            password_hash: None,
            role: None,
        }];
        configure(config);
    })
}

pub fn connect_request(client_id: &str, clean_session: bool) -> Connect {
    Connect::new(client_id, clean_session)
}

pub fn with_credentials(mut connect: Connect, username: &str, password: &[u8]) -> Connect {
    connect.username = Some(username.to_string());
    connect.password = Some(password.to_vec());
    connect
}

pub fn with_will(mut connect: Connect, topic: &str, message: &[u8], qos: QoS, retain: bool) -> Connect {
    connect.will = Some(Will {
        topic: topic.to_string(),
        message: message.to_vec(),
        qos,
        retain,
    });
    connect
}

pub fn publish(topic: &str, payload: &'static [u8], qos: QoS, retain: bool) -> Packet {
    let mut publish = Publish::new(topic, Bytes::from_static(payload), qos, retain);
    if qos != QoS::AtMostOnce {
        publish.packet_id = Some(1);
    }
    Packet::Publish(publish)
}

pub fn subscribe(packet_id: u16, filters: &[(&str, QoS)]) -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id,
        topics: filters
            .iter()
            .map(|(filter, qos)| (filter.to_string(), *qos))
            .collect(),
    })
}

pub struct TestClient {
    pub gateway: Gateway,
    pub transport: Arc<ChannelTransport>,
    pub rx: Receiver<Packet>,
    /// Whether the actor is still running.
    pub alive: bool,
}

impl TestClient {
    pub fn new(broker: &Arc<Broker>) -> Self {
        let (transport, rx) = ChannelTransport::pair();
        let gateway = broker.accept(transport.clone());
        Self {
            gateway,
            transport,
            rx,
            alive: true,
        }
    }

    /// A fresh connection that has already been accepted with `connect`.
    pub fn connected(broker: &Arc<Broker>, connect: Connect) -> Self {
        let mut client = Self::new(broker);
        let result = client.connect(connect);
        assert!(result.is_accepted(), "connect refused: {:?}", result);
        client.expect_connack();
        client
    }

    pub fn connect(&mut self, connect: Connect) -> ConnAckResult {
        self.gateway.process_connect(connect)
    }

    /// Feed one packet to the actor.
    pub fn send(&mut self, packet: Packet) {
        self.alive = self.gateway.handle(Inbound::Packet(packet));
    }

    /// Simulate the network dropping without a DISCONNECT.
    pub fn drop_transport(&mut self) {
        self.transport.close();
        self.alive = self.gateway.handle(Inbound::TransportClosed);
    }

    pub fn disconnect(&mut self) {
        self.send(Packet::Disconnect);
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Everything written so far.
    pub fn received(&self) -> Vec<Packet> {
        self.rx.try_iter().collect()
    }

    pub fn expect_connack(&self) -> Connack {
        match self.rx.try_recv() {
            Ok(Packet::Connack(connack)) => connack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    pub fn expect_suback(&self) -> Vec<u8> {
        match self.rx.try_recv() {
            Ok(Packet::Suback(suback)) => suback.return_codes,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    /// The publishes written so far, dropping any other packets.
    pub fn publishes(&self) -> Vec<Publish> {
        self.received()
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Publish(publish) => Some(publish),
                _ => None,
            })
            .collect()
    }
}
