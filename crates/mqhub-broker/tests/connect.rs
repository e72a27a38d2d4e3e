//! CONNECT admission: identifier policy, authentication, session binding.

mod common;

use common::*;
use mqhub_broker::{ConnAckResult, ConnectionState};
use mqhub_core::{ConnackCode, Packet, QoS};

#[test]
fn test_connect_accepted_with_fresh_session() {
    let broker = broker();
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request(FAKE_CLIENT_ID, true));

    assert_eq!(result, ConnAckResult::Accepted { session_present: false });
    let connack = client.expect_connack();
    assert_eq!(connack.code, ConnackCode::Accepted);
    assert!(!connack.session_present);
    assert_eq!(client.gateway.connection().state(), ConnectionState::Established);
    assert_eq!(client.gateway.connection().client_id(), Some(FAKE_CLIENT_ID));
    assert!(broker.registry().retrieve(FAKE_CLIENT_ID).unwrap().connected);
}

#[test]
fn test_zero_byte_client_id_with_clean_session_gets_generated_id() {
    let broker = broker();
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request("", true));

    assert!(result.is_accepted());
    assert_eq!(client.expect_connack().code, ConnackCode::Accepted);
    let assigned = client.gateway.client().unwrap().client_id.clone();
    assert!(!assigned.is_empty());
    assert_eq!(client.gateway.connection().client_id(), Some(assigned.as_str()));
    assert!(broker.registry().retrieve(&assigned).is_some());
}

#[test]
fn test_generated_ids_are_unique() {
    let broker = broker();
    let a = TestClient::connected(&broker, connect_request("", true));
    let b = TestClient::connected(&broker, connect_request("", true));

    assert_ne!(
        a.gateway.client().unwrap().client_id,
        b.gateway.client().unwrap().client_id
    );
    assert_eq!(broker.registry().len(), 2);
}

#[test]
fn test_zero_byte_client_id_without_clean_session_rejected() {
    let broker = broker();
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request("", false));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::IdentifierRejected));
    assert_eq!(client.expect_connack().code, ConnackCode::IdentifierRejected);
    assert!(!client.is_open());
    assert_eq!(client.gateway.connection().state(), ConnectionState::Closed);
    assert!(broker.registry().is_empty());
}

#[test]
fn test_zero_byte_client_id_rejected_when_not_allowed() {
    let broker = broker_with(|config| config.admission.allow_zero_byte_client_id = false);
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request("", true));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::IdentifierRejected));
    assert_eq!(client.expect_connack().code, ConnackCode::IdentifierRejected);
    assert!(!client.is_open());
}

#[test]
fn test_long_client_id_accepted() {
    let broker = broker();
    let long_id = "extremely_long_client_identifier_beyond_23_characters";
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request(long_id, true));

    assert!(result.is_accepted());
    assert_eq!(client.expect_connack().code, ConnackCode::Accepted);
}

#[test]
fn test_valid_credentials_accepted() {
    let broker = broker_with_users(|_| {});
    let mut client = TestClient::new(&broker);

    let result = client.connect(with_credentials(
        connect_request(FAKE_CLIENT_ID, true),
        TEST_USER,
        TEST_PWD,
    ));

    assert!(result.is_accepted());
    let info = client.gateway.client().unwrap();
    assert_eq!(info.username.as_deref(), Some(TEST_USER));
    assert!(!info.is_anonymous);
}

#[test]
fn test_invalid_credentials_rejected() {
    let broker = broker_with_users(|_| {});
    let mut client = TestClient::new(&broker);

    let result = client.connect(with_credentials(
        connect_request(FAKE_CLIENT_ID, true),
        EVIL_TEST_USER,
        EVIL_TEST_PWD,
    ));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert_eq!(client.expect_connack().code, ConnackCode::BadUsernamePassword);
    assert!(!client.is_open());
    assert!(broker.registry().is_empty());
}

#[test]
fn test_username_without_password_rejected() {
    let broker = broker_with_users(|_| {});
    let mut client = TestClient::new(&broker);
    let mut connect = connect_request(FAKE_CLIENT_ID, true);
    connect.username = Some(TEST_USER.to_string());

    let result = client.connect(connect);

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert!(!client.is_open());
}

#[test]
fn test_anonymous_rejected_when_not_allowed() {
    let broker = broker_with_users(|config| config.admission.allow_anonymous = false);
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request(FAKE_CLIENT_ID, true));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert_eq!(client.expect_connack().code, ConnackCode::BadUsernamePassword);
    assert!(broker.registry().is_empty());
}

#[test]
fn test_anonymous_accepted_when_allowed() {
    let broker = broker_with_users(|_| {});
    let mut client = TestClient::new(&broker);

    let result = client.connect(connect_request(FAKE_CLIENT_ID, true));

    assert!(result.is_accepted());
    assert!(client.gateway.client().unwrap().is_anonymous);
}

#[test]
fn test_unsupported_protocol_version_rejected() {
    let broker = broker();
    let mut client = TestClient::new(&broker);
    let mut connect = connect_request(FAKE_CLIENT_ID, true);
    connect.protocol_version = 5;

    let result = client.connect(connect);

    assert_eq!(
        result,
        ConnAckResult::Rejected(ConnackCode::UnacceptableProtocolVersion)
    );
    assert_eq!(client.gateway.connection().state(), ConnectionState::Closed);
    assert!(broker.registry().is_empty());
}

#[test]
fn test_wildcard_will_topic_closes_without_connack() {
    let broker = broker();
    let mut client = TestClient::new(&broker);

    let result = client.connect(with_will(
        connect_request(FAKE_CLIENT_ID, true),
        "status/#",
        b"offline",
        QoS::AtLeastOnce,
        true,
    ));

    assert_eq!(result, ConnAckResult::Closed);
    assert!(client.received().is_empty());
    assert!(!client.is_open());
    assert!(broker.registry().is_empty());
    assert!(broker.retained().get("status/#").is_none());
}

#[test]
fn test_bad_credentials_do_not_disturb_connected_session() {
    let broker = broker_with_users(|_| {});
    let mut owner = TestClient::connected(
        &broker,
        with_credentials(connect_request(FAKE_CLIENT_ID, false), TEST_USER, TEST_PWD),
    );
    owner.send(subscribe(1, &[("a/b", QoS::AtLeastOnce)]));
    owner.expect_suback();

    let mut intruder = TestClient::new(&broker);
    let result = intruder.connect(with_credentials(
        connect_request(FAKE_CLIENT_ID, true),
        EVIL_TEST_USER,
        EVIL_TEST_PWD,
    ));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert!(owner.is_open());
    let snapshot = broker.registry().retrieve(FAKE_CLIENT_ID).unwrap();
    assert!(snapshot.connected);
    assert!(!snapshot.clean);
    assert_eq!(snapshot.subscriptions.len(), 1);

    owner.send(publish("a/b", b"still here", QoS::AtMostOnce, false));
    assert_eq!(owner.publishes().len(), 1);
}

#[test]
fn test_first_packet_must_be_connect() {
    let broker = broker();
    let mut client = TestClient::new(&broker);

    client.send(Packet::Pingreq);

    assert!(!client.alive);
    assert!(!client.is_open());
    assert!(client.received().is_empty());
}

#[test]
fn test_second_connect_closes_without_connack() {
    let broker = broker();
    let mut client = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, true));

    client.send(Packet::Connect(connect_request(FAKE_CLIENT_ID, true)));

    assert!(!client.alive);
    assert!(!client.is_open());
    assert!(client.received().is_empty());
    assert!(broker.registry().retrieve(FAKE_CLIENT_ID).is_none());
}

#[test]
fn test_process_connect_twice_returns_closed() {
    let broker = broker();
    let mut client = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, true));

    let result = client.connect(connect_request(FAKE_CLIENT_ID, true));

    assert_eq!(result, ConnAckResult::Closed);
    assert!(client.received().is_empty());
}

#[test]
fn test_takeover_evicts_previous_connection() {
    let broker = broker();
    let first = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, false));

    let mut second = TestClient::new(&broker);
    let result = second.connect(connect_request(FAKE_CLIENT_ID, false));

    assert_eq!(result, ConnAckResult::Accepted { session_present: true });
    assert!(!first.is_open());
    assert_eq!(first.gateway.connection().state(), ConnectionState::Closed);
    assert!(second.is_open());
    assert_eq!(broker.registry().len(), 1);
}

#[test]
fn test_evicted_actor_leaves_session_alone() {
    let broker = broker();
    let mut first = TestClient::connected(
        &broker,
        with_will(
            connect_request(FAKE_CLIENT_ID, true),
            "status/FAKE_123",
            b"gone",
            QoS::AtMostOnce,
            false,
        ),
    );
    let mut watcher = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID2, true));
    watcher.send(subscribe(1, &[("status/#", QoS::AtMostOnce)]));
    watcher.expect_suback();

    let _second = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, true));

    // The stale actor notices the closed transport before its eviction notice.
    first.drop_transport();

    assert!(watcher.publishes().is_empty());
    assert!(broker.registry().retrieve(FAKE_CLIENT_ID).unwrap().connected);
}

#[test]
fn test_clean_reconnect_discards_persistent_state() {
    let broker = broker();
    let mut first = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, false));
    first.send(subscribe(1, &[("a/#", QoS::AtLeastOnce)]));
    first.expect_suback();
    first.disconnect();

    let mut second = TestClient::new(&broker);
    let result = second.connect(connect_request(FAKE_CLIENT_ID, true));

    assert_eq!(result, ConnAckResult::Accepted { session_present: false });
    assert!(broker.registry().retrieve(FAKE_CLIENT_ID).unwrap().subscriptions.is_empty());
    assert!(broker.directory().is_empty());
}

#[test]
fn test_known_user_with_wrong_password_rejected() {
    let broker = broker_with_users(|_| {});
    let mut client = TestClient::new(&broker);

    let result = client.connect(with_credentials(
        connect_request(FAKE_CLIENT_ID, true),
        TEST_USER,
        EVIL_TEST_PWD,
    ));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert!(!client.is_open());
}

#[test]
fn test_unknown_user_rejected_when_anonymous_disallowed() {
    let broker = broker_with_users(|config| config.admission.allow_anonymous = false);
    let mut client = TestClient::new(&broker);

    let result = client.connect(with_credentials(
        connect_request(FAKE_CLIENT_ID, true),
        EVIL_TEST_USER,
        TEST_PWD,
    ));

    assert_eq!(result, ConnAckResult::Rejected(ConnackCode::BadUsernamePassword));
    assert!(!client.is_open());
}

#[test]
fn test_will_retrievable_until_clean_disconnect() {
    let broker = broker();
    let mut client = TestClient::connected(
        &broker,
        with_will(
            connect_request(FAKE_CLIENT_ID, false),
            "topic",
            b"Test will message",
            QoS::AtMostOnce,
            false,
        ),
    );
    assert!(client.is_open());

    let will = broker.registry().will(FAKE_CLIENT_ID).unwrap();
    assert_eq!(will.topic, "topic");
    assert_eq!(will.message, b"Test will message");

    client.disconnect();

    assert!(!client.alive);
    assert!(broker.registry().will(FAKE_CLIENT_ID).is_none());
}

#[test]
fn test_takeover_without_will_clears_previous_will() {
    let broker = broker();
    let _first = TestClient::connected(
        &broker,
        with_will(
            connect_request(FAKE_CLIENT_ID, false),
            "topic",
            b"bye",
            QoS::AtMostOnce,
            false,
        ),
    );
    let _second = TestClient::connected(&broker, connect_request(FAKE_CLIENT_ID, false));

    assert!(broker.registry().will(FAKE_CLIENT_ID).is_none());
}
