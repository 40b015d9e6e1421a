//! Built-in Scenario Suite
//!
//! The conformance scenarios, one constructor per case. Broker cases
//! drive a broker process over an active connection; client cases play
//! the broker side and judge the bytes a client process sends. Client
//! identifiers, topics, and packet identifiers are fixed where a
//! scenario owns them and tolerated where the peer does.

#[cfg(test)]
mod tests;

use std::time::Duration;

use bytes::Bytes;

use crate::config::Config;
use crate::harness::ProcessSpec;
use crate::matcher::Expectation;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, SubackReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use crate::scenario::{PeerRole, Scenario, Step};

/// Names of every built-in scenario, in suite order
pub const SCENARIOS: &[&str] = &[
    "connect-invalid-id",
    "subscribe-qos0",
    "unsubscribe-qos2",
    "tls-connect",
    "tls-psk-bridge",
    "keepalive-pingreq",
    "unsubscribe",
    "publish-qos0",
    "publish-qos1",
    "publish-qos2",
    "subscribe-qos2",
];

/// Build a scenario by name
pub fn build(name: &str, config: &Config) -> Option<Scenario> {
    match name {
        "connect-invalid-id" => Some(connect_invalid_id(config)),
        "subscribe-qos0" => Some(subscribe_qos0(config)),
        "unsubscribe-qos2" => Some(unsubscribe_qos2(config)),
        "tls-connect" => Some(tls_connect(config)),
        "tls-psk-bridge" => Some(tls_psk_bridge(config)),
        "keepalive-pingreq" => Some(keepalive_pingreq(config)),
        "unsubscribe" => Some(client_unsubscribe(config)),
        "publish-qos0" => Some(client_publish_qos0(config)),
        "publish-qos1" => Some(client_publish_qos1(config)),
        "publish-qos2" => Some(client_publish_qos2(config)),
        "subscribe-qos2" => Some(client_subscribe_qos2(config)),
        _ => None,
    }
}

fn base(config: &Config, name: &str, role: PeerRole) -> Scenario {
    let mut scenario = Scenario::new(name, role, config.target.addr());
    scenario.startup_delay = config.timing.startup_delay;
    scenario.recv_timeout = config.timing.recv_timeout;
    scenario.connect_timeout = config.timing.connect_timeout;
    scenario.accept_timeout = config.timing.accept_timeout;
    scenario
}

/// Broker under test, started with an explicit port override
fn broker_process(config: &Config) -> ProcessSpec {
    let mut spec = ProcessSpec::new("broker", &config.broker.command)
        .arg("-p")
        .arg(config.target.port.to_string())
        .args(config.broker.args.clone());
    spec.env.extend(config.broker.env.clone());
    spec
}

/// Broker under test, started with a configuration file
fn broker_with_config(config: &Config, name: &str, config_file: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, &config.broker.command)
        .arg("-c")
        .arg(config_file);
    spec.env.extend(config.broker.env.clone());
    spec
}

/// Client under test, with its search-path environment forwarded
fn client_process(config: &Config) -> ProcessSpec {
    let mut spec =
        ProcessSpec::new("client", &config.client.command).args(config.client.args.clone());
    spec.env.extend(config.client.env.clone());
    spec
}

fn connect(client_id: &str, keep_alive: u16) -> Packet {
    Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V31,
        client_id: client_id.to_string(),
        clean_session: true,
        keep_alive,
        username: None,
        password: None,
        will: None,
    }))
}

fn connack(return_code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(return_code))
}

// ============================================================================
// Broker scenarios
// ============================================================================

/// A CONNECT whose client identifier exceeds the 23-byte limit a strict
/// legacy broker enforces must be answered with return code 2.
pub fn connect_invalid_id(config: &Config) -> Scenario {
    base(config, "connect-invalid-id", PeerRole::ConnectToBroker)
        .process(broker_process(config))
        .send(connect("connect-invalid-id-test-------", 10))
        .expect(Expectation::exact(connack(
            ConnectReturnCode::IdentifierRejected,
        )))
}

/// SUBSCRIBE at QoS 0 must be answered with a SUBACK granting QoS 0 and
/// echoing the packet identifier the scenario chose.
pub fn subscribe_qos0(config: &Config) -> Scenario {
    base(config, "subscribe-qos0", PeerRole::ConnectToBroker)
        .process(broker_process(config))
        .send(connect("subscribe-qos0-test", 60))
        .expect(Expectation::exact(connack(ConnectReturnCode::Accepted)))
        .send(Packet::Subscribe(Subscribe::single(
            53,
            "qos0/test",
            QoS::AtMostOnce,
        )))
        .expect(Expectation::exact(Packet::SubAck(SubAck {
            packet_id: 53,
            return_codes: vec![SubackReturnCode::GrantedQoS0],
        })))
        .send(Packet::Disconnect)
}

/// UNSUBSCRIBE against a connected session must be answered with an
/// UNSUBACK echoing the same identifier and carrying no payload.
pub fn unsubscribe_qos2(config: &Config) -> Scenario {
    base(config, "unsubscribe-qos2", PeerRole::ConnectToBroker)
        .process(broker_process(config))
        .send(connect("unsubscribe-qos2-test", 60))
        .expect(Expectation::exact(connack(ConnectReturnCode::Accepted)))
        .send(Packet::Unsubscribe(Unsubscribe::single(3, "qos2/test")))
        .expect(Expectation::exact(Packet::UnsubAck(UnsubAck::new(3))))
        .send(Packet::Disconnect)
}

/// CONNECT over a TLS-wrapped connection to a broker running a secure
/// listener must be accepted like any plain connection.
pub fn tls_connect(config: &Config) -> Scenario {
    let tls = config.tls.clone().unwrap_or_default();

    base(config, "tls-connect", PeerRole::ConnectToBroker)
        .process(broker_with_config(config, "broker", &tls.broker_config))
        .with_tls(tls.to_client_config())
        .send(connect("tls-connect-test", 60))
        .expect(Expectation::exact(connack(ConnectReturnCode::Accepted)))
        .send(Packet::Disconnect)
}

/// Two brokers bridged over a PSK-secured link; a helper publishes into
/// the far broker and the message must arrive over the bridge. The
/// framework's own socket stays plain TCP; the PSK material lives in
/// the two broker configuration files.
pub fn tls_psk_bridge(config: &Config) -> Scenario {
    let mut helper = ProcessSpec::new("publisher", &config.bridge.helper_command);
    helper.env.extend(config.bridge.helper_env.clone());

    base(config, "tls-psk-bridge", PeerRole::ConnectToBroker)
        .process(broker_with_config(
            config,
            "broker",
            &config.bridge.primary_config,
        ))
        .process(broker_with_config(
            config,
            "bridge-broker",
            &config.bridge.secondary_config,
        ))
        .send(connect("no-psk-test-client", 10))
        .expect(Expectation::exact(connack(ConnectReturnCode::Accepted)))
        .send(Packet::Subscribe(Subscribe::single(
            1,
            "psk/test",
            QoS::AtMostOnce,
        )))
        .expect(Expectation::exact(Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![SubackReturnCode::GrantedQoS0],
        })))
        // The PSK bridge between the brokers may still be handshaking
        .step(Step::Pause(Duration::from_millis(500)))
        .step(Step::Run(helper))
        .expect(Expectation::exact(Packet::Publish(Publish {
            topic: "psk/test".to_string(),
            payload: Bytes::from_static(b"message"),
            ..Default::default()
        })))
}

// ============================================================================
// Client scenarios (framework plays the broker side)
// ============================================================================

/// A client configured with keep-alive 4 and no other traffic must emit
/// a PINGREQ within keep-alive + 1 seconds of its last packet.
pub fn keepalive_pingreq(config: &Config) -> Scenario {
    let keep_alive: u16 = 4;
    base(config, "keepalive-pingreq", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("01-keepalive-pingreq", keep_alive)))
        .send(connack(ConnectReturnCode::Accepted))
        .step(Step::ExpectWithin(
            Expectation::exact(Packet::PingReq),
            Duration::from_secs(u64::from(keep_alive) + 1),
        ))
}

/// The client must send a correctly formed UNSUBSCRIBE; the identifier
/// is its own to choose and is echoed back in the UNSUBACK.
pub fn client_unsubscribe(config: &Config) -> Scenario {
    base(config, "unsubscribe", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("unsubscribe-test", 60)))
        .send(connack(ConnectReturnCode::Accepted))
        .expect(
            Expectation::exact(Packet::Unsubscribe(Unsubscribe::single(
                1,
                "unsubscribe/test",
            )))
            .any_packet_id(),
        )
        .step(Step::SendEchoingId(Packet::UnsubAck(UnsubAck::new(0))))
}

/// QoS 0 publish: fire and forget, no acknowledgement to exchange.
pub fn client_publish_qos0(config: &Config) -> Scenario {
    base(config, "publish-qos0", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("publish-qos0-test", 60)))
        .send(connack(ConnectReturnCode::Accepted))
        .expect(Expectation::exact(Packet::Publish(Publish {
            topic: "pub/qos0/test".to_string(),
            payload: Bytes::from_static(b"message"),
            ..Default::default()
        })))
}

/// QoS 1 publish: the client owns the identifier, the PUBACK echoes
/// it, and the client disconnects once the delivery completes.
pub fn client_publish_qos1(config: &Config) -> Scenario {
    base(config, "publish-qos1", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("publish-qos1-test", 60)))
        .send(connack(ConnectReturnCode::Accepted))
        .expect(
            Expectation::exact(Packet::Publish(Publish {
                qos: QoS::AtLeastOnce,
                topic: "pub/qos1/test".to_string(),
                packet_id: Some(1),
                payload: Bytes::from_static(b"message"),
                ..Default::default()
            }))
            .any_packet_id(),
        )
        .step(Step::SendEchoingId(Packet::PubAck(PubAck::new(0))))
        .expect(Expectation::exact(Packet::Disconnect))
}

/// QoS 2 publish: the full four-step handshake, identifier chosen by
/// the client and echoed through PUBREC/PUBREL/PUBCOMP.
pub fn client_publish_qos2(config: &Config) -> Scenario {
    base(config, "publish-qos2", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("publish-qos2-test", 60)))
        .send(connack(ConnectReturnCode::Accepted))
        .expect(
            Expectation::exact(Packet::Publish(Publish {
                qos: QoS::ExactlyOnce,
                topic: "pub/qos2/test".to_string(),
                packet_id: Some(1),
                payload: Bytes::from_static(b"message"),
                ..Default::default()
            }))
            .any_packet_id(),
        )
        .step(Step::SendEchoingId(Packet::PubRec(PubRec::new(0))))
        .expect(Expectation::exact(Packet::PubRel(PubRel::new(1))).any_packet_id())
        .step(Step::SendEchoingId(Packet::PubComp(PubComp::new(0))))
        .expect(Expectation::exact(Packet::Disconnect))
}

/// The client must request a QoS 2 subscription and is granted it.
pub fn client_subscribe_qos2(config: &Config) -> Scenario {
    base(config, "subscribe-qos2", PeerRole::AcceptFromClient)
        .process(client_process(config))
        .expect(Expectation::exact(connect("subscribe-qos2-test", 60)))
        .send(connack(ConnectReturnCode::Accepted))
        .expect(
            Expectation::exact(Packet::Subscribe(Subscribe::single(
                1,
                "qos2/test",
                QoS::ExactlyOnce,
            )))
            .any_packet_id(),
        )
        .step(Step::SendEchoingId(Packet::SubAck(SubAck {
            packet_id: 0,
            return_codes: vec![SubackReturnCode::GrantedQoS2],
        })))
}
