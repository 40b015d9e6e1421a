//! Suite tests: the declarative cases must produce the documented wire
//! bytes and roles

use pretty_assertions::assert_eq;

use super::{build, SCENARIOS};
use crate::codec::encode_to_bytes;
use crate::config::Config;
use crate::scenario::{PeerRole, Step};

fn config() -> Config {
    Config::parse(
        r#"
        [broker]
        command = "mosquitto"

        [client]
        command = "./client-under-test"

        [bridge]
        primary_config = "a.conf"
        secondary_config = "b.conf"
        helper_command = "./publish-helper"
    "#,
    )
    .unwrap()
}

#[test]
fn every_listed_scenario_builds() {
    let config = config();
    for name in SCENARIOS {
        let scenario = build(name, &config).unwrap_or_else(|| panic!("missing {}", name));
        assert_eq!(scenario.name, *name);
        assert!(!scenario.steps.is_empty(), "{} has no steps", name);
    }
}

#[test]
fn unknown_scenario_name_is_rejected() {
    assert!(build("no-such-scenario", &config()).is_none());
}

#[test]
fn connect_invalid_id_expects_identifier_rejected_bytes() {
    let scenario = build("connect-invalid-id", &config()).unwrap();
    assert_eq!(scenario.role, PeerRole::ConnectToBroker);

    // The client id must exceed the strict legacy 23-byte limit
    match &scenario.steps[0] {
        Step::Send(packet) => {
            let bytes = encode_to_bytes(packet).unwrap();
            // "MQIsdp" preamble, level 3
            assert_eq!(&bytes[2..10], &[0, 6, b'M', b'Q', b'I', b's', b'd', b'p']);
            assert_eq!(bytes[10], 3);
        }
        other => panic!("expected send step, got {:?}", other),
    }
    match &scenario.steps[1] {
        Step::Expect(expectation) => {
            let bytes = encode_to_bytes(expectation.packet()).unwrap();
            assert_eq!(&bytes[..], &[32, 2, 0, 2]);
        }
        other => panic!("expected expect step, got {:?}", other),
    }
}

#[test]
fn subscribe_qos0_expects_the_documented_suback() {
    let scenario = build("subscribe-qos0", &config()).unwrap();

    match &scenario.steps[3] {
        Step::Expect(expectation) => {
            let bytes = encode_to_bytes(expectation.packet()).unwrap();
            assert_eq!(&bytes[..], &[144, 3, 0, 53, 0]);
        }
        other => panic!("expected expect step, got {:?}", other),
    }
}

#[test]
fn keepalive_pingreq_deadline_is_keepalive_plus_one() {
    let scenario = build("keepalive-pingreq", &config()).unwrap();
    assert_eq!(scenario.role, PeerRole::AcceptFromClient);

    match &scenario.steps[2] {
        Step::ExpectWithin(expectation, limit) => {
            let bytes = encode_to_bytes(expectation.packet()).unwrap();
            assert_eq!(&bytes[..], &[192, 0]);
            assert_eq!(*limit, std::time::Duration::from_secs(5));
        }
        other => panic!("expected deadline step, got {:?}", other),
    }
}

#[test]
fn broker_scenarios_pass_the_port_override() {
    let scenario = build("subscribe-qos0", &config()).unwrap();
    let broker = &scenario.processes[0];
    assert_eq!(broker.command, "mosquitto");
    assert_eq!(broker.args, vec!["-p".to_string(), "1888".to_string()]);
}

#[test]
fn tls_connect_wraps_the_connection() {
    let content = r#"
        [broker]
        command = "mosquitto"

        [tls]
        ca_cert = "certs/ca.pem"
        server_name = "localhost"
        broker_config = "tls-listener.conf"
    "#;
    let config = Config::parse(content).unwrap();

    let scenario = build("tls-connect", &config).unwrap();
    let tls = scenario.tls.as_ref().expect("TLS configured");
    assert_eq!(tls.ca_cert_path, "certs/ca.pem");
    assert_eq!(
        scenario.processes[0].args,
        vec!["-c".to_string(), "tls-listener.conf".to_string()]
    );
}

#[test]
fn bridge_scenario_starts_both_brokers() {
    let scenario = build("tls-psk-bridge", &config()).unwrap();
    assert_eq!(scenario.processes.len(), 2);
    assert_eq!(scenario.processes[0].args, vec!["-c".to_string(), "a.conf".to_string()]);
    assert_eq!(scenario.processes[1].args, vec!["-c".to_string(), "b.conf".to_string()]);

    // The helper runs as a mid-scenario step, not an upfront process
    assert!(scenario
        .steps
        .iter()
        .any(|s| matches!(s, Step::Run(spec) if spec.command == "./publish-helper")));
}
