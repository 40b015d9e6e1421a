//! Scenario runner integration tests
//!
//! The peers under test here are scripted tokio tasks speaking raw
//! bytes, so every exchange is deterministic and no external broker or
//! client binary is needed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use bytes::Bytes;
use conformq::harness::ProcessSpec;
use conformq::matcher::Expectation;
use conformq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, Publish, QoS, SubAck,
    SubackReturnCode, Subscribe, UnsubAck, Unsubscribe,
};
use conformq::scenario::{PeerRole, Scenario, ScenarioRunner, Step};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn connect_v31(client_id: &str, keep_alive: u16) -> Packet {
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

/// A scripted broker: binds a port, accepts one connection, and for
/// each (request length, response) pair reads exactly that many bytes
/// and writes the canned response.
async fn scripted_broker(script: Vec<(usize, Vec<u8>)>) -> (SocketAddr, JoinHandle<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        for (request_len, response) in script {
            let mut buf = vec![0u8; request_len];
            stream.read_exact(&mut buf).await.unwrap();
            received.push(buf);
            if !response.is_empty() {
                stream.write_all(&response).await.unwrap();
            }
        }
        received
    });

    (addr, handle)
}

/// A scripted client: connects to the runner's listener (with retries,
/// the listener comes up concurrently) and plays (send, expect length)
/// pairs.
fn scripted_client(addr: SocketAddr, script: Vec<(Vec<u8>, usize)>) -> JoinHandle<Vec<Vec<u8>>> {
    tokio::spawn(async move {
        let mut stream = loop {
            match TcpStream::connect(addr).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        let mut received = Vec::new();
        for (send, expect_len) in script {
            if !send.is_empty() {
                stream.write_all(&send).await.unwrap();
            }
            if expect_len > 0 {
                let mut buf = vec![0u8; expect_len];
                timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
                    .await
                    .expect("timed out waiting for runner")
                    .unwrap();
                received.push(buf);
            }
        }
        received
    })
}

fn quick(scenario: Scenario) -> Scenario {
    let mut scenario = scenario;
    scenario.recv_timeout = Duration::from_secs(2);
    scenario.connect_timeout = Duration::from_secs(2);
    scenario.accept_timeout = Duration::from_secs(5);
    scenario.startup_delay = Duration::from_millis(10);
    scenario
}

// ============================================================================
// Broker-under-test flows (runner connects)
// ============================================================================

#[tokio::test]
async fn oversized_client_id_rejection_flow() {
    // A strict legacy broker answers a >23-byte client id with 32,2,0,2
    let connect = connect_v31("connect-invalid-id-test-------", 10);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    let (addr, broker) = scripted_broker(vec![(connect_len, vec![32, 2, 0, 2])]).await;

    let scenario = quick(Scenario::new("connect-invalid-id", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::IdentifierRejected,
        ))));

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);
    broker.await.unwrap();
}

#[tokio::test]
async fn subscribe_qos0_flow_matches_documented_bytes() {
    let connect = connect_v31("subscribe-qos0-test", 60);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    let subscribe = Packet::Subscribe(Subscribe::single(53, "qos0/test", QoS::AtMostOnce));
    let subscribe_len = conformq::codec::encode_to_bytes(&subscribe).unwrap().len();

    let (addr, broker) = scripted_broker(vec![
        (connect_len, vec![32, 2, 0, 0]),
        (subscribe_len, vec![144, 3, 0, 53, 0]),
    ])
    .await;

    let scenario = quick(Scenario::new("subscribe-qos0", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
        ))))
        .send(subscribe)
        .expect(Expectation::exact(Packet::SubAck(SubAck {
            packet_id: 53,
            return_codes: vec![SubackReturnCode::GrantedQoS0],
        })));

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);

    // The broker saw exactly the bytes the original capture documents
    let received = broker.await.unwrap();
    assert_eq!(received[1][0], 130);
    assert_eq!(&received[1][2..4], &[0, 53]);
}

#[tokio::test]
async fn unsubscribe_flow_echoes_the_identifier() {
    let connect = connect_v31("unsubscribe-qos2-test", 60);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    let unsubscribe = Packet::Unsubscribe(Unsubscribe::single(3, "qos2/test"));
    let unsubscribe_len = conformq::codec::encode_to_bytes(&unsubscribe).unwrap().len();

    let (addr, broker) = scripted_broker(vec![
        (connect_len, vec![32, 2, 0, 0]),
        (unsubscribe_len, vec![176, 2, 0, 3]),
    ])
    .await;

    let scenario = quick(Scenario::new("unsubscribe-qos2", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
        ))))
        .send(unsubscribe)
        .expect(Expectation::exact(Packet::UnsubAck(UnsubAck::new(3))));

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);
    broker.await.unwrap();
}

#[tokio::test]
async fn first_mismatch_short_circuits_and_reports_bytes() {
    let connect = connect_v31("mismatch-test", 60);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    // Broker rejects where the scenario expects acceptance
    let (addr, _broker) = scripted_broker(vec![(connect_len, vec![32, 2, 0, 5])]).await;

    let scenario = quick(Scenario::new("mismatch", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
        ))))
        // Never reached: the runner must stop at the first mismatch
        .expect(Expectation::exact(Packet::PingResp));

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.step, 1);
    assert!(failure.reason.contains("32,2,0,0"), "{}", failure.reason);
    assert!(failure.reason.contains("32,2,0,5"), "{}", failure.reason);
}

#[tokio::test]
async fn silence_is_a_timeout_failure() {
    let connect = connect_v31("timeout-test", 60);
    // Broker reads the CONNECT, answers nothing, and holds the socket
    // open so the failure is a timeout rather than a closed connection
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let _ = stream.read(&mut buf).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let mut scenario = quick(Scenario::new("timeout", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Accepted,
        ))));
    scenario.recv_timeout = Duration::from_millis(100);

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.failure.unwrap().reason.contains("timed out"));
}

#[tokio::test]
async fn swapping_expect_steps_fails_the_same_wire_trace() {
    // One wire trace: CONNACK then SUBACK
    let connect = connect_v31("order-test", 60);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    let subscribe = Packet::Subscribe(Subscribe::single(7, "a/b", QoS::AtMostOnce));
    let subscribe_len = conformq::codec::encode_to_bytes(&subscribe).unwrap().len();

    let script = |addr| {
        quick(Scenario::new("order", PeerRole::ConnectToBroker, addr))
            .send(connect_v31("order-test", 60))
            .send(Packet::Subscribe(Subscribe::single(7, "a/b", QoS::AtMostOnce)))
    };
    let connack = Expectation::exact(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)));
    let suback = Expectation::exact(Packet::SubAck(SubAck {
        packet_id: 7,
        return_codes: vec![SubackReturnCode::GrantedQoS0],
    }));

    // Declared order matches the trace: passes
    let (addr, _broker) = scripted_broker(vec![
        (connect_len + subscribe_len, vec![32, 2, 0, 0, 144, 3, 0, 7, 0]),
    ])
    .await;
    let scenario = script(addr).expect(connack.clone()).expect(suback.clone());
    assert!(ScenarioRunner::run(scenario).await.passed());

    // Swapped expectations against the same trace: must fail
    let (addr, _broker) = scripted_broker(vec![
        (connect_len + subscribe_len, vec![32, 2, 0, 0, 144, 3, 0, 7, 0]),
    ])
    .await;
    let scenario = script(addr).expect(suback).expect(connack);
    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.failure.unwrap().step, 2);
}

#[tokio::test]
async fn connection_refused_is_a_setup_failure() {
    // Nothing listens here
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();

    let scenario = quick(Scenario::new("refused", PeerRole::ConnectToBroker, addr))
        .send(connect_v31("refused-test", 60));

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.failure.unwrap().is_setup_failure());
}

// ============================================================================
// Client-under-test flows (runner accepts)
// ============================================================================

#[tokio::test]
async fn keepalive_pingreq_within_deadline() {
    let port = next_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let connect = connect_v31("01-keepalive-pingreq", 4);
    let connect_bytes = conformq::codec::encode_to_bytes(&connect).unwrap().to_vec();
    let client = scripted_client(
        addr,
        vec![
            (connect_bytes, 4),      // send CONNECT, read CONNACK
            (vec![192, 0], 0),       // then the keep-alive probe
        ],
    );

    let scenario = quick(Scenario::new("keepalive-pingreq", PeerRole::AcceptFromClient, addr))
        .expect(Expectation::exact(connect))
        .send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .step(Step::ExpectWithin(
            Expectation::exact(Packet::PingReq),
            Duration::from_secs(5),
        ));

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);

    let received = client.await.unwrap();
    assert_eq!(received[0], vec![32, 2, 0, 0]);
}

#[tokio::test]
async fn qos1_publish_ack_echoes_the_peer_identifier() {
    let port = next_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let connect = connect_v31("publish-qos1-test", 60);
    let connect_bytes = conformq::codec::encode_to_bytes(&connect).unwrap().to_vec();
    // The client picks mid 4711 (0x12, 0x67); the scenario does not know it
    let publish = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "pub/qos1/test".to_string(),
        packet_id: Some(4711),
        payload: Bytes::from_static(b"message"),
        ..Default::default()
    });
    let publish_bytes = conformq::codec::encode_to_bytes(&publish).unwrap().to_vec();

    let client = scripted_client(
        addr,
        vec![
            (connect_bytes, 4),    // CONNECT -> CONNACK
            (publish_bytes, 4),    // PUBLISH -> PUBACK
            (vec![224, 0], 0),     // DISCONNECT
        ],
    );

    let scenario = quick(Scenario::new("publish-qos1", PeerRole::AcceptFromClient, addr))
        .expect(Expectation::exact(connect))
        .send(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
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
        .expect(Expectation::exact(Packet::Disconnect));

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);

    // The PUBACK the client received must echo its own identifier
    let received = client.await.unwrap();
    assert_eq!(received[1], vec![0x40, 2, 0x12, 0x67]);
}

#[tokio::test]
async fn wrong_client_bytes_fail_the_accept_scenario() {
    let port = next_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    // Client connects with the wrong identifier
    let wrong_connect = connect_v31("someone-else", 60);
    let wrong_bytes = conformq::codec::encode_to_bytes(&wrong_connect).unwrap().to_vec();
    let _client = scripted_client(addr, vec![(wrong_bytes, 0)]);

    let scenario = quick(Scenario::new("unsubscribe", PeerRole::AcceptFromClient, addr))
        .expect(Expectation::exact(connect_v31("unsubscribe-test", 60)));

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome
        .failure
        .unwrap()
        .reason
        .contains("CONNECT client id"));
}

#[tokio::test]
async fn expect_close_passes_when_the_peer_hangs_up() {
    let connect = connect_v31("close-test", 60);
    let connect_len = conformq::codec::encode_to_bytes(&connect).unwrap().len();
    // Broker rejects, then the script ends and the socket drops
    let (addr, _broker) = scripted_broker(vec![(connect_len, vec![32, 2, 0, 2])]).await;

    let scenario = quick(Scenario::new("close", PeerRole::ConnectToBroker, addr))
        .send(connect)
        .expect(Expectation::exact(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::IdentifierRejected,
        ))))
        .step(Step::ExpectClose);

    let outcome = ScenarioRunner::run(scenario).await;
    assert!(outcome.passed(), "failure: {:?}", outcome.failure);
}

// ============================================================================
// Process teardown
// ============================================================================

#[tokio::test]
async fn teardown_runs_even_when_setup_fails() {
    // The connect target does not exist, so the scenario fails during
    // setup; the spawned process must still be terminated before run()
    // returns
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();

    let scenario = quick(Scenario::new("teardown", PeerRole::ConnectToBroker, addr))
        .process(ProcessSpec::new("sleeper", "sh").args(["-c", "sleep 30"]))
        .send(connect_v31("teardown-test", 60));

    let started = std::time::Instant::now();
    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    // Well under the sleeper's 30 s: the process was killed, not awaited
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn failing_scenario_surfaces_process_stderr() {
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();

    // The process writes to stderr and keeps running; the scenario
    // fails to connect
    let scenario = quick(Scenario::new("stderr", PeerRole::ConnectToBroker, addr)).process(
        ProcessSpec::new("noisy", "sh").args(["-c", "echo address in use >&2; exec sleep 30"]),
    );

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    let stderr = &outcome
        .process_stderr
        .iter()
        .find(|(name, _)| name == "noisy")
        .expect("stderr captured")
        .1;
    assert!(stderr.contains("address in use"));
}

#[tokio::test]
async fn process_dying_during_startup_fails_the_scenario() {
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();

    let mut scenario = quick(Scenario::new("early-exit", PeerRole::ConnectToBroker, addr))
        .process(ProcessSpec::new("dying", "sh").args(["-c", "exit 1"]))
        .send(connect_v31("early-exit-test", 60));
    // Long enough that the exit is observable before the port check
    scenario.startup_delay = Duration::from_millis(300);

    let outcome = ScenarioRunner::run(scenario).await;
    assert_eq!(outcome.exit_code(), 1);
    let failure = outcome.failure.unwrap();
    assert!(failure.reason.contains("exited before"), "{}", failure.reason);
}
