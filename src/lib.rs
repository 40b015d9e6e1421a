//! ConformQ - Black-box wire-conformance testing for MQTT v3.1
//!
//! Drives a broker or client implementation as an external process,
//! exchanges bit-exact control packets with it over TCP or TLS, and
//! judges every byte it sends against a declarative scenario.

pub mod codec;
pub mod config;
pub mod harness;
pub mod matcher;
pub mod protocol;
pub mod scenario;
pub mod suite;
pub mod transport;

pub use config::Config;
pub use harness::{ProcessHandle, ProcessSpec};
pub use matcher::{Expectation, MatchOutcome, MatchRule};
pub use protocol::{Packet, ProtocolVersion, QoS};
pub use scenario::{PeerRole, Scenario, ScenarioOutcome, ScenarioRunner, Step};
pub use transport::{Listener, PeerLink, TlsClientConfig};
