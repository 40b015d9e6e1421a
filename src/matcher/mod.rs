//! Packet Matcher
//!
//! Compares bytes read off the wire against an expected packet. The
//! actual bytes are always decoded first, so a structurally invalid
//! frame can never count as a match, and peer-chosen fields (packet
//! identifiers, legacy CONNACK reserved bytes) are tolerated only where
//! a scenario explicitly says so.


use std::fmt;

use crate::codec;
use crate::protocol::{DecodeError, Packet};

/// Comparison policy for a peer-assigned field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchRule {
    /// Field must equal the expected value
    #[default]
    Exact,
    /// Accept whatever the peer sent
    AnyValue,
    /// Accept any value from the set
    OneOf(Vec<u16>),
}

/// Result of matching received bytes against an expectation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Every field agreed under the active rules
    Matched,
    /// The bytes did not decode as a well-formed packet
    Malformed(DecodeError),
    /// Well-formed, but at least one field diverged; carries a
    /// human-readable description of the first divergence
    Mismatch(String),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched)
    }
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchOutcome::Matched => write!(f, "matched"),
            MatchOutcome::Malformed(e) => write!(f, "malformed packet: {}", e),
            MatchOutcome::Mismatch(msg) => write!(f, "mismatch: {}", msg),
        }
    }
}

/// An expected packet plus the tolerance rules in force for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    packet: Packet,
    /// Rule for the packet identifier. Exact when the scenario assigns
    /// the identifier itself, AnyValue when the peer under test owns it.
    packet_id_rule: MatchRule,
    /// Accept a nonzero CONNACK reserved byte, as some broker versions
    /// send. Opt-in per expectation, never a default.
    lenient_ack_flags: bool,
}

impl Expectation {
    /// Expect this exact packet, every field compared strictly
    pub fn exact(packet: Packet) -> Self {
        Self {
            packet,
            packet_id_rule: MatchRule::Exact,
            lenient_ack_flags: false,
        }
    }

    /// Let the peer choose the packet identifier
    pub fn any_packet_id(mut self) -> Self {
        self.packet_id_rule = MatchRule::AnyValue;
        self
    }

    /// Restrict the peer-chosen packet identifier to a known set
    pub fn packet_id_one_of(mut self, ids: Vec<u16>) -> Self {
        self.packet_id_rule = MatchRule::OneOf(ids);
        self
    }

    /// Tolerate a nonzero CONNACK reserved byte
    pub fn lenient_reserved(mut self) -> Self {
        self.lenient_ack_flags = true;
        self
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Decode `actual` and compare it field by field
    pub fn matches(&self, actual: &[u8]) -> MatchOutcome {
        let (decoded, consumed) = match codec::decode(actual) {
            Ok(Some(r)) => r,
            // A truncated frame is a malformed response here: the reader
            // already waited out its deadline for the rest
            Ok(None) => return MatchOutcome::Malformed(DecodeError::InsufficientData),
            Err(e) => return MatchOutcome::Malformed(e),
        };

        if consumed != actual.len() {
            return MatchOutcome::Mismatch(format!(
                "{} followed by {} unexpected trailing byte(s)",
                decoded.packet_type(),
                actual.len() - consumed
            ));
        }

        self.compare(&decoded)
    }

    fn compare(&self, actual: &Packet) -> MatchOutcome {
        let expected = &self.packet;

        if expected.packet_type() != actual.packet_type() {
            return MatchOutcome::Mismatch(format!(
                "expected {}, got {}",
                expected.packet_type(),
                actual.packet_type()
            ));
        }

        if let Some(outcome) = self.compare_packet_id(actual) {
            return outcome;
        }

        match (expected, actual) {
            (Packet::Connect(e), Packet::Connect(a)) => {
                diverge(e.protocol_version, a.protocol_version, "CONNECT protocol version")
                    .or_else(|| diverge(&e.client_id, &a.client_id, "CONNECT client id"))
                    .or_else(|| diverge(e.clean_session, a.clean_session, "CONNECT clean session"))
                    .or_else(|| diverge(e.keep_alive, a.keep_alive, "CONNECT keep alive"))
                    .or_else(|| diverge(&e.username, &a.username, "CONNECT username"))
                    .or_else(|| diverge(&e.password, &a.password, "CONNECT password"))
                    .or_else(|| diverge(&e.will, &a.will, "CONNECT will"))
            }
            (Packet::ConnAck(e), Packet::ConnAck(a)) => {
                let flags = if self.lenient_ack_flags {
                    None
                } else {
                    diverge(e.ack_flags, a.ack_flags, "CONNACK reserved byte")
                };
                flags.or_else(|| diverge(e.return_code, a.return_code, "CONNACK return code"))
            }
            (Packet::Publish(e), Packet::Publish(a)) => {
                diverge(e.dup, a.dup, "PUBLISH dup flag")
                    .or_else(|| diverge(e.qos, a.qos, "PUBLISH QoS"))
                    .or_else(|| diverge(e.retain, a.retain, "PUBLISH retain flag"))
                    .or_else(|| diverge(&e.topic, &a.topic, "PUBLISH topic"))
                    .or_else(|| diverge(&e.payload, &a.payload, "PUBLISH payload"))
            }
            (Packet::Subscribe(e), Packet::Subscribe(a)) => {
                diverge(&e.subscriptions, &a.subscriptions, "SUBSCRIBE filters")
            }
            (Packet::SubAck(e), Packet::SubAck(a)) => {
                diverge(&e.return_codes, &a.return_codes, "SUBACK return codes")
            }
            (Packet::Unsubscribe(e), Packet::Unsubscribe(a)) => {
                diverge(&e.filters, &a.filters, "UNSUBSCRIBE filters")
            }
            // PUBACK/PUBREC/PUBREL/PUBCOMP/UNSUBACK carry only the
            // identifier, already compared; the rest carry nothing
            _ => None,
        }
        .unwrap_or(MatchOutcome::Matched)
    }

    fn compare_packet_id(&self, actual: &Packet) -> Option<MatchOutcome> {
        let expected_id = self.packet.packet_id();
        let actual_id = actual.packet_id();

        match &self.packet_id_rule {
            MatchRule::Exact => diverge(expected_id, actual_id, "packet identifier"),
            MatchRule::AnyValue => {
                // Presence must still agree: a QoS 1 PUBLISH without an
                // identifier is wrong no matter what the rule says
                if expected_id.is_some() != actual_id.is_some() {
                    diverge(expected_id, actual_id, "packet identifier presence")
                } else {
                    None
                }
            }
            MatchRule::OneOf(ids) => match actual_id {
                Some(id) if ids.contains(&id) => None,
                _ => Some(MatchOutcome::Mismatch(format!(
                    "packet identifier: expected one of {:?}, got {:?}",
                    ids, actual_id
                ))),
            },
        }
    }
}

/// First-divergence reporting: None when the fields agree
fn diverge<T: PartialEq + fmt::Debug>(expected: T, actual: T, field: &str) -> Option<MatchOutcome> {
    if expected == actual {
        None
    } else {
        Some(MatchOutcome::Mismatch(format!(
            "{}: expected {:?}, got {:?}",
            field, expected, actual
        )))
    }
}
