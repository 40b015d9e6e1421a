//! MQTT Packet Decoder
//!
//! Strict decoding for v3.1-era packets. Every variable part must
//! consume exactly the remaining length: trailing or missing bytes are
//! a decode failure, never a silent pass.

use bytes::Bytes;

use super::{read_binary, read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubackReturnCode, Subscribe, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// Decode one packet from the buffer.
/// Returns `Ok(None)` when the buffer holds the start of a packet but
/// not yet all of it; `(packet, bytes_consumed)` once complete.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    // Parse fixed header
    let first_byte = buf[0];
    let packet_type = first_byte >> 4;
    let flags = first_byte & 0x0F;

    // Read remaining length
    let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
        Ok(r) => r,
        Err(DecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(e),
    };

    if remaining_length as usize > MAX_REMAINING_LENGTH {
        return Err(DecodeError::PacketTooLarge);
    }

    let total_len = 1 + len_bytes + remaining_length as usize;

    // Wait for complete packet
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload_start = 1 + len_bytes;
    let payload = &buf[payload_start..total_len];

    let packet = match packet_type {
        1 => decode_connect(flags, payload)?,
        2 => decode_connack(flags, payload)?,
        3 => decode_publish(flags, payload)?,
        4 => Packet::PubAck(PubAck::new(decode_id_only(flags, 0x00, payload)?)),
        5 => Packet::PubRec(PubRec::new(decode_id_only(flags, 0x00, payload)?)),
        6 => Packet::PubRel(PubRel::new(decode_id_only(flags, 0x02, payload)?)),
        7 => Packet::PubComp(PubComp::new(decode_id_only(flags, 0x00, payload)?)),
        8 => decode_subscribe(flags, payload)?,
        9 => decode_suback(flags, payload)?,
        10 => decode_unsubscribe(flags, payload)?,
        11 => Packet::UnsubAck(UnsubAck::new(decode_id_only(flags, 0x00, payload)?)),
        12 => decode_empty(flags, payload, Packet::PingReq)?,
        13 => decode_empty(flags, payload, Packet::PingResp)?,
        14 => decode_empty(flags, payload, Packet::Disconnect)?,
        _ => return Err(DecodeError::InvalidPacketType(packet_type)),
    };

    Ok(Some((packet, total_len)))
}

fn decode_connect(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let mut pos = 0;

    // Protocol name
    let (protocol_name, len) = read_string(&payload[pos..])?;
    pos += len;

    // Protocol level
    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let level = payload[pos];
    pos += 1;

    let protocol_version =
        ProtocolVersion::from_level(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;

    // Name and level must agree ("MQIsdp"/3, "MQTT"/4)
    if protocol_name != protocol_version.protocol_name() {
        return Err(DecodeError::InvalidProtocolName);
    }

    // Connect flags
    if pos >= payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = payload[pos];
    pos += 1;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    // If username flag is 0, password flag must be 0
    if !username_flag && password_flag {
        return Err(DecodeError::InvalidFlags);
    }

    let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

    // If will flag is 0, will QoS and will retain must be 0
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    // Keep alive
    if pos + 2 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let keep_alive = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    pos += 2;

    // Client ID
    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    // Will message
    let will = if will_flag {
        let (will_topic, len) = read_string(&payload[pos..])?;
        pos += len;

        let (will_payload, len) = read_binary(&payload[pos..])?;
        pos += len;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    // Username
    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    // Password
    let password = if password_flag {
        let (data, len) = read_binary(&payload[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    if pos != payload.len() {
        return Err(DecodeError::LengthMismatch);
    }

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    if payload.len() != 2 {
        return Err(DecodeError::LengthMismatch);
    }

    // The first byte is reserved in v3.1; some broker versions send
    // nonzero values here. Whether that is acceptable is a matcher
    // decision, so it is preserved verbatim rather than rejected.
    let ack_flags = payload[0];

    let return_code =
        ConnectReturnCode::from_u8(payload[1]).ok_or(DecodeError::InvalidReturnCode(payload[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        ack_flags,
        return_code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    // DUP must be 0 for QoS 0
    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
    }

    let mut pos = 0;

    // Topic name
    let (topic, len) = read_string(&payload[pos..])?;
    pos += len;

    // No wildcards allowed in a PUBLISH topic
    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::MalformedPacket("topic contains wildcard"));
    }

    // Packet ID (only for QoS > 0)
    let packet_id = if qos != QoS::AtMostOnce {
        if pos + 2 > payload.len() {
            return Err(DecodeError::InsufficientData);
        }
        let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    // Payload is the remainder, no length prefix
    let message_payload = Bytes::copy_from_slice(&payload[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: message_payload,
    }))
}

/// PUBACK/PUBREC/PUBREL/PUBCOMP/UNSUBACK: a 16-bit identifier and
/// nothing else
fn decode_id_only(flags: u8, expected_flags: u8, payload: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }

    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    if payload.len() != 2 {
        return Err(DecodeError::LengthMismatch);
    }

    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}

fn decode_subscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE must have flags 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;

    // Subscriptions
    let mut subscriptions = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        if pos >= payload.len() {
            return Err(DecodeError::InsufficientData);
        }

        let qos_byte = payload[pos];
        pos += 1;

        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    // SUBSCRIBE must have at least one topic filter
    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    if payload.len() < 3 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);

    // One return code per requested topic filter
    let mut return_codes = Vec::new();
    for &code in &payload[2..] {
        let return_code =
            SubackReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;
        return_codes.push(return_code);
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    // UNSUBSCRIBE must have flags 0010
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;

    // Topic filters
    let mut filters = Vec::new();
    while pos < payload.len() {
        let (filter, len) = read_string(&payload[pos..])?;
        pos += len;

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
        }

        filters.push(filter.to_string());
    }

    // UNSUBSCRIBE must have at least one topic filter
    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// PINGREQ/PINGRESP/DISCONNECT: flags 0000 and an empty body
fn decode_empty(flags: u8, payload: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if !payload.is_empty() {
        return Err(DecodeError::LengthMismatch);
    }
    Ok(packet)
}
