//! MQTT Packet Encoder
//!
//! Builds the exact byte representation of each v3.1-era control packet.
//! Remaining lengths are computed up front and written as minimal
//! base-128 varints.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// Encode a packet to the buffer
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(p) => encode_connect(p, buf),
        Packet::ConnAck(p) => encode_connack(p, buf),
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::PubAck(p) => encode_id_only(0x40, p.packet_id, buf),
        Packet::PubRec(p) => encode_id_only(0x50, p.packet_id, buf),
        Packet::PubRel(p) => encode_id_only(0x62, p.packet_id, buf), // PUBREL flags 0010
        Packet::PubComp(p) => encode_id_only(0x70, p.packet_id, buf),
        Packet::Subscribe(p) => encode_subscribe(p, buf),
        Packet::SubAck(p) => encode_suback(p, buf),
        Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
        Packet::UnsubAck(p) => encode_id_only(0xB0, p.packet_id, buf),
        Packet::PingReq => {
            buf.put_u8(0xC0); // PINGREQ type + flags
            buf.put_u8(0x00); // Remaining length
            Ok(())
        }
        Packet::PingResp => {
            buf.put_u8(0xD0); // PINGRESP type + flags
            buf.put_u8(0x00);
            Ok(())
        }
        Packet::Disconnect => {
            buf.put_u8(0xE0); // DISCONNECT type + flags
            buf.put_u8(0x00);
            Ok(())
        }
    }
}

/// Encode a packet into a fresh buffer
pub fn encode_to_bytes(packet: &Packet) -> Result<BytesMut, EncodeError> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf)
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let protocol_name = packet.protocol_version.protocol_name();

    // Calculate remaining length
    let mut remaining_length = 0;

    // Protocol name + length prefix
    remaining_length += 2 + protocol_name.len();
    // Protocol level (1 byte)
    remaining_length += 1;
    // Connect flags (1 byte)
    remaining_length += 1;
    // Keep alive (2 bytes)
    remaining_length += 2;

    // Client ID
    remaining_length += 2 + packet.client_id.len();

    // Will message
    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len();
        remaining_length += 2 + will.payload.len();
    }

    // Username
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }

    // Password
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    // Fixed header
    buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
    write_variable_int(buf, remaining_length as u32)?;

    // Protocol name
    write_string(buf, protocol_name)?;

    // Protocol level
    buf.put_u8(packet.protocol_version.level());

    // Connect flags
    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    // Keep alive
    buf.put_u16(packet.keep_alive);

    // Client ID
    write_string(buf, &packet.client_id)?;

    // Will message
    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }

    // Username
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }

    // Password
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20); // CONNACK type + flags (0010 0000)
    buf.put_u8(0x02); // Remaining length
    buf.put_u8(packet.ack_flags);
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Calculate remaining length
    let mut remaining_length = 2 + packet.topic.len(); // topic length prefix + topic

    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2; // packet identifier
    }

    remaining_length += packet.payload.len();

    // Fixed header
    let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining_length as u32)?;

    // Topic name
    write_string(buf, &packet.topic)?;

    // Packet identifier (only for QoS > 0)
    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }

    // Payload, no length prefix: its extent is implied by the
    // remaining length
    buf.put_slice(&packet.payload);

    Ok(())
}

/// PUBACK/PUBREC/PUBREL/PUBCOMP/UNSUBACK share one shape: fixed header
/// plus a 16-bit packet identifier
fn encode_id_only(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Calculate remaining length
    let mut remaining_length = 2; // packet identifier

    for sub in &packet.subscriptions {
        remaining_length += 2 + sub.filter.len() + 1; // string + requested QoS byte
    }

    // Fixed header
    buf.put_u8(0x82); // SUBSCRIBE type with flags 0010
    write_variable_int(buf, remaining_length as u32)?;

    // Packet identifier
    buf.put_u16(packet.packet_id);

    // Subscriptions
    for sub in &packet.subscriptions {
        write_string(buf, &sub.filter)?;
        buf.put_u8(sub.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet.return_codes.len();

    buf.put_u8(0x90); // SUBACK type
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);

    for code in &packet.return_codes {
        buf.put_u8(*code as u8);
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Calculate remaining length
    let mut remaining_length = 2; // packet identifier

    for filter in &packet.filters {
        remaining_length += 2 + filter.len();
    }

    // Fixed header
    buf.put_u8(0xA2); // UNSUBSCRIBE type with flags 0010
    write_variable_int(buf, remaining_length as u32)?;

    // Packet identifier
    buf.put_u16(packet.packet_id);

    // Topic filters
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    Ok(())
}