//! MQTT Packet Definitions
//!
//! A single generic representation is used for every control packet type:
//! the type tag, the four flag bits, and the raw variable header and payload
//! regions. Type-specific structure is read through the typed views
//! ([`Packet::publish_topic`], [`Packet::subscribe_request`]).

use bytes::{BufMut, Bytes, BytesMut};

use super::{DecodeError, EncodeError, Flags, PacketType, QoS};
use crate::codec::{read_string, read_u16, MAX_REMAINING_LENGTH};

/// MQTT Packet - immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    flags: Flags,
    remaining_length: u32,
    variable_header: Bytes,
    payload: Bytes,
}

impl Packet {
    /// Build a packet from its parts. The remaining length is derived from
    /// the variable header and payload sizes.
    pub fn new(
        packet_type: PacketType,
        flags: Flags,
        variable_header: Bytes,
        payload: Bytes,
    ) -> Result<Self, EncodeError> {
        let total = variable_header.len() + payload.len();
        if total > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        Ok(Self {
            packet_type,
            flags,
            remaining_length: total as u32,
            variable_header,
            payload,
        })
    }

    /// Assemble a packet from an already length-checked frame body
    pub(crate) fn from_frame(
        packet_type: PacketType,
        flags: Flags,
        variable_header: Bytes,
        payload: Bytes,
    ) -> Self {
        debug_assert!(variable_header.len() + payload.len() <= MAX_REMAINING_LENGTH);
        Self {
            packet_type,
            flags,
            remaining_length: (variable_header.len() + payload.len()) as u32,
            variable_header,
            payload,
        }
    }

    /// Packet with no body (PINGREQ, PINGRESP, DISCONNECT)
    pub fn empty(packet_type: PacketType, flags: Flags) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length: 0,
            variable_header: Bytes::new(),
            payload: Bytes::new(),
        }
    }

    /// Build a PUBLISH packet. The variable header holds the length-prefixed
    /// topic only; no packet identifier is written.
    pub fn publish(flags: Flags, topic: &str, payload: Bytes) -> Result<Self, EncodeError> {
        if topic.len() > u16::MAX as usize {
            return Err(EncodeError::StringTooLong);
        }

        let mut header = BytesMut::with_capacity(2 + topic.len());
        header.put_u16(topic.len() as u16);
        header.put_slice(topic.as_bytes());

        Self::new(PacketType::Publish, flags, header.freeze(), payload)
    }

    /// Build a SUBACK carrying one return code per requested topic
    pub fn suback(packet_id: u16, return_codes: &[u8]) -> Result<Self, EncodeError> {
        Self::new(
            PacketType::SubAck,
            Flags::default(),
            Bytes::copy_from_slice(&packet_id.to_be_bytes()),
            Bytes::copy_from_slice(return_codes),
        )
    }

    /// Build a SUBSCRIBE request (client side)
    pub fn subscribe(packet_id: u16, entries: &[(&str, QoS)]) -> Result<Self, EncodeError> {
        let mut payload = BytesMut::new();
        for (topic, qos) in entries {
            if topic.len() > u16::MAX as usize {
                return Err(EncodeError::StringTooLong);
            }
            payload.put_u16(topic.len() as u16);
            payload.put_slice(topic.as_bytes());
            payload.put_u8(*qos as u8);
        }

        Self::new(
            PacketType::Subscribe,
            Flags::SUBSCRIBE,
            Bytes::copy_from_slice(&packet_id.to_be_bytes()),
            payload.freeze(),
        )
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Byte count of variable header plus payload
    pub fn remaining_length(&self) -> u32 {
        self.remaining_length
    }

    pub fn variable_header(&self) -> &Bytes {
        &self.variable_header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Topic of a PUBLISH packet
    pub fn publish_topic(&self) -> Result<&str, DecodeError> {
        if self.packet_type != PacketType::Publish {
            return Err(DecodeError::MalformedPacket("not a PUBLISH packet"));
        }
        let (topic, _) = read_string(&self.variable_header)?;
        Ok(topic)
    }

    /// Packet identifier and topic entries of a SUBSCRIBE packet
    pub fn subscribe_request(&self) -> Result<SubscribeRequest, DecodeError> {
        if self.packet_type != PacketType::Subscribe {
            return Err(DecodeError::MalformedPacket("not a SUBSCRIBE packet"));
        }
        let packet_id = read_u16(&self.variable_header)?;
        let entries = parse_subscribe_entries(&self.payload)?;

        Ok(SubscribeRequest { packet_id, entries })
    }
}

/// Decoded contents of a SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub packet_id: u16,
    /// Requested (topic, QoS) pairs in request order
    pub entries: Vec<(String, QoS)>,
}

/// Parse the repeated `[u16 length][topic][qos]` entries of a SUBSCRIBE payload
pub(crate) fn parse_subscribe_entries(payload: &[u8]) -> Result<Vec<(String, QoS)>, DecodeError> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        let qos_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        entries.push((topic.to_string(), qos));
    }

    if entries.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(entries)
}

/// A message a client published to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_builder_layout() {
        let packet = Packet::publish(Flags::default(), "a/b", Bytes::from("hi")).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Publish);
        assert_eq!(&packet.variable_header()[..], &[0x00, 0x03, b'a', b'/', b'b']);
        assert_eq!(&packet.payload()[..], b"hi");
        assert_eq!(packet.remaining_length(), 7);
        assert_eq!(packet.publish_topic().unwrap(), "a/b");
    }

    #[test]
    fn test_suback_builder() {
        let packet = Packet::suback(0x0102, &[0, 1, 2, 0x80]).unwrap();
        assert_eq!(packet.flags().bits(), 0);
        assert_eq!(&packet.variable_header()[..], &[0x01, 0x02]);
        assert_eq!(&packet.payload()[..], &[0, 1, 2, 0x80]);
        assert_eq!(packet.remaining_length(), 6);
    }

    #[test]
    fn test_subscribe_request_round_trip() {
        let packet =
            Packet::subscribe(7, &[("a/b", QoS::AtLeastOnce), ("c", QoS::ExactlyOnce)]).unwrap();
        let request = packet.subscribe_request().unwrap();
        assert_eq!(request.packet_id, 7);
        assert_eq!(
            request.entries,
            vec![
                ("a/b".to_string(), QoS::AtLeastOnce),
                ("c".to_string(), QoS::ExactlyOnce)
            ]
        );
    }

    #[test]
    fn test_typed_views_reject_other_types() {
        let ping = Packet::empty(PacketType::PingReq, Flags::default());
        assert!(ping.publish_topic().is_err());
        assert!(ping.subscribe_request().is_err());
    }

    #[test]
    fn test_parse_entries_rejects_truncated_entry() {
        // Topic "ab" declared but QoS byte missing
        assert_eq!(
            parse_subscribe_entries(&[0x00, 0x02, b'a', b'b']),
            Err(DecodeError::InsufficientData)
        );
        // Topic length runs past the end
        assert_eq!(
            parse_subscribe_entries(&[0x00, 0x09, b'a']),
            Err(DecodeError::InsufficientData)
        );
    }

    #[test]
    fn test_parse_entries_rejects_bad_qos() {
        assert_eq!(
            parse_subscribe_entries(&[0x00, 0x01, b't', 0x03]),
            Err(DecodeError::InvalidQoS(3))
        );
    }

    #[test]
    fn test_oversized_topic_rejected() {
        let topic = "x".repeat(u16::MAX as usize + 1);
        assert_eq!(
            Packet::publish(Flags::default(), &topic, Bytes::new()),
            Err(EncodeError::StringTooLong)
        );
    }
}
