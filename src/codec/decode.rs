//! MQTT Packet Decoder
//!
//! Decodes frames from a byte buffer that may hold a partial packet.

use bytes::Bytes;

use super::{read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{parse_subscribe_entries, DecodeError, Flags, Packet, PacketType, QoS};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Largest remaining length accepted, in bytes
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), `None` while the frame is incomplete,
    /// or an error for a structurally invalid frame
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let type_code = first_byte >> 4;
        let packet_type =
            PacketType::from_u8(type_code).ok_or(DecodeError::InvalidPacketType(type_code))?;
        let flags = Flags::from_bits(first_byte);

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Check packet size limit
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            PacketType::Publish => self.decode_publish(flags, body),
            PacketType::Subscribe => self.decode_subscribe(flags, body),
            PacketType::SubAck => self.decode_suback(flags, body),
            other => Ok(Packet::from_frame(
                other,
                flags,
                Bytes::new(),
                Bytes::copy_from_slice(body),
            )),
        }
        .map_err(truncated_body)?;

        Ok(Some((packet, total_len)))
    }

    fn decode_publish(&self, flags: Flags, body: &[u8]) -> Result<Packet, DecodeError> {
        let qos_bits = flags.qos_bits();
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && flags.dup() {
            return Err(DecodeError::InvalidFlags);
        }

        // Topic name
        let (_, topic_len) = read_string(body)?;

        Ok(Packet::from_frame(
            PacketType::Publish,
            flags,
            Bytes::copy_from_slice(&body[..topic_len]),
            Bytes::copy_from_slice(&body[topic_len..]),
        ))
    }

    fn decode_subscribe(&self, flags: Flags, body: &[u8]) -> Result<Packet, DecodeError> {
        // SUBSCRIBE must have flags 0010
        if flags.to_array() != [false, false, true, false] {
            return Err(DecodeError::InvalidFlags);
        }

        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        // Validates every entry; the processor re-reads them from the payload
        parse_subscribe_entries(&body[2..])?;

        Ok(Packet::from_frame(
            PacketType::Subscribe,
            flags,
            Bytes::copy_from_slice(&body[..2]),
            Bytes::copy_from_slice(&body[2..]),
        ))
    }

    fn decode_suback(&self, flags: Flags, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags.bits() != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let return_codes = &body[2..];
        if let Some(&code) = return_codes
            .iter()
            .find(|&&code| !matches!(code, 0x00 | 0x01 | 0x02 | 0x80))
        {
            return Err(DecodeError::InvalidReasonCode(code));
        }

        Ok(Packet::from_frame(
            PacketType::SubAck,
            flags,
            Bytes::copy_from_slice(&body[..2]),
            Bytes::copy_from_slice(return_codes),
        ))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Inside a complete frame, running out of bytes means the declared
/// structure does not fit the remaining length.
fn truncated_body(e: DecodeError) -> DecodeError {
    match e {
        DecodeError::InsufficientData => {
            DecodeError::MalformedPacket("variable header exceeds remaining length")
        }
        other => other,
    }
}
