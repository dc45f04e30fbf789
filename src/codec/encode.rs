//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_variable_int};
use crate::protocol::{EncodeError, Packet};

/// MQTT Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer:
    /// control byte, remaining length, variable header, payload
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = packet.remaining_length();
        buf.reserve(1 + variable_int_len(remaining_length) + remaining_length as usize);

        buf.put_u8((packet.packet_type().code() << 4) | packet.flags().bits());
        write_variable_int(buf, remaining_length)?;
        buf.put_slice(packet.variable_header());
        buf.put_slice(packet.payload());
        Ok(())
    }

    /// Total encoded size of a packet in bytes
    pub fn encoded_len(&self, packet: &Packet) -> usize {
        let remaining_length = packet.remaining_length();
        1 + variable_int_len(remaining_length) + remaining_length as usize
    }
}
