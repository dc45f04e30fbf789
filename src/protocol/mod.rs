//! MQTT Protocol definitions and types
//!
//! Defines the core types shared by the codec, the subscription registry
//! and the broker: packet types, QoS levels, control byte flags and the
//! generic [`Packet`] representation.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError, Severity};
pub use packet::*;
pub(crate) use packet::parse_subscribe_entries;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Map the high nibble of a control byte to a packet type.
    /// Codes 0 and 15 are reserved and yield `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketType::Connect => "CONNECT",
            PacketType::ConnAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PubAck => "PUBACK",
            PacketType::PubRec => "PUBREC",
            PacketType::PubRel => "PUBREL",
            PacketType::PubComp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubAck => "UNSUBACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// The four flag bits of a control byte.
///
/// Flags are indexed high-to-low: `flag(0)` is bit 3 (DUP for PUBLISH),
/// `flag(1)` and `flag(2)` are bits 2 and 1 (the QoS pair), `flag(3)` is
/// bit 0 (RETAIN). Their meaning depends on the packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    /// Flags required on SUBSCRIBE (`0010`)
    pub const SUBSCRIBE: Flags = Flags(0x02);

    /// Build from the low nibble of a control byte; high bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & 0x0F)
    }

    /// Build from four booleans, most significant first.
    pub fn from_array(flags: [bool; 4]) -> Self {
        let bits = flags
            .iter()
            .fold(0u8, |acc, &set| (acc << 1) | u8::from(set));
        Flags(bits)
    }

    /// PUBLISH flags for the given QoS and retain bit, DUP clear.
    pub fn publish(qos: QoS, retain: bool) -> Self {
        let qos = qos as u8;
        Flags::from_array([false, qos & 0x02 != 0, qos & 0x01 != 0, retain])
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Flag at `index` (0..=3), counted from the most significant bit.
    pub fn flag(self, index: usize) -> bool {
        debug_assert!(index < 4);
        (self.0 >> (3 - index)) & 0x01 != 0
    }

    pub fn to_array(self) -> [bool; 4] {
        [self.flag(0), self.flag(1), self.flag(2), self.flag(3)]
    }

    pub fn dup(self) -> bool {
        self.flag(0)
    }

    /// Raw two-bit QoS field of a PUBLISH control byte (may be 3).
    pub fn qos_bits(self) -> u8 {
        (self.0 >> 1) & 0x03
    }

    pub fn retain(self) -> bool {
        self.flag(3)
    }
}
