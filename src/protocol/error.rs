//! Protocol error types

use std::fmt;

use super::PacketType;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid packet type
    InvalidPacketType(u8),
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid packet flags
    InvalidFlags,
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Packet too large
    PacketTooLarge,
    /// Invalid SUBACK return code
    InvalidReasonCode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid return code: {}", r),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet too large
    PacketTooLarge,
    /// String too long
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// How far the consequences of an error reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    /// Reported to the caller, no connection is affected
    Warning,
    /// Terminates the offending connection's input loop
    Error,
    /// Halts the whole broker process
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// High-level protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// A packet type the broker never accepts from clients
    UnexpectedPacket(PacketType),
    /// QoS argument outside 0..=2
    InvalidQoS(u8),
    /// Broken internal invariant
    Internal(&'static str),
}

impl ProtocolError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Decode(_) | Self::Encode(_) | Self::UnexpectedPacket(_) => Severity::Error,
            Self::InvalidQoS(_) => Severity::Warning,
            Self::Internal(_) => Severity::Critical,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::UnexpectedPacket(t) => write!(f, "unexpected packet type: {}", t),
            Self::InvalidQoS(q) => write!(f, "malformed QoS value: {}", q),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            ProtocolError::Decode(DecodeError::InvalidFlags).severity(),
            Severity::Error
        );
        assert_eq!(
            ProtocolError::UnexpectedPacket(PacketType::SubAck).severity(),
            Severity::Error
        );
        assert_eq!(ProtocolError::InvalidQoS(3).severity(), Severity::Warning);
        assert_eq!(
            ProtocolError::Internal("registry poisoned").severity(),
            Severity::Critical
        );
        assert!(Severity::Critical > Severity::Error);
    }
}
