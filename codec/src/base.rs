// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use byteorder::{BigEndian, WriteBytesExt};

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Protocol name present in every CONNECT packet.
pub const PROTOCOL_NAME: &str = "MQTT";

/// 16-bit packet identifier used by SUBSCRIBE, UNSUBSCRIBE and PUBLISH with
/// `QoS` > 0, plus their acknowledgements.
///
/// Zero is reserved; a non-zero invariant is enforced at decode time by each
/// packet that carries one, and at allocation time by the request tracker in
/// the client crate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        2
    }
}

impl From<u16> for PacketId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(Self(ba.read_u16()?))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

/// Level of assurance for delivery of a PUBLISH packet.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// Fire and forget; the message is delivered according to the
    /// capabilities of the underlying network.
    #[default]
    AtMostOnce = 0,

    /// The message is delivered at least once; it may be delivered more
    /// than once if a PUBACK is lost.
    AtLeastOnce = 1,

    /// The message is delivered exactly once, using a four-packet handshake.
    ExactlyOnce = 2,
}

impl QoS {
    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// Protocol level advertised in the CONNECT packet.
///
/// This crate only implements the MQTT 3.1.1 wire format; `V31` is retained
/// as a recognizable-but-unsupported value so decoding a legacy CONNACK
/// rejection path does not have to guess at the byte's meaning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolLevel {
    /// MQTT v3.1.
    V31,

    /// MQTT v3.1.1.
    #[default]
    V311,
}

impl ProtocolLevel {
    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

impl EncodePacket for ProtocolLevel {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let v = match self {
            Self::V31 => 3,
            Self::V311 => 4,
        };
        buf.push(v);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_id_round_trips() {
        let mut buf = Vec::new();
        PacketId::new(42).encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba).unwrap().value(), 42);
    }

    #[test]
    fn qos_rejects_out_of_range_values() {
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }
}
