// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError};

/// Implemented by every concrete packet type so callers can ask generic
/// questions (`packet_type`, `bytes`) without downcasting.
pub trait Packet: fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// # Errors
    ///
    /// Returns error if the packet's Remaining Length would overflow.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    #[default]
    Connect,
    ConnectAck,
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
    },
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
}

impl PacketType {
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flags_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactlyOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0 };
                dup | qos | retain
            }
            // Bits 3,2,1,0 of PUBREL/SUBSCRIBE/UNSUBSCRIBE are reserved and
            // fixed at 0,0,1,0 [MQTT-3.6.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0,
        };
        (type_bits << 4) | flags_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        // Where a flag bit is marked "Reserved" it MUST be set to the value
        // listed in the spec table; any other value closes the connection
        // [MQTT-2.2.2-1], [MQTT-2.2.2-2].
        match type_bits {
            1 if flag == 0 => Ok(Self::Connect),
            2 if flag == 0 => Ok(Self::ConnectAck),
            3 => {
                let dup = flag & 0b0000_1000 != 0;
                let retain = flag & 0b0000_0001 != 0;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactlyOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                Ok(Self::Publish { dup, retain, qos })
            }
            4 if flag == 0 => Ok(Self::PublishAck),
            5 if flag == 0 => Ok(Self::PublishReceived),
            6 if flag == 0b0000_0010 => Ok(Self::PublishRelease),
            7 if flag == 0 => Ok(Self::PublishComplete),
            8 if flag == 0b0000_0010 => Ok(Self::Subscribe),
            9 if flag == 0 => Ok(Self::SubscribeAck),
            10 if flag == 0b0000_0010 => Ok(Self::Unsubscribe),
            11 if flag == 0 => Ok(Self::UnsubscribeAck),
            12 if flag == 0 => Ok(Self::PingRequest),
            13 if flag == 0 => Ok(Self::PingResponse),
            14 if flag == 0 => Ok(Self::Disconnect),
            1..=14 => {
                log::error!("header: invalid flag bits {flag:#06b} for type {type_bits}");
                Err(DecodeError::InvalidPacketFlags)
            }
            t => {
                log::error!("header: invalid packet type bits {t:#06b}");
                Err(DecodeError::InvalidPacketType)
            }
        }
    }
}

/// Fixed header part common to every control packet: one type-and-flags byte
/// followed by a Variable Byte Integer Remaining Length.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,
    remaining_length: VarInt,
}

impl FixedHeader {
    /// # Errors
    ///
    /// Returns error if `remaining_length` exceeds the 4-byte encoding limit.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        Ok(Self {
            packet_type,
            remaining_length: VarInt::from_usize(remaining_length)?,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let type_byte: u8 = self.packet_type.into();
        buf.push(type_byte);
        self.remaining_length.encode(buf)?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ping_response() {
        let mut buf = Vec::new();
        let header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        assert_eq!(header.encode(&mut buf).unwrap(), 2);
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn decode_publish_fixed_header() {
        let buf = [0x3a, 0x02, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        let header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
            }
        );
        assert_eq!(header.remaining_length(), 2);
    }

    #[test]
    fn decode_rejects_bad_flags() {
        // Connect (type 1) with a non-zero flags nibble is malformed.
        let buf = [0x11, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PacketType::try_from(ba.read_byte().unwrap()),
            Err(DecodeError::InvalidPacketFlags)
        );
    }
}
