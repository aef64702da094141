// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;

use crate::header::{FixedHeader, Packet, PacketType};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, PubTopic, QoS,
    VarIntError,
};

/// Transports an application message from Client to Server or vice versa.
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// +-----------------------+
/// | Topic name length     |
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |   (QoS 1 or 2 only)
/// +-----------------------+
/// | Payload ...           |
/// +-----------------------+
/// ```
///
/// Response: none for `QoS` 0, `PublishAckPacket` for `QoS` 1,
/// `PublishReceivedPacket` for `QoS` 2.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishPacket {
    dup: bool,
    qos: QoS,
    retain: bool,
    topic: PubTopic,
    packet_id: PacketId,
    payload: Bytes,
}

impl PublishPacket {
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn new(topic: &str, qos: QoS, payload: &[u8]) -> Result<Self, EncodeError> {
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic: PubTopic::new(topic)?,
            packet_id: PacketId::new(0),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// # Errors
    ///
    /// Returns error if `dup` is set on a `QoS` 0 packet [MQTT-3.3.1-2].
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketType);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }
        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let (dup, qos, retain) =
            if let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() {
                (dup, qos, retain)
            } else {
                return Err(DecodeError::InvalidPacketType);
            };

        // The DUP flag MUST be 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let topic = PubTopic::decode(ba)?;

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                // SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (QoS > 0) MUST contain
                // a non-zero packet id [MQTT-2.3.1-1].
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        if fixed_header.remaining_length() < topic.bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let mut payload_len = fixed_header.remaining_length() - topic.bytes();
        if qos != QoS::AtMostOnce {
            if payload_len < PacketId::bytes() {
                return Err(DecodeError::InvalidRemainingLength);
            }
            payload_len -= PacketId::bytes();
        }

        let payload = Bytes::copy_from_slice(ba.read_bytes(payload_len)?);
        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(buf)?;
        }
        buf.extend_from_slice(&self.payload);

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos0_omits_packet_id() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id().value(), 0);
        assert_eq!(decoded.payload(), b"hi");
    }

    #[test]
    fn qos1_round_trips_packet_id() {
        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::new(7));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id().value(), 7);
    }

    #[test]
    fn dup_on_qos0_is_rejected() {
        let mut packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hi").unwrap();
        assert!(packet.set_dup(true).is_err());
    }
}
