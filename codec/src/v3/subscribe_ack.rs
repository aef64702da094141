// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::header::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, QoS, VarIntError};

/// Per-topic result of a SUBSCRIBE request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAck {
    /// Maximum `QoS` the Server granted for this filter; may be lower than requested.
    QoS(QoS),

    /// The Server refused this subscription.
    Failure,
}

/// Reply to SUBSCRIBE, one acknowledgement per requested topic filter, in
/// the same order as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,
    acknowledgements: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acknowledgements(&self) -> &[SubscribeAck] {
        &self.acknowledgements
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = PacketId::bytes() + self.acknowledgements.len();
        FixedHeader::new(PacketType::SubscribeAck, remaining_length)
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }

        let packet_id = PacketId::decode(ba)?;
        let mut acknowledgements = Vec::new();
        let mut consumed = PacketId::bytes();

        while consumed < fixed_header.remaining_length() {
            let payload = ba.read_byte()?;
            consumed += 1;
            match payload {
                0x80 => acknowledgements.push(SubscribeAck::Failure),
                0 => acknowledgements.push(SubscribeAck::QoS(QoS::AtMostOnce)),
                1 => acknowledgements.push(SubscribeAck::QoS(QoS::AtLeastOnce)),
                2 => acknowledgements.push(SubscribeAck::QoS(QoS::ExactlyOnce)),
                _ => return Err(DecodeError::InvalidQoS),
            }
        }

        Ok(Self {
            packet_id,
            acknowledgements,
        })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        for ack in &self.acknowledgements {
            let byte = match ack {
                SubscribeAck::Failure => 0x80,
                SubscribeAck::QoS(qos) => *qos as u8,
            };
            buf.push(byte);
        }
        Ok(buf.len() - old_len)
    }
}

impl Packet for SubscribeAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubscribeAck
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
    fn decode_mixed_results() {
        let buf = [0x90, 0x04, 0x00, 0x09, 0x01, 0x80];
        let mut ba = ByteArray::new(&buf);
        let packet = SubscribeAckPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.packet_id().value(), 9);
        assert_eq!(
            packet.acknowledgements(),
            &[SubscribeAck::QoS(QoS::AtLeastOnce), SubscribeAck::Failure]
        );
    }
}
