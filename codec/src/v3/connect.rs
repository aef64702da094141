// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::PROTOCOL_NAME;
use crate::connect_flags::ConnectFlags;
use crate::header::{FixedHeader, Packet, PacketType};
use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, ProtocolLevel,
    PubTopic, QoS, StringData, U16Data, VarIntError,
};

/// Username/password and Will message carried in the CONNECT payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_level: ProtocolLevel,
    flags: ConnectFlags,
    keep_alive: U16Data,
    client_id: StringData,
    will_topic: Option<PubTopic>,
    will_message: Option<BinaryData>,
    username: Option<StringData>,
    password: Option<BinaryData>,
}

impl ConnectPacket {
    /// # Errors
    ///
    /// Returns error if `client_id` cannot fit a length-prefixed string field.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id).map_err(|_e| EncodeError::InvalidTopic)?;
        Ok(Self {
            protocol_level: ProtocolLevel::V311,
            flags: ConnectFlags::default(),
            keep_alive: U16Data::new(60),
            client_id: StringData::from_str(client_id)?,
            will_topic: None,
            will_message: None,
            username: None,
            password: None,
        })
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = U16Data::new(keep_alive);
        self
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.flags.set_clean_session(clean_session);
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.flags.clean_session()
    }

    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn set_will(&mut self, topic: &str, message: &[u8], qos: QoS, retain: bool) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = Some(BinaryData::from_slice(message)?);
        self.flags.set_will(true);
        self.flags.set_will_qos(qos);
        self.flags.set_will_retain(retain);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns error if `username`/`password` are too long to encode.
    pub fn set_credentials(&mut self, username: &str, password: Option<&[u8]>) -> Result<&mut Self, EncodeError> {
        self.username = Some(StringData::from_str(username)?);
        self.flags.set_has_username(true);
        if let Some(password) = password {
            self.password = Some(BinaryData::from_slice(password)?);
            self.flags.set_has_password(true);
        }
        Ok(self)
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = StringData::from_str(PROTOCOL_NAME)
            .expect("protocol name is a constant")
            .bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + U16Data::bytes()
            + self.client_id.bytes();

        if let (Some(topic), Some(message)) = (&self.will_topic, &self.will_message) {
            remaining_length += topic.bytes() + message.bytes();
        }
        if let Some(username) = &self.username {
            remaining_length += username.bytes();
        }
        if let Some(password) = &self.password {
            remaining_length += password.bytes();
        }

        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        StringData::from_str(PROTOCOL_NAME)
            .expect("protocol name is a constant")
            .encode(buf)?;
        self.protocol_level.encode(buf)?;
        self.flags.encode(buf)?;
        self.keep_alive.encode(buf)?;
        self.client_id.encode(buf)?;

        if let (Some(topic), Some(message)) = (&self.will_topic, &self.will_message) {
            topic.encode(buf)?;
            message.encode(buf)?;
        }
        if let Some(username) = &self.username {
            username.encode(buf)?;
        }
        if let Some(password) = &self.password {
            password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        let flags = ConnectFlags::decode(ba)?;
        let keep_alive = U16Data::decode(ba)?;
        let client_id = StringData::decode(ba)?;

        let (will_topic, will_message) = if flags.will() {
            (Some(PubTopic::decode(ba)?), Some(BinaryData::decode(ba)?))
        } else {
            (None, None)
        };

        let username = if flags.has_username() {
            Some(StringData::decode(ba)?)
        } else {
            None
        };

        let password = if flags.has_password() {
            Some(BinaryData::decode(ba)?)
        } else {
            None
        };

        Ok(Self {
            protocol_level,
            flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
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
    fn encode_decode_round_trip() {
        let mut packet = ConnectPacket::new("test-client").unwrap();
        packet.set_keep_alive(30);
        packet.set_credentials("alice", Some(b"secret")).unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.client_id.as_ref(), "test-client");
        assert_eq!(decoded.keep_alive.value(), 30);
        assert!(decoded.flags.has_username());
        assert!(decoded.flags.has_password());
    }

    #[test]
    fn rejects_wrong_protocol_name() {
        let buf = [
            0x10, 0x09, 0x00, 0x03, b'M', b'Q', b'X', 0x04, 0x02, 0x00, 0x3c,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }
}
