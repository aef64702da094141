// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::utils::validate_two_bytes_data;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// A length-prefixed byte string, used for the will message and password
/// fields of CONNECT.
///
/// Binary Data is represented by a Two Byte Integer length followed by that
/// many raw bytes, limiting it to 65,535 bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinaryData(Vec<u8>);

impl BinaryData {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// # Errors
    ///
    /// Returns error if `data` is too long to fit a Two Byte Integer length prefix.
    pub fn from_slice(data: &[u8]) -> Result<Self, EncodeError> {
        validate_two_bytes_data(data)?;
        Ok(Self(data.to_vec()))
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<[u8]> for BinaryData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DecodePacket for BinaryData {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let data = ba.read_bytes(len as usize)?;
        Ok(Self(data.to_vec()))
    }
}

impl EncodePacket for BinaryData {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(&self.0)?;
        Ok(self.bytes())
    }
}
