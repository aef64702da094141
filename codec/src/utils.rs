// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Generate a random alphanumeric string, used to fabricate a client id when
/// the caller does not supply one.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Byte slice is not well-formed UTF-8.
    NotUtf8,

    /// Contains the NUL character, which is disallowed in MQTT strings [MQTT-1.5.4-2].
    ContainsNul,

    /// Longer than the 65,535-byte limit a Two Byte Integer length can address.
    TooLong,
}

/// Decode `bytes` as a UTF-8 string, rejecting embedded NUL characters.
///
/// # Errors
///
/// Returns error if `bytes` is not well-formed UTF-8 or contains `U+0000`.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_e| StringError::NotUtf8)?;
    if s.contains('\u{0}') {
        return Err(StringError::ContainsNul);
    }
    Ok(s.to_string())
}

/// Validate a string destined for a length-prefixed MQTT string field.
///
/// # Errors
///
/// Returns error if `s` contains a NUL character or is too long to fit in a
/// Two Byte Integer length prefix.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.contains('\u{0}') {
        return Err(StringError::ContainsNul);
    }
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooLong);
    }
    Ok(())
}

/// Validate a byte slice destined for a length-prefixed MQTT binary field.
///
/// # Errors
///
/// Returns error if the slice is too long to fit in a Two Byte Integer length prefix.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), StringError> {
    if data.len() > u16::MAX as usize {
        return Err(StringError::TooLong);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    TooLong,
}

/// Validate a client identifier.
///
/// The MQTT 3.1.1 spec requires Servers to accept client ids of 1-23 bytes of
/// UTF-8, but allows longer ids at the Server's discretion; since this crate
/// only ever plays the Client role there is nothing to reject locally beyond
/// the hard Two Byte Integer length limit.
///
/// # Errors
///
/// Returns error if `client_id` cannot fit in a length-prefixed string field.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > u16::MAX as usize {
        return Err(ClientIdError::TooLong);
    }
    Ok(())
}

/// Clamp a requested keep-alive interval, in seconds, to what the wire format
/// can represent.
#[must_use]
pub const fn validate_keep_alive(keep_alive: u16) -> u16 {
    keep_alive
}
