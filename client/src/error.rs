// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

/// Broad category of failure, used by callers that want to branch on the
/// kind of problem without matching every individual cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Failed to encode an outgoing packet.
    Encode,

    /// Failed to decode an incoming packet; the connection must be dropped.
    Decode,

    /// Underlying transport I/O failed.
    Io,

    /// The transport closed the connection, gracefully or otherwise.
    TransportClosed,

    /// All 65,535 packet ids are currently in flight.
    NoPacketIds,

    /// An operation was requested while the connection was not in a state
    /// that permits it (e.g. publish before CONNECT completes).
    WrongState,

    /// The Server rejected the connection attempt (non-zero CONNACK code).
    ConnectRejected,

    /// A topic name or filter failed validation.
    InvalidTopic,

    /// A request's retries were exhausted without receiving an acknowledgement.
    Timeout,

    /// No PINGRESP arrived within `keep_alive + request_timeout` of the last one.
    KeepaliveTimeout,

    /// A well-formed packet was semantically illegal given the connection's
    /// current state (e.g. a second CONNACK while already CONNECTED).
    ProtocolError,

    /// The connection closed (locally or remotely) while this request was
    /// still outstanding.
    Disconnected,
}

/// The error type returned by every fallible operation on [`crate::Client`].
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<mqtt_codec::EncodeError> for Error {
    fn from(err: mqtt_codec::EncodeError) -> Self {
        Self::new(ErrorKind::Encode, format!("{err:?}"))
    }
}

impl From<mqtt_codec::DecodeError> for Error {
    fn from(err: mqtt_codec::DecodeError) -> Self {
        Self::new(ErrorKind::Decode, format!("{err:?}"))
    }
}
