// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The transport and framing layer: owns the socket (plain or TLS) and turns
//! its byte stream into whole [`IncomingPacket`]s.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use mqtt_codec::v3::{
    ConnectAckPacket, PingRequestPacket, PingResponsePacket, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
    SubscribeAckPacket, UnsubscribeAckPacket,
};
use mqtt_codec::{ByteArray, DecodeError, DecodePacket, FixedHeader, PacketType};

use crate::error::Error;

/// A fully-framed inbound packet, decoded from the wire.
#[derive(Debug)]
pub(crate) enum IncomingPacket {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingResponse(PingResponsePacket),
}

/// Either a plain TCP socket or a TLS session over one, selected once at
/// connect time by whether `ConnectOptions` carries a [`crate::options::TlsConfig`].
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// An in-memory loopback standing in for the socket, the same technique
    /// the retrieval pack's other example clients use to exercise a
    /// connection state machine without a real network, per spec.md §6's
    /// transport contract (a full-duplex byte stream, nothing more).
    #[cfg(test)]
    Test(tokio::io::DuplexStream),
}

impl Transport {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
            #[cfg(test)]
            Self::Test(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(buf).await,
            Self::Tls(stream) => stream.write_all(buf).await,
            #[cfg(test)]
            Self::Test(stream) => stream.write_all(buf).await,
        }
    }
}

/// Buffers partial reads and hands complete packets to the connection loop.
///
/// `pending` holds bytes read from the transport but not yet decoded into a
/// full frame; a frame whose Remaining Length exceeds what has arrived so far
/// is left in place for the next read to complete, mirroring spec.md §4.E's
/// "wait for more bytes" framing rule.
pub(crate) struct ChannelAdapter {
    transport: Transport,
    pending: Vec<u8>,
    read_buf: [u8; 4096],
}

impl ChannelAdapter {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport,
            pending: Vec::new(),
            read_buf: [0u8; 4096],
        }
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.transport.write_all(bytes).await?;
        Ok(())
    }

    /// Reads one chunk from the transport and returns every whole packet it
    /// completed, in wire order. An empty `Ok` vector with `n == 0` bytes
    /// read means the peer closed the transport.
    pub(crate) async fn read_packets(&mut self) -> Result<Vec<IncomingPacket>, Error> {
        let n = self.transport.read(&mut self.read_buf).await?;
        if n == 0 {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transport closed",
            )));
        }
        self.pending.extend_from_slice(&self.read_buf[..n]);
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Result<Vec<IncomingPacket>, Error> {
        let mut packets = Vec::new();
        loop {
            let mut probe = ByteArray::new(&self.pending);
            let header = match FixedHeader::decode(&mut probe) {
                Ok(header) => header,
                Err(DecodeError::OutOfRange) => break,
                Err(e) => return Err(Error::from(e)),
            };
            let frame_len = header.bytes() + header.remaining_length();
            if self.pending.len() < frame_len {
                break;
            }

            let frame = &self.pending[..frame_len];
            let packet = Self::decode_one(header.packet_type(), frame)?;
            packets.push(packet);
            self.pending.drain(..frame_len);
        }
        Ok(packets)
    }

    fn decode_one(packet_type: PacketType, frame: &[u8]) -> Result<IncomingPacket, Error> {
        let mut ba = ByteArray::new(frame);
        Ok(match packet_type {
            PacketType::ConnectAck => IncomingPacket::ConnectAck(ConnectAckPacket::decode(&mut ba)?),
            PacketType::Publish { .. } => IncomingPacket::Publish(PublishPacket::decode(&mut ba)?),
            PacketType::PublishAck => IncomingPacket::PublishAck(PublishAckPacket::decode(&mut ba)?),
            PacketType::PublishReceived => {
                IncomingPacket::PublishReceived(PublishReceivedPacket::decode(&mut ba)?)
            }
            PacketType::PublishRelease => {
                IncomingPacket::PublishRelease(PublishReleasePacket::decode(&mut ba)?)
            }
            PacketType::PublishComplete => {
                IncomingPacket::PublishComplete(PublishCompletePacket::decode(&mut ba)?)
            }
            PacketType::SubscribeAck => IncomingPacket::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?),
            PacketType::UnsubscribeAck => {
                IncomingPacket::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?)
            }
            PacketType::PingResponse => IncomingPacket::PingResponse(PingResponsePacket::decode(&mut ba)?),
            PacketType::Connect
            | PacketType::Subscribe
            | PacketType::Unsubscribe
            | PacketType::PingRequest
            | PacketType::Disconnect => {
                return Err(Error::new(
                    crate::error::ErrorKind::ProtocolError,
                    format!("unexpected client-to-server packet type from peer: {packet_type:?}"),
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_codec::{EncodePacket, QoS};

    fn push_frame(pending: &mut Vec<u8>, packet: &impl EncodePacket) {
        packet.encode(pending).unwrap();
    }

    #[test]
    fn decode_one_round_trips_connect_ack() {
        // CONNACK has no client-side encoder since the Client never sends one;
        // build the wire bytes by hand: type/flags, remaining length 2,
        // ack flags (session_present=1), return code Accepted.
        let bytes = vec![0x20, 0x02, 0x01, 0x00];

        let mut probe = ByteArray::new(&bytes);
        let header = FixedHeader::decode(&mut probe).unwrap();
        let decoded = ChannelAdapter::decode_one(header.packet_type(), &bytes).unwrap();
        match decoded {
            IncomingPacket::ConnectAck(ack) => assert!(ack.session_present()),
            other => panic!("expected ConnectAck, got {other:?}"),
        }
    }

    #[test]
    fn decode_one_round_trips_publish() {
        let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"payload").unwrap();
        let mut bytes = Vec::new();
        push_frame(&mut bytes, &publish);

        let mut probe = ByteArray::new(&bytes);
        let header = FixedHeader::decode(&mut probe).unwrap();
        let decoded = ChannelAdapter::decode_one(header.packet_type(), &bytes).unwrap();
        match decoded {
            IncomingPacket::Publish(p) => assert_eq!(p.topic(), "a/b"),
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn ping_request_from_peer_is_a_protocol_error() {
        let request = PingRequestPacket::new();
        let mut bytes = Vec::new();
        push_frame(&mut bytes, &request);

        let mut probe = ByteArray::new(&bytes);
        let header = FixedHeader::decode(&mut probe).unwrap();
        let result = ChannelAdapter::decode_one(header.packet_type(), &bytes);
        assert!(result.is_err());
    }
}
