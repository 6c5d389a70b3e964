// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{
    ByteArray, ConnectAckPacket, DecodeError, DecodePacket, FixedHeader, PacketType,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, UnsubscribeAckPacket,
};
use tokio::sync::mpsc;

use crate::transport::TransportReader;

/// One fully-decoded packet the broker is allowed to send to a client.
#[derive(Debug)]
pub(crate) enum DecodedPacket {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingResponse(PingResponsePacket),
    /// A syntactically valid packet type the broker must never send a client
    /// (CONNECT/SUBSCRIBE/UNSUBSCRIBE/PINGREQ/DISCONNECT).
    Unexpected(PacketType),
}

/// Events delivered from `IncomingPump` to `LogicCore`.
pub(crate) enum InboundEvent {
    Packet(DecodedPacket),
    /// Read/decode failure or EOF: fatal, the connection must be torn down.
    Fatal(String),
}

/// Attempts to decode exactly one control packet from the front of `buf`. Returns
/// `Ok(None)` when more bytes are needed, `Ok(Some((packet, consumed)))` on success.
/// A `FixedHeader` decode failure with anything other than `OutOfRange` is a genuine
/// protocol error, not a buffering shortage.
pub(crate) fn decode_one(buf: &[u8]) -> Result<Option<(DecodedPacket, usize)>, DecodeError> {
    let mut peek = ByteArray::new(buf);
    let fixed_header = match FixedHeader::decode(&mut peek) {
        Ok(header) => header,
        Err(DecodeError::OutOfRange) => return Ok(None),
        Err(err) => return Err(err),
    };
    let total_len = fixed_header.bytes() + fixed_header.remaining_length();
    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_buf = &buf[..total_len];
    let mut ba = ByteArray::new(packet_buf);
    let packet = match fixed_header.packet_type() {
        PacketType::ConnectAck => DecodedPacket::ConnectAck(ConnectAckPacket::decode(&mut ba)?),
        PacketType::Publish { .. } => DecodedPacket::Publish(PublishPacket::decode(&mut ba)?),
        PacketType::PublishAck => DecodedPacket::PublishAck(PublishAckPacket::decode(&mut ba)?),
        PacketType::PublishReceived => {
            DecodedPacket::PublishReceived(PublishReceivedPacket::decode(&mut ba)?)
        }
        PacketType::PublishRelease => {
            DecodedPacket::PublishRelease(PublishReleasePacket::decode(&mut ba)?)
        }
        PacketType::PublishComplete => {
            DecodedPacket::PublishComplete(PublishCompletePacket::decode(&mut ba)?)
        }
        PacketType::SubscribeAck => {
            DecodedPacket::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?)
        }
        PacketType::UnsubscribeAck => {
            DecodedPacket::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?)
        }
        PacketType::PingResponse => {
            DecodedPacket::PingResponse(PingResponsePacket::decode(&mut ba)?)
        }
        other => DecodedPacket::Unexpected(other),
    };
    Ok(Some((packet, total_len)))
}

/// Owns the read half of the transport. Buffers partial reads across multiple
/// `read_buf` calls until a full packet is available, then hands it to `LogicCore`.
pub(crate) struct IncomingPump {
    reader: TransportReader,
    to_logic: mpsc::UnboundedSender<InboundEvent>,
    last_inbound_activity: crate::activity::ActivityClock,
}

impl IncomingPump {
    pub(crate) fn new(
        reader: TransportReader,
        to_logic: mpsc::UnboundedSender<InboundEvent>,
        last_inbound_activity: crate::activity::ActivityClock,
    ) -> Self {
        IncomingPump {
            reader,
            to_logic,
            last_inbound_activity,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = Vec::with_capacity(4096);
        loop {
            match self.reader.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = self
                        .to_logic
                        .send(InboundEvent::Fatal("connection closed by peer".to_string()));
                    return;
                }
                Ok(_n) => {
                    self.last_inbound_activity.touch();
                    loop {
                        match decode_one(&buf) {
                            Ok(Some((packet, consumed))) => {
                                buf.drain(..consumed);
                                if self.to_logic.send(InboundEvent::Packet(packet)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                let _ = self
                                    .to_logic
                                    .send(InboundEvent::Fatal(format!("decode error: {err}")));
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    let _ = self
                        .to_logic
                        .send(InboundEvent::Fatal(format!("read error: {err}")));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{EncodePacket, PingResponsePacket as Ping};

    #[test]
    fn decode_one_needs_more_data() {
        let buf = [0b1101_0000u8];
        assert!(decode_one(&buf).unwrap().is_none());
    }

    #[test]
    fn decode_one_returns_full_packet() {
        let mut buf = Vec::new();
        Ping::new().encode(&mut buf).unwrap();
        let (packet, consumed) = decode_one(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert!(matches!(packet, DecodedPacket::PingResponse(_)));
    }

    #[test]
    fn decode_one_reports_partial_body_as_need_more() {
        let mut buf = Vec::new();
        Ping::new().encode(&mut buf).unwrap();
        buf.push(0); // trailing garbage byte belonging to a following packet
        let (_packet, consumed) = decode_one(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len() - 1);
    }
}
