// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::io::Write;

use bytes::BytesMut;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketId, PacketType, PubTopic, QoS, VarIntError,
};

/// Publish packet is used to transport application messages from the Client to the
/// Server, or from the Server to the Client.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    /// If the DUP flag is set to 0, it indicates that this is the first attempt
    /// to send this packet. If set to 1, it indicates this might be a re-delivery
    /// of an earlier attempt.
    ///
    /// The DUP flag MUST be set to 0 for all `QoS` 0 messages [MQTT-3.3.1-2].
    dup: bool,

    qos: QoS,

    /// If set, the Server must store the message and deliver it to future subscribers.
    retain: bool,

    topic: PubTopic,

    /// Only present for `QoS` 1 and `QoS` 2 packets.
    packet_id: PacketId,

    msg: BytesMut,
}

impl PublishPacket {
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: PacketId::new(0),
            msg: BytesMut::from(msg),
        })
    }

    pub fn append(&mut self, buf: &[u8]) -> &mut Self {
        self.msg.extend_from_slice(buf);
        self
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    pub fn set_dup(&mut self, dup: bool) -> &mut Self {
        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if self.qos != QoS::AtMostOnce {
            self.dup = dup;
        }
        self
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        if qos == QoS::AtMostOnce {
            self.packet_id = PacketId::new(0);
        }
        self
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

    pub fn set_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        self.topic = PubTopic::new(topic)?;
        Ok(self)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.topic.bytes() + self.msg.len();
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
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let topic = PubTopic::decode(ba)?;
        log::info!("topic: {:?}", &topic);

        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            // SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0) Control Packets
            // MUST contain a non-zero 16-bit Packet Identifier [MQTT-2.3.1-1].
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        let consumed = topic.bytes() + if qos == QoS::AtMostOnce { 0 } else { PacketId::bytes() };
        let msg_len = fixed_header
            .remaining_length()
            .checked_sub(consumed)
            .ok_or(DecodeError::InvalidRemainingLength)?;
        let msg = ba.read_bytes(msg_len)?;

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg: BytesMut::from(msg),
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        self.topic.encode(v)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(v)?;
        }

        v.write_all(&self.msg)?;

        Ok(v.len() - old_len)
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
    use super::{EncodePacket, PublishPacket};
    use crate::QoS;

    #[test]
    fn test_encode_qos0() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hello").unwrap();
        let mut buf = Vec::new();
        assert!(packet.encode(&mut buf).is_ok());
        assert!(!buf.is_empty());
    }
}
