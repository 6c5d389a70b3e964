// Copyright (c) 2020-2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::byte_array::ByteArray;
use crate::error::{DecodeError, EncodeError};
use crate::var_int::{VarInt, VarIntError};

/// Protocol name carried in every CONNECT packet; MQTT 3.1/3.1.1 only recognize `MQTT`.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Decode a value out of a byte buffer positioned at the start of its encoding.
pub trait DecodePacket: Sized {
    /// # Errors
    ///
    /// Returns error if `ba` does not hold a well-formed encoding of `Self`.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Encode a value onto the end of a byte buffer.
pub trait EncodePacket {
    /// # Errors
    ///
    /// Returns error if the value cannot be represented in the wire format, e.g. a
    /// string exceeding the 65535-byte length limit.
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Common behavior of every complete MQTT control packet.
pub trait Packet: fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Get total encoded byte length of this packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is too large to express as a Remaining Length.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Packet identifier used to correlate SUBSCRIBE/UNSUBSCRIBE/PUBLISH(QoS>0) with their acks.
///
/// Zero is reserved; it is used internally to mean "no identifier assigned" for QoS 0
/// PUBLISH packets, which carry none on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PacketId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(Self(ba.read_u16()?))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        v.push((self.0 >> 8) as u8);
        v.push((self.0 & 0xff) as u8);
        Ok(Self::bytes())
    }
}

/// Quality of service level requested for a PUBLISH or a subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QoS {
    /// Fire-and-forget; no acknowledgement, no persistence.
    #[default]
    AtMostOnce,

    /// Acknowledged by a single PUBACK; may be delivered more than once on resend.
    AtLeastOnce,

    /// Acknowledged by the PUBREC/PUBREL/PUBCOMP handshake; delivered exactly once.
    ExactOnce,
}

impl QoS {
    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// One of the fourteen MQTT 3.1.1 control packet types. PUBLISH additionally carries
/// the flags packed into the low nibble of the fixed header's first byte.
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
        let type_bits: u8 = match packet_type {
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

        let flags_bits: u8 = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = u8::from(retain);
                dup | qos | retain
            }
            // Bits 3,2,1,0 are reserved and MUST be 0,0,1,0 [MQTT-3.6.1-1], same for
            // SUBSCRIBE/UNSUBSCRIBE [MQTT-3.8.1-1]/[MQTT-3.10.1-1].
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

        match type_bits {
            1 if flag == 0 => Ok(Self::Connect),
            2 if flag == 0 => Ok(Self::ConnectAck),
            3 => {
                let dup = (flag & 0b0000_1000) != 0;
                let retain = (flag & 0b0000_0001) != 0;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
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
            1..=14 => Err(DecodeError::InvalidPacketFlags),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

/// Fixed header part of every MQTT control packet: one type/flags byte followed by the
/// variable-length Remaining Length.
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
    /// Returns error if `remaining_length` cannot be expressed as a Remaining Length.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = VarInt::from(remaining_length)?;
        Ok(Self {
            packet_type,
            remaining_length,
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
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);
        let len = self.remaining_length.encode(v)?;
        Ok(PacketType::bytes() + len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header_roundtrip() {
        let mut buf = Vec::new();
        let header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        assert_eq!(header.encode(&mut buf).unwrap(), 2);
        assert_eq!(buf, vec![0xd0, 0x00]);

        let mut ba = ByteArray::new(&buf);
        let decoded = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_type(), PacketType::PingResponse);
        assert_eq!(decoded.remaining_length(), 0);
    }

    #[test]
    fn test_publish_flags() {
        let buf = [0x3d];
        let packet_type = PacketType::try_from(buf[0]).unwrap();
        assert_eq!(
            packet_type,
            PacketType::Publish {
                dup: true,
                qos: QoS::ExactOnce,
                retain: true,
            }
        );
    }
}
