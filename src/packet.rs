pub mod connack;
pub mod connect;
pub mod puback;
pub mod publish;
pub mod suback;
pub mod subscribe;

use crate::encoding::{decode_remaining_length, encode_remaining_length, remaining_length_len};
use crate::error::{IotCoreError, Result};
use bytes::{Buf, BufMut};

/// MQTT 3.1.1 control packet types handled by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Converts the high nibble of the first header byte to a `PacketType`
    ///
    /// QoS 2 flow packets and UNSUBSCRIBE are not supported and map to `None`.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if the remaining length is too large
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8((u8::from(self.packet_type) << 4) | (self.flags & 0x0F));
        encode_remaining_length(buf, self.remaining_length)
    }

    /// Decodes a fixed header from the buffer
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty, the packet type is unknown or
    /// the remaining length is malformed
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(IotCoreError::MalformedPacket(
                "No data for fixed header".to_string(),
            ));
        }

        let byte1 = buf.get_u8();
        let packet_type_val = byte1 >> 4;
        let flags = byte1 & 0x0F;

        let packet_type = PacketType::from_u8(packet_type_val)
            .ok_or(IotCoreError::InvalidPacketType(packet_type_val))?;
        let remaining_length = decode_remaining_length(buf)?;

        let header = Self {
            packet_type,
            flags,
            remaining_length,
        };
        if !header.validate_flags() {
            return Err(IotCoreError::MalformedPacket(format!(
                "Invalid flags {flags:#04x} for {packet_type:?}"
            )));
        }
        Ok(header)
    }

    /// Validates the flags for the packet type
    #[must_use]
    pub fn validate_flags(&self) -> bool {
        match self.packet_type {
            PacketType::Publish => true,
            PacketType::Subscribe => self.flags == 0x02,
            _ => self.flags == 0,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + remaining_length_len(self.remaining_length)
    }
}

/// Every packet the client and broker exchange
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Box<connect::ConnectPacket>),
    ConnAck(connack::ConnAckPacket),
    Publish(publish::PublishPacket),
    PubAck(puback::PubAckPacket),
    Subscribe(subscribe::SubscribePacket),
    SubAck(suback::SubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Decode a packet body based on the fixed header
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    pub fn decode_from_body<B: Buf>(fixed_header: &FixedHeader, buf: &mut B) -> Result<Self> {
        match fixed_header.packet_type {
            PacketType::Connect => {
                let packet = connect::ConnectPacket::decode_body(buf, fixed_header)?;
                Ok(Packet::Connect(Box::new(packet)))
            }
            PacketType::ConnAck => Ok(Packet::ConnAck(connack::ConnAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Publish => Ok(Packet::Publish(publish::PublishPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PubAck => Ok(Packet::PubAck(puback::PubAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::Subscribe => Ok(Packet::Subscribe(
                subscribe::SubscribePacket::decode_body(buf, fixed_header)?,
            )),
            PacketType::SubAck => Ok(Packet::SubAck(suback::SubAckPacket::decode_body(
                buf,
                fixed_header,
            )?)),
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
        }
    }

    /// Encodes the complete packet, fixed header included
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be encoded
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf),
            Packet::ConnAck(p) => p.encode(buf),
            Packet::Publish(p) => p.encode(buf),
            Packet::PubAck(p) => p.encode(buf),
            Packet::Subscribe(p) => p.encode(buf),
            Packet::SubAck(p) => p.encode(buf),
            Packet::PingReq => FixedHeader::new(PacketType::PingReq, 0, 0).encode(buf),
            Packet::PingResp => FixedHeader::new(PacketType::PingResp, 0, 0).encode(buf),
            Packet::Disconnect => FixedHeader::new(PacketType::Disconnect, 0, 0).encode(buf),
        }
    }
}

/// Trait for MQTT packets with a variable header and payload
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    /// Fixed header flags
    fn flags(&self) -> u8 {
        0
    }

    /// Encodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// Decodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    fn decode_body<B: Buf>(buf: &mut B, fixed_header: &FixedHeader) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut body = Vec::new();
        self.encode_body(&mut body)?;

        let remaining_length = u32::try_from(body.len()).map_err(|_| {
            IotCoreError::ProtocolError(format!("Packet body of {} bytes too large", body.len()))
        })?;
        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}
