use crate::encoding::{decode_string, encode_string};
use crate::error::{IotCoreError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::QoS;
use bytes::{Buf, BufMut};

/// MQTT 3.1.1 SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push((filter.into(), qos));
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn flags(&self) -> u8 {
        0x02
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.filters.is_empty() {
            return Err(IotCoreError::ProtocolError(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for (filter, qos) in &self.filters {
            encode_string(buf, filter)?;
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(IotCoreError::MalformedPacket(
                "SUBSCRIBE missing packet identifier".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(IotCoreError::MalformedPacket(
                    "Missing requested QoS".to_string(),
                ));
            }
            let requested = buf.get_u8();
            if requested & 0xFC != 0 {
                return Err(IotCoreError::MalformedPacket(
                    "Reserved bits set in requested QoS".to_string(),
                ));
            }
            filters.push((filter, QoS::try_from(requested)?));
        }

        if filters.is_empty() {
            return Err(IotCoreError::ProtocolError(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }

        Ok(Self { packet_id, filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_subscribe_encode_decode() {
        let packet = SubscribePacket::new(3).add_filter("/devices/d1/events", QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x82);

        let header = FixedHeader::decode(&mut buf).unwrap();
        let decoded = SubscribePacket::decode_body(&mut buf, &header).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_subscribe_empty_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x01][..]);
        let header = FixedHeader::new(PacketType::Subscribe, 0x02, 2);
        assert!(SubscribePacket::decode_body(&mut buf, &header).is_err());
    }
}
