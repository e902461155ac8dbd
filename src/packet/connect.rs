use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{IotCoreError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use bytes::{Buf, BufMut};
use std::fmt;

const PROTOCOL_NAME_V311: &str = "MQTT";
const PROTOCOL_NAME_V31: &str = "MQIsdp";

/// Protocol level byte for MQTT 3.1.1
pub const PROTOCOL_LEVEL_V311: u8 = 4;
/// Protocol level byte for MQTT 3.1
pub const PROTOCOL_LEVEL_V31: u8 = 3;

mod flags {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const WILL: u8 = 0x04;
    pub const WILL_QOS_MASK: u8 = 0x18;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const PASSWORD: u8 = 0x40;
    pub const USERNAME: u8 = 0x80;
    pub const RESERVED: u8 = 0x01;
}

/// MQTT 3.1.1 CONNECT packet
///
/// The password field carries the device credential, so `Debug` redacts it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Will topic, if the client registered one. The will payload is skipped.
    pub will_topic: Option<String>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: PROTOCOL_LEVEL_V311,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            username: None,
            password: None,
            will_topic: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: Vec<u8>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Password field decoded as UTF-8, which is how bearer tokens travel
    #[must_use]
    pub fn password_str(&self) -> Option<&str> {
        self.password
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }

    fn connect_flags(&self) -> u8 {
        let mut value = 0u8;
        if self.clean_session {
            value |= flags::CLEAN_SESSION;
        }
        if self.username.is_some() {
            value |= flags::USERNAME;
        }
        if self.password.is_some() {
            value |= flags::PASSWORD;
        }
        value
    }

    fn protocol_name(&self) -> &'static str {
        if self.protocol_level == PROTOCOL_LEVEL_V31 {
            PROTOCOL_NAME_V31
        } else {
            PROTOCOL_NAME_V311
        }
    }
}

impl fmt::Debug for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectPacket")
            .field("protocol_level", &self.protocol_level)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("will_topic", &self.will_topic)
            .finish()
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.password.is_some() && self.username.is_none() {
            return Err(IotCoreError::MalformedPacket(
                "Password without username is not allowed".to_string(),
            ));
        }

        encode_string(buf, self.protocol_name())?;
        buf.put_u8(self.protocol_level);
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        encode_string(buf, &self.client_id)?;
        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            encode_binary(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _fixed_header: &FixedHeader) -> Result<Self> {
        let protocol_name = decode_string(buf)?;
        if protocol_name != PROTOCOL_NAME_V311 && protocol_name != PROTOCOL_NAME_V31 {
            return Err(IotCoreError::ProtocolError(format!(
                "Invalid protocol name: {protocol_name}"
            )));
        }

        if !buf.has_remaining() {
            return Err(IotCoreError::MalformedPacket(
                "Missing protocol level".to_string(),
            ));
        }
        let protocol_level = buf.get_u8();
        if protocol_level != PROTOCOL_LEVEL_V311 && protocol_level != PROTOCOL_LEVEL_V31 {
            // Later levels change the body layout, so stop here
            return Err(IotCoreError::UnsupportedProtocolVersion(protocol_level));
        }

        if buf.remaining() < 3 {
            return Err(IotCoreError::MalformedPacket(
                "Missing connect flags or keep alive".to_string(),
            ));
        }
        let connect_flags = buf.get_u8();
        if connect_flags & flags::RESERVED != 0 {
            return Err(IotCoreError::MalformedPacket(
                "Reserved flag bit must be 0".to_string(),
            ));
        }
        let keep_alive = buf.get_u16();

        let client_id = decode_string(buf)?;

        let will_topic = if connect_flags & flags::WILL != 0 {
            let topic = decode_string(buf)?;
            let _payload = decode_binary(buf)?;
            Some(topic)
        } else {
            if connect_flags & (flags::WILL_QOS_MASK | flags::WILL_RETAIN) != 0 {
                return Err(IotCoreError::MalformedPacket(
                    "Will QoS or retain set without will flag".to_string(),
                ));
            }
            None
        };

        let username = if connect_flags & flags::USERNAME != 0 {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if connect_flags & flags::PASSWORD != 0 {
            Some(decode_binary(buf)?)
        } else {
            None
        };

        if password.is_some() && username.is_none() {
            return Err(IotCoreError::MalformedPacket(
                "Password without username is not allowed".to_string(),
            ));
        }

        Ok(Self {
            protocol_level,
            clean_session: connect_flags & flags::CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            username,
            password,
            will_topic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn decode(buf: &mut BytesMut) -> Result<ConnectPacket> {
        let header = FixedHeader::decode(buf)?;
        ConnectPacket::decode_body(buf, &header)
    }

    #[test]
    fn test_connect_encode_decode_with_credentials() {
        let packet = ConnectPacket::new("projects/p1/locations/us-central1/registries/r1/devices/d1")
            .with_credentials("unused", b"header.claims.sig".to_vec());

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        let decoded = decode(&mut buf).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.protocol_level, PROTOCOL_LEVEL_V311);
        assert_eq!(decoded.password_str(), Some("header.claims.sig"));
    }

    #[test]
    fn test_connect_wire_layout() {
        let packet = ConnectPacket::new("d").with_credentials("u", b"p".to_vec());
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();

        assert_eq!(
            &buf[..],
            &[
                0x10, 0x13, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xC2, 0x00, 0x3C, // variable header
                0x00, 0x01, b'd', 0x00, 0x01, b'u', 0x00, 0x01, b'p',
            ]
        );
    }

    #[test]
    fn test_connect_debug_redacts_password() {
        let packet = ConnectPacket::new("d").with_credentials("unused", b"secret-token".to_vec());
        let debug = format!("{packet:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_connect_v5_level_reported() {
        let mut buf = BytesMut::from(
            &[0x10, 0x0A, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C][..],
        );
        assert!(matches!(
            decode(&mut buf),
            Err(IotCoreError::UnsupportedProtocolVersion(5))
        ));
    }

    #[test]
    fn test_connect_invalid_protocol_name() {
        let mut buf = BytesMut::from(
            &[0x10, 0x0A, 0x00, 0x04, b'M', b'Q', b'X', b'X', 0x04, 0x02, 0x00, 0x3C][..],
        );
        assert!(matches!(
            decode(&mut buf),
            Err(IotCoreError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_connect_password_without_username() {
        let mut packet = ConnectPacket::new("d");
        packet.password = Some(b"p".to_vec());
        let mut buf = BytesMut::new();
        assert!(packet.encode(&mut buf).is_err());
    }
}
