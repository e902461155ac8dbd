//! Primitive MQTT 3.1.1 field encodings
//!
//! Strings and binary fields carry a 2-byte big-endian length prefix. The
//! remaining length of the fixed header is a 1-4 byte variable length integer.

use crate::error::{IotCoreError, Result};
use bytes::{Buf, BufMut};

/// Largest value the remaining length field can carry (268,435,455)
pub const REMAINING_LENGTH_MAX: u32 = 268_435_455;

/// Encodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the string contains a null character or is longer
/// than 65,535 bytes.
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(IotCoreError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    encode_binary(buf, string.as_bytes())
}

/// Decodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the buffer is short, the bytes are not UTF-8, or the
/// string contains a null character.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = decode_binary(buf)?;
    let string = String::from_utf8(bytes)
        .map_err(|e| IotCoreError::MalformedPacket(format!("Invalid UTF-8: {e}")))?;

    if string.contains('\0') {
        return Err(IotCoreError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }

    Ok(string)
}

/// Encodes a binary field with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the data is longer than 65,535 bytes.
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        IotCoreError::MalformedPacket(format!(
            "Field length {} exceeds maximum {}",
            data.len(),
            u16::MAX
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Decodes a binary field with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the buffer holds fewer bytes than the prefix announces.
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(IotCoreError::MalformedPacket(
            "Insufficient bytes for field length".to_string(),
        ));
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(IotCoreError::MalformedPacket(format!(
            "Insufficient bytes for field data: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Encodes the fixed header remaining length
///
/// # Errors
///
/// Returns an error if the value exceeds [`REMAINING_LENGTH_MAX`].
pub fn encode_remaining_length<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > REMAINING_LENGTH_MAX {
        return Err(IotCoreError::ProtocolError(format!(
            "Remaining length {value} exceeds maximum {REMAINING_LENGTH_MAX}"
        )));
    }

    let mut val = value;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if val == 0 {
            break;
        }
    }
    Ok(())
}

/// Decodes the fixed header remaining length
///
/// # Errors
///
/// Returns an error if the buffer runs out or more than 4 bytes are used.
pub fn decode_remaining_length<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(IotCoreError::MalformedPacket(
                "Insufficient bytes for remaining length".to_string(),
            ));
        }

        let byte = buf.get_u8();
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }

    Err(IotCoreError::MalformedPacket(
        "Remaining length exceeds 4 bytes".to_string(),
    ))
}

/// Number of bytes [`encode_remaining_length`] writes for `value`
#[must_use]
pub fn remaining_length_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_remaining_length_boundaries() {
        for (value, expected) in [
            (0u32, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (16_384, vec![0x80, 0x80, 0x01]),
            (REMAINING_LENGTH_MAX, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_remaining_length(&mut buf, value).unwrap();
            assert_eq!(&buf[..], &expected[..], "value {value}");
            assert_eq!(remaining_length_len(value), expected.len());
        }
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_remaining_length(&mut buf, REMAINING_LENGTH_MAX + 1).is_err());
    }

    #[test]
    fn test_remaining_length_five_bytes_rejected() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(matches!(
            decode_remaining_length(&mut buf),
            Err(IotCoreError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_string_with_null_rejected() {
        let mut buf = BytesMut::new();
        assert!(encode_string(&mut buf, "dev\0ice").is_err());
    }

    #[test]
    fn test_decode_string_truncated() {
        let mut buf = BytesMut::from(&[0x00, 0x05, b'a', b'b'][..]);
        assert!(decode_string(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn prop_remaining_length_decodes_what_it_encodes(value in 0u32..=REMAINING_LENGTH_MAX) {
            let mut buf = BytesMut::new();
            encode_remaining_length(&mut buf, value).unwrap();
            prop_assert_eq!(buf.len(), remaining_length_len(value));
            prop_assert_eq!(decode_remaining_length(&mut buf).unwrap(), value);
        }
    }
}
