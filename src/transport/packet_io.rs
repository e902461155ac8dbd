//! Packet I/O over any async byte stream
//!
//! Direct async methods, no event loop. Implemented for every
//! `AsyncRead`/`AsyncWrite`, so the same code serves TCP, TLS and the
//! split halves of either.

use crate::error::{IotCoreError, Result};
use crate::packet::{FixedHeader, Packet};
use bytes::{BufMut, BytesMut};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest remaining length accepted from a peer
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

pub trait PacketReader {
    /// Reads one complete MQTT packet
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the peer closes the stream and
    /// `MalformedPacket` if the bytes do not form a valid packet.
    fn read_packet(&mut self) -> impl Future<Output = Result<Packet>> + Send + '_;
}

pub trait PacketWriter {
    /// Encodes and writes one MQTT packet, then flushes
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    fn write_packet(&mut self, packet: Packet) -> impl Future<Output = Result<()>> + Send + '_;
}

impl<T: AsyncRead + Unpin + Send> PacketReader for T {
    async fn read_packet(&mut self) -> Result<Packet> {
        let mut header_buf = BytesMut::with_capacity(5);

        let mut byte = [0u8; 1];
        if self.read(&mut byte).await? == 0 {
            return Err(IotCoreError::ConnectionError("Connection closed".to_string()));
        }
        header_buf.put_u8(byte[0]);

        // Remaining length, 1-4 bytes with a continuation bit
        loop {
            if self.read(&mut byte).await? == 0 {
                return Err(IotCoreError::ConnectionError("Connection closed".to_string()));
            }
            header_buf.put_u8(byte[0]);

            if byte[0] & 0x80 == 0 {
                break;
            }
            if header_buf.len() > 4 {
                return Err(IotCoreError::MalformedPacket(
                    "Invalid remaining length encoding".to_string(),
                ));
            }
        }

        let mut header_bytes = header_buf.freeze();
        let fixed_header = FixedHeader::decode(&mut header_bytes)?;

        if fixed_header.remaining_length > MAX_PACKET_SIZE {
            return Err(IotCoreError::MalformedPacket(format!(
                "Packet of {} bytes exceeds maximum {MAX_PACKET_SIZE}",
                fixed_header.remaining_length
            )));
        }

        let mut body = vec![0u8; fixed_header.remaining_length as usize];
        self.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IotCoreError::ConnectionError("Connection closed while reading packet".to_string())
            } else {
                IotCoreError::from(e)
            }
        })?;

        let mut body_buf = BytesMut::from(&body[..]);
        let packet = Packet::decode_from_body(&fixed_header, &mut body_buf)?;
        tracing::trace!(packet_type = ?fixed_header.packet_type, len = body.len(), "Read packet");
        Ok(packet)
    }
}

impl<T: AsyncWrite + Unpin + Send> PacketWriter for T {
    async fn write_packet(&mut self, packet: Packet) -> Result<()> {
        let mut buf = BytesMut::with_capacity(128);
        packet.encode(&mut buf)?;
        self.write_all(&buf).await?;
        self.flush().await?;
        Ok(())
    }
}
