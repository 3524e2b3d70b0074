//! MySQL packet framing
//!
//! Every packet starts with a 4 byte header: a 3 byte little-endian payload
//! length followed by a sequence id. Payloads of `0xFFFFFF` bytes or more are
//! split across several physical packets; a payload whose length is an exact
//! multiple of `0xFFFFFF` is terminated by an empty packet.
//!
//! The sequence id starts at 0 for each command and increments (wrapping at
//! 256) with every packet written or read. A received id that does not match
//! the expected one is a protocol-fatal error.

use crate::common::{CanalError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Packet header size (3 bytes length + 1 byte sequence)
pub const PACKET_HEADER_SIZE: usize = 4;
/// Largest payload carried by one physical packet
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Initial read buffer reservation
const READ_CHUNK: usize = 8 * 1024;

/// Framed packet channel over any async byte stream.
///
/// Received bytes are buffered until a whole logical packet is available,
/// so [`PacketConn::read_packet`] can be cancelled (for example by a read
/// timeout) and called again without losing a partially received frame.
pub struct PacketConn<S> {
    stream: S,
    sequence: u8,
    read_buf: BytesMut,
    // payload of the frames of a split packet consumed so far
    partial: BytesMut,
}

impl<S> std::fmt::Debug for PacketConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConn")
            .field("sequence", &self.sequence)
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl<S> PacketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            partial: BytesMut::new(),
        }
    }

    /// Next expected sequence id
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new logical command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Read one logical packet, reassembling split payloads.
    ///
    /// Cancel safe: bytes already received stay buffered for the next call.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        loop {
            if let Some(packet) = self.take_packet()? {
                return Ok(packet);
            }
            self.read_buf.reserve(READ_CHUNK);
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(broken)?;
            if n == 0 {
                return Err(CanalError::connection_broken("connection closed by peer"));
            }
        }
    }

    /// Consume the complete frames in the read buffer. Returns the payload
    /// once the last frame of a logical packet has been consumed.
    fn take_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.read_buf.len() < PACKET_HEADER_SIZE {
                return Ok(None);
            }
            let header = &self.read_buf[..PACKET_HEADER_SIZE];
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let seq = header[3];
            if seq != self.sequence {
                return Err(CanalError::SequenceMismatch {
                    expected: self.sequence,
                    actual: seq,
                });
            }
            if self.read_buf.len() < PACKET_HEADER_SIZE + len {
                return Ok(None);
            }

            self.sequence = self.sequence.wrapping_add(1);
            self.read_buf.advance(PACKET_HEADER_SIZE);
            let frame = self.read_buf.split_to(len);
            trace!(len, seq, "read packet");

            if len < MAX_PAYLOAD_LEN {
                if self.partial.is_empty() {
                    return Ok(Some(frame.freeze()));
                }
                self.partial.unsplit(frame);
                return Ok(Some(self.partial.split().freeze()));
            }
            self.partial.unsplit(frame);
        }
    }

    /// Write one logical packet, splitting it when needed.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let frames = payload.len() / MAX_PAYLOAD_LEN + 1;
        let mut buf = BytesMut::with_capacity(payload.len() + frames * PACKET_HEADER_SIZE);

        let mut rest = payload;
        loop {
            let n = rest.len().min(MAX_PAYLOAD_LEN);
            buf.put_uint_le(n as u64, 3);
            buf.put_u8(self.sequence);
            buf.put_slice(&rest[..n]);
            self.sequence = self.sequence.wrapping_add(1);
            rest = &rest[n..];
            // a full frame is always followed by another, possibly empty, one
            if n < MAX_PAYLOAD_LEN {
                break;
            }
        }

        self.stream.write_all(&buf).await.map_err(broken)?;
        self.stream.flush().await.map_err(broken)?;
        Ok(())
    }

    /// Reset the sequence and write the first packet of a new command.
    pub async fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(payload).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(broken)
    }
}

fn broken(e: std::io::Error) -> CanalError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CanalError::connection_broken("connection closed by peer")
    } else {
        CanalError::connection_broken(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_round_trip_small_packet() {
        let (a, b) = duplex(1024);
        let mut client = PacketConn::new(a);
        let mut server = PacketConn::new(b);

        client.write_packet(b"\x03SELECT 1").await.unwrap();
        let got = server.read_packet().await.unwrap();
        assert_eq!(&got[..], b"\x03SELECT 1");
        assert_eq!(client.sequence(), 1);
        assert_eq!(server.sequence(), 1);

        server.write_packet(b"\x00\x00\x00").await.unwrap();
        let got = client.read_packet().await.unwrap();
        assert_eq!(&got[..], b"\x00\x00\x00");
        assert_eq!(client.sequence(), 2);
    }

    #[tokio::test]
    async fn test_header_layout() {
        let (a, mut b) = duplex(64);
        let mut client = PacketConn::new(a);
        client.write_packet(b"abc").await.unwrap();

        let mut raw = [0u8; 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_sequence_mismatch() {
        let (a, mut b) = duplex(64);
        let mut client = PacketConn::new(a);

        // sequence 5 while 0 is expected
        b.write_all(&[1, 0, 0, 5, 0xAA]).await.unwrap();
        let err = client.read_packet().await.unwrap_err();
        assert!(matches!(
            err,
            CanalError::SequenceMismatch {
                expected: 0,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn test_sequence_wraps() {
        let (a, b) = duplex(64 * 1024);
        let mut client = PacketConn::new(a);
        let mut server = PacketConn::new(b);

        for _ in 0..300 {
            client.write_packet(b"x").await.unwrap();
            server.read_packet().await.unwrap();
        }
        assert_eq!(client.sequence(), (300 % 256) as u8);
        assert_eq!(server.sequence(), client.sequence());

        client.reset_sequence();
        assert_eq!(client.sequence(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_frame() {
        let (a, mut b) = duplex(1024);
        let mut client = PacketConn::new(a);

        // header announcing 10 bytes, followed by only 3 of them
        b.write_all(&[10, 0, 0, 0, b'0', b'1', b'2']).await.unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), client.read_packet()).await;
        assert!(timed_out.is_err());

        b.write_all(b"3456789").await.unwrap();
        b.write_all(&[2, 0, 0, 1, b'o', b'k']).await.unwrap();

        let first = client.read_packet().await.unwrap();
        assert_eq!(&first[..], b"0123456789");
        let second = client.read_packet().await.unwrap();
        assert_eq!(&second[..], b"ok");
        assert_eq!(client.sequence(), 2);
    }

    #[tokio::test]
    async fn test_packets_in_one_read_are_split() {
        let (a, mut b) = duplex(1024);
        let mut client = PacketConn::new(a);

        b.write_all(&[1, 0, 0, 0, b'a', 0, 0, 0, 1, 2, 0, 0, 2, b'b', b'c'])
            .await
            .unwrap();
        assert_eq!(&client.read_packet().await.unwrap()[..], b"a");
        assert!(client.read_packet().await.unwrap().is_empty());
        assert_eq!(&client.read_packet().await.unwrap()[..], b"bc");
    }

    #[tokio::test]
    async fn test_eof_is_connection_broken() {
        let (a, b) = duplex(64);
        let mut client = PacketConn::new(a);
        drop(b);
        let err = client.read_packet().await.unwrap_err();
        assert!(matches!(err, CanalError::ConnectionBroken(_)));
    }

    #[tokio::test]
    async fn test_exact_multiple_of_max_is_terminated() {
        let (a, b) = duplex(1 << 20);
        let mut client = PacketConn::new(a);
        let mut server = PacketConn::new(b);

        let payload = vec![7u8; MAX_PAYLOAD_LEN];
        let (written, read) = tokio::join!(client.write_packet(&payload), server.read_packet());
        written.unwrap();
        let read = read.unwrap();

        assert_eq!(read.len(), MAX_PAYLOAD_LEN);
        // one full frame plus the empty terminator
        assert_eq!(client.sequence(), 2);
        assert_eq!(server.sequence(), 2);
    }

    #[tokio::test]
    async fn test_large_payload_split_and_reassembled() {
        let (a, b) = duplex(1 << 20);
        let mut client = PacketConn::new(a);
        let mut server = PacketConn::new(b);

        let payload: Vec<u8> = (0..MAX_PAYLOAD_LEN + 10).map(|i| (i % 251) as u8).collect();
        let (written, read) = tokio::join!(client.write_packet(&payload), server.read_packet());
        written.unwrap();
        let read = read.unwrap();

        assert_eq!(read.len(), payload.len());
        assert_eq!(&read[..], &payload[..]);
        assert_eq!(server.sequence(), 2);
    }
}
