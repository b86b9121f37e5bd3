//! Streaming JSON decoder for the A⇄B control plane.
//!
//! The wire format is a bare concatenation of JSON-object encodings of
//! [`Packet`] with no framing beyond what the JSON parser itself consumes —
//! decoding must therefore be incremental: feed bytes as they arrive and
//! yield complete `Packet`s as soon as a full JSON value has been seen.

use std::collections::VecDeque;
use std::io;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{TunnelError, TunnelResult};
use crate::packet::Packet;

/// Accumulates raw bytes and yields complete [`Packet`]s as they become
/// decodable. Does not itself perform I/O — see [`JsonStream`] for the
/// socket-attached wrapper.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buf: Vec<u8>,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes, returning every `Packet` that became complete.
    pub fn feed(&mut self, data: &[u8]) -> TunnelResult<Vec<Packet>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            // Skip a quirk of JSON streaming: leading whitespace between
            // objects is valid and serde_json handles it, but an
            // all-whitespace buffer still reports Eof rather than
            // decoding, so bail early instead of looping forever.
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                self.buf.clear();
                break;
            }

            let mut de = serde_json::Deserializer::from_slice(&self.buf);
            match Packet::deserialize(&mut de) {
                Ok(packet) => {
                    let consumed = de.byte_offset();
                    self.buf.drain(..consumed);
                    out.push(packet);
                }
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(TunnelError::Codec(e.to_string())),
            }
        }

        Ok(out)
    }
}

/// A socket-attached streaming JSON control channel.
///
/// Reads and writes `Packet`s over any `AsyncRead + AsyncWrite` transport
/// (in practice a `TcpStream`), using [`JsonStreamDecoder`] to handle
/// partial reads.
pub struct JsonStream<S> {
    io: S,
    decoder: JsonStreamDecoder,
    pending: VecDeque<Packet>,
    read_buf: Box<[u8]>,
}

impl<S> JsonStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        Self {
            io,
            decoder: JsonStreamDecoder::new(),
            pending: VecDeque::new(),
            read_buf: vec![0u8; 8192].into_boxed_slice(),
        }
    }

    /// Read the next complete `Packet` from the stream, blocking on I/O
    /// until one is available.
    pub async fn read_packet(&mut self) -> TunnelResult<Packet> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(packet);
            }

            let n = self.io.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(TunnelError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "control stream closed",
                )));
            }

            let decoded = self.decoder.feed(&self.read_buf[..n])?;
            self.pending.extend(decoded);
        }
    }

    /// Write one `Packet` to the stream.
    pub async fn write_packet(&mut self, packet: &Packet) -> TunnelResult<()> {
        let bytes = serde_json::to_vec(packet).map_err(|e| TunnelError::Codec(e.to_string()))?;
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Unwrap back into the underlying transport.
    pub fn into_inner(self) -> S {
        self.io
    }

    /// Shut down the underlying transport for writing.
    pub async fn shutdown(&mut self) -> TunnelResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet_feed() {
        let mut decoder = JsonStreamDecoder::new();
        let bytes = serde_json::to_vec(&Packet::new("hello")).unwrap();
        let decoded = decoder.feed(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].cmd, "hello");
    }

    #[test]
    fn concatenated_packets_decode_in_order() {
        let mut combined = Vec::new();
        let packets: Vec<Packet> = (0..3)
            .map(|i| Packet::with_data("int", [("num".to_string(), i.to_string())]))
            .collect();
        for p in &packets {
            combined.extend(serde_json::to_vec(p).unwrap());
        }

        let mut decoder = JsonStreamDecoder::new();
        let decoded = decoder.feed(&combined).unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn partial_feed_waits_for_more_bytes() {
        let bytes = serde_json::to_vec(&Packet::with_data("tunnelBAD", [("dAddr", "x")])).unwrap();
        let mut decoder = JsonStreamDecoder::new();

        let (first, rest) = bytes.split_at(bytes.len() / 2);
        assert!(decoder.feed(first).unwrap().is_empty());

        let decoded = decoder.feed(rest).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].get("dAddr"), Some("x"));
    }

    #[tokio::test]
    async fn json_stream_round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut stream = JsonStream::new(sock);
            let p = stream.read_packet().await.unwrap();
            stream.write_packet(&p).await.unwrap();
        });

        let client_sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut client = JsonStream::new(client_sock);
        let sent = Packet::with_data("hello", [("a", "b")]);
        client.write_packet(&sent).await.unwrap();
        let echoed = client.read_packet().await.unwrap();

        assert_eq!(echoed, sent);
        server.await.unwrap();
    }
}
