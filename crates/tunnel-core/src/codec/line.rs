//! Line-oriented `key=value&...` codec for the C⇄B control plane.
//!
//! One message per line, terminated by `\n` (a trailing `\r` is tolerated).
//! The payload is a URL-encoded query string: `cmd=<name>` names the
//! command, every other pair lands in `Data`. A missing `cmd` decodes to
//! an empty command string.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::error::{TunnelError, TunnelResult};
use crate::packet::Packet;

/// Decode one already-trimmed line into a `Packet`.
pub fn decode_line(line: &str) -> Packet {
    let mut cmd = String::new();
    let mut data = HashMap::new();

    for (key, value) in url::form_urlencoded::parse(line.as_bytes()) {
        if key == "cmd" {
            cmd = value.into_owned();
        } else {
            data.insert(key.into_owned(), value.into_owned());
        }
    }

    Packet { cmd, data }
}

/// Encode a `Packet` into a `cmd=...&k=v\n` line.
///
/// The percent-encoded query string is unescaped before being written so
/// the line carries human-readable values rather than percent-escapes —
/// this mirrors the reference implementation's `url.QueryUnescape` pass
/// and means keys/values containing `&`, `=`, or `%` will not round-trip
/// byte-for-byte. Ordinary host:port and command values are unaffected.
pub fn encode_line(packet: &Packet) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    if !packet.cmd.is_empty() {
        ser.append_pair("cmd", &packet.cmd);
    }
    for (key, value) in &packet.data {
        ser.append_pair(key, value);
    }
    let encoded = ser.finish();

    let unescaped = percent_encoding::percent_decode_str(&encoded.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned();

    format!("{unescaped}\n")
}

/// A socket-attached line-oriented control channel.
pub struct LineStream<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S> LineStream<S>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read and decode the next line. Errors with `UnexpectedEof` when the
    /// peer closes the socket cleanly.
    pub async fn read_packet(&mut self) -> TunnelResult<Packet> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control stream closed",
            )));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        Ok(decode_line(trimmed))
    }

    /// Encode and write one `Packet`.
    pub async fn write_packet(&mut self, packet: &Packet) -> TunnelResult<()> {
        let line = encode_line(packet);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_basic_command() {
        let p = decode_line("cmd=tunnelBAD&dAddr=127.0.0.1:7777");
        assert_eq!(p.cmd, "tunnelBAD");
        assert_eq!(p.get("dAddr"), Some("127.0.0.1:7777"));
    }

    #[test]
    fn decode_missing_cmd_yields_empty() {
        let p = decode_line("dAddr=127.0.0.1:7777");
        assert_eq!(p.cmd, "");
        assert_eq!(p.get("dAddr"), Some("127.0.0.1:7777"));
    }

    #[test]
    fn decode_empty_line_yields_empty_packet() {
        let p = decode_line("");
        assert_eq!(p.cmd, "");
        assert!(p.data.is_empty());
    }

    #[test]
    fn encode_round_trip_plain_values() {
        let packet = Packet::with_data("tunnelBAD", [("dAddr", "127.0.0.1:7777")]);
        let line = encode_line(&packet);
        assert_eq!(line, "cmd=tunnelBAD&dAddr=127.0.0.1:7777\n");

        let decoded = decode_line(line.trim_end_matches('\n'));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn encode_no_cmd_when_empty() {
        let packet = Packet::with_data("", [("msg", "ok")]);
        let line = encode_line(&packet);
        assert_eq!(line, "msg=ok\n");
    }

    #[tokio::test]
    async fn line_stream_round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut stream = LineStream::new(sock);
            let p = stream.read_packet().await.unwrap();
            stream.write_packet(&p).await.unwrap();
        });

        let client_sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut client = LineStream::new(client_sock);
        let sent = Packet::with_data("listForward", Vec::<(String, String)>::new());
        client.write_packet(&sent).await.unwrap();
        let echoed = client.read_packet().await.unwrap();

        assert_eq!(echoed, sent);
        server.await.unwrap();
    }
}
