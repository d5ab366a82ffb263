//! Byte-level framing shared by the server and the terminal client.
//!
//! Frames carry no type tag; their length is implied by the type the reader expects:
//! a single mark byte, a 4-byte little-endian integer, or text prefixed with its byte
//! length as a 7-bit variable-length integer.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ClientRequest, OPPONENT_MOVED, ServerMessage, logic::Board, logic::Role};

pub const MAX_TEXT_LEN: usize = 1024;

const READ_CHUNK: usize = 256;
const BUFFER_LIMIT: usize = 4096;

pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

impl Encode for ServerMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ServerMessage::Mark(role) => out.push(role.mark()),
            ServerMessage::OpponentMoved(location) => {
                put_text(out, OPPONENT_MOVED);
                // Board indices are below 9.
                out.extend_from_slice(&(*location as i32).to_le_bytes());
            }
            message => put_text(out, message.text().unwrap_or_default()),
        }
    }
}

impl Encode for ClientRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ClientRequest::Move(location) => out.extend_from_slice(&location.to_le_bytes()),
        }
    }
}

pub fn put_text(out: &mut Vec<u8>, text: &str) {
    let mut len = text.len();
    while len >= 0x80 {
        out.push((len as u8) | 0x80);
        len >>= 7;
    }
    out.push(len as u8);
    out.extend_from_slice(text.as_bytes());
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

/// Parses a 7-bit length prefix. `Ok(None)` means more bytes are needed.
fn parse_len(buf: &[u8]) -> io::Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().take(5).enumerate() {
        value |= usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 5 {
        Err(invalid("text length prefix runs past five bytes"))
    } else {
        Ok(None)
    }
}

fn parse_text(buf: &[u8]) -> io::Result<Option<(String, usize)>> {
    let Some((len, prefix)) = parse_len(buf)? else {
        return Ok(None);
    };
    if len > MAX_TEXT_LEN {
        return Err(invalid(format!("text frame of {len} bytes exceeds limit")));
    }
    let Some(bytes) = buf.get(prefix..prefix + len) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(bytes).map_err(|e| invalid(e.to_string()))?;
    Ok(Some((text.to_owned(), prefix + len)))
}

fn parse_i32(buf: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Buffers bytes from a connection and hands out whole frames.
///
/// The only suspension point is [`FrameReader::fill`], which moves bytes from the connection
/// into the buffer in one step, so every method here is safe to race in `tokio::select!`: a
/// cancelled read never loses half a frame.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Reads whatever the peer has sent. `Ok(0)` means the peer closed the connection.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Whether the buffer may grow further. A client flooding moves stops being read until
    /// the backlog drains.
    pub fn has_room(&self) -> bool {
        self.buf.len() < BUFFER_LIMIT
    }

    pub fn try_location(&mut self) -> Option<i32> {
        let location = parse_i32(&self.buf)?;
        self.buf.drain(..4);
        Some(location)
    }

    pub async fn read_mark(&mut self) -> io::Result<Role> {
        while self.buf.is_empty() {
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        let mark = self.buf.remove(0);
        Role::from_mark(mark).ok_or_else(|| invalid(format!("unknown mark byte {mark:#04x}")))
    }

    pub fn try_message(&mut self) -> io::Result<Option<ServerMessage>> {
        let Some((text, consumed)) = parse_text(&self.buf)? else {
            return Ok(None);
        };
        if text != OPPONENT_MOVED {
            self.buf.drain(..consumed);
            return Ok(Some(ServerMessage::from_text(&text)));
        }
        let Some(location) = parse_i32(&self.buf[consumed..]) else {
            return Ok(None);
        };
        let location = Board::index(location)
            .ok_or_else(|| invalid(format!("opponent moved off the board: {location}")))?;
        self.buf.drain(..consumed + 4);
        Ok(Some(ServerMessage::OpponentMoved(location)))
    }

    pub async fn next_message(&mut self) -> io::Result<ServerMessage> {
        loop {
            if let Some(message) = self.try_message()? {
                return Ok(message);
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    pub async fn send<M: Encode>(&mut self, message: &M) -> io::Result<()> {
        self.scratch.clear();
        message.encode(&mut self.scratch);
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::Outcome;

    #[test]
    fn short_text_has_one_byte_prefix() {
        let mut out = Vec::new();
        ServerMessage::ValidMove.encode(&mut out);
        assert_eq!(out[0] as usize, "Valid move.".len());
        assert_eq!(&out[1..], b"Valid move.");
    }

    #[test]
    fn long_text_prefix_uses_continuation_bits() {
        let text = "a".repeat(200);
        let mut out = Vec::new();
        put_text(&mut out, &text);
        assert_eq!(&out[..2], &[0xc8, 0x01]);
        assert_eq!(parse_text(&out).unwrap(), Some((text, 202)));
    }

    #[test]
    fn opponent_move_is_text_then_location() {
        let mut out = Vec::new();
        ServerMessage::OpponentMoved(4).encode(&mut out);
        let (text, consumed) = parse_text(&out).unwrap().unwrap();
        assert_eq!(text, OPPONENT_MOVED);
        assert_eq!(&out[consumed..], &4i32.to_le_bytes());
    }

    #[test]
    fn oversized_text_is_rejected() {
        let mut out = Vec::new();
        put_text(&mut out, &"b".repeat(MAX_TEXT_LEN + 1));
        let err = parse_text(&out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);

        let mut bytes = Vec::new();
        ServerMessage::OpponentMoved(7).encode(&mut bytes);
        ServerMessage::GameOver(Outcome::Draw).encode(&mut bytes);
        let (head, tail) = bytes.split_at(OPPONENT_MOVED.len() + 3);

        server.write_all(head).await.unwrap();
        reader.fill().await.unwrap();
        assert_eq!(reader.try_message().unwrap(), None);

        server.write_all(tail).await.unwrap();
        assert_eq!(
            reader.next_message().await.unwrap(),
            ServerMessage::OpponentMoved(7)
        );
        assert_eq!(
            reader.next_message().await.unwrap(),
            ServerMessage::GameOver(Outcome::Draw)
        );
    }

    #[tokio::test]
    async fn location_waits_for_all_four_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);
        server.write_all(&3i32.to_le_bytes()).await.unwrap();
        server.write_all(&[0x01, 0x00]).await.unwrap();
        while reader.buf.len() < 6 {
            reader.fill().await.unwrap();
        }

        assert_eq!(reader.try_location(), Some(3));
        assert_eq!(reader.try_location(), None);

        server.write_all(&[0x00, 0x00]).await.unwrap();
        drop(server);
        while reader.buf.len() < 4 {
            reader.fill().await.unwrap();
        }
        assert_eq!(reader.try_location(), Some(1));
        assert_eq!(reader.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_byte_precedes_text() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(server);
        writer.send(&ServerMessage::Mark(Role::O)).await.unwrap();
        writer.send(&ServerMessage::Connected(Role::O)).await.unwrap();

        let mut reader = FrameReader::new(client);
        assert_eq!(reader.read_mark().await.unwrap(), Role::O);
        assert_eq!(
            reader.next_message().await.unwrap(),
            ServerMessage::Connected(Role::O)
        );
    }
}
