//! Frame codec for the host-device channels.
//!
//! Every message crossing a control or data sub-channel is a frame:
//!
//! ```text
//! [u32 BE name length N][N bytes: type name + NUL][payload bytes]
//! ```
//!
//! `N` counts the NUL terminator. The payload length is not stored in the frame
//! itself; it is implied by the packet that carries the frame (see
//! [`read_packet`] / [`write_packet`]), which prefixes every frame with its total
//! length so a reader knows where one frame ends.
//!
//! Two hard limits bound what a peer can make us do: the type name may not be
//! longer than `max_name_len`, and no frame (or packet) may be larger than
//! `max_frame_len`. Both are checked before any allocation proportional to the
//! declared sizes.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{error, warn};

/// Default maximum type name length, NUL terminator included.
pub const DEFAULT_MAX_NAME_LEN: usize = 128;

/// Default hard maximum for a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Size of the big-endian length header (both frame and packet).
pub const LEN_HEADER: usize = 4;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("type name of {len} bytes exceeds maximum of {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("frame truncated: {len} bytes, need at least {need}")]
    Truncated { len: usize, need: usize },

    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed type name: {0}")]
    MalformedName(&'static str),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("'{kind}' payload is invalid: {reason}")]
    Payload { kind: String, reason: String },
}

/// Closed set of message types this build understands.
///
/// Anything else decodes to [`MessageKind::Unknown`], which [`FrameCodec::decode`]
/// rejects; the variant exists so callers can still name the offending type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Handshake,
    Response,
    JobStart,
    JobStop,
    ReplayStart,
    ReplayStop,
    FileChunk,
    ChannelFinished,
    JobFinished,
    Unknown(String),
}

impl MessageKind {
    /// Type name as written on the wire (without the NUL).
    pub fn name(&self) -> &str {
        match self {
            MessageKind::Ping => "Ping",
            MessageKind::Handshake => "Handshake",
            MessageKind::Response => "Response",
            MessageKind::JobStart => "JobStart",
            MessageKind::JobStop => "JobStop",
            MessageKind::ReplayStart => "ReplayStart",
            MessageKind::ReplayStop => "ReplayStop",
            MessageKind::FileChunk => "FileChunk",
            MessageKind::ChannelFinished => "ChannelFinished",
            MessageKind::JobFinished => "JobFinished",
            MessageKind::Unknown(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "Ping" => MessageKind::Ping,
            "Handshake" => MessageKind::Handshake,
            "Response" => MessageKind::Response,
            "JobStart" => MessageKind::JobStart,
            "JobStop" => MessageKind::JobStop,
            "ReplayStart" => MessageKind::ReplayStart,
            "ReplayStop" => MessageKind::ReplayStop,
            "FileChunk" => MessageKind::FileChunk,
            "ChannelFinished" => MessageKind::ChannelFinished,
            "JobFinished" => MessageKind::JobFinished,
            other => MessageKind::Unknown(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MessageKind::Unknown(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame: message type plus its still-serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        self.kind.name()
    }
}

/// Frame encoder/decoder carrying the configured limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_name_len: usize,
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_LEN, DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_name_len: usize, max_frame_len: usize) -> Self {
        Self {
            max_name_len,
            max_frame_len,
        }
    }

    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Start a frame for `kind`: writes the length header and the NUL-terminated
    /// name into a buffer with room for `payload_hint` more bytes. The caller
    /// appends the payload directly into the returned buffer.
    pub fn begin_frame(
        &self,
        kind: &MessageKind,
        payload_hint: usize,
    ) -> Result<BytesMut, CodecError> {
        let name = kind.name();
        let name_len = name.len() + 1;
        if name_len > self.max_name_len {
            error!(
                "Encode failed: type name '{}' is {} bytes (max {})",
                name, name_len, self.max_name_len
            );
            return Err(CodecError::NameTooLong {
                len: name_len,
                max: self.max_name_len,
            });
        }

        let mut buf = BytesMut::with_capacity(LEN_HEADER + name_len + payload_hint);
        buf.put_u32(name_len as u32);
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
        Ok(buf)
    }

    /// Reject a finished frame that a peer would refuse to decode.
    pub fn finish_frame(&self, frame: BytesMut) -> Result<BytesMut, CodecError> {
        if frame.len() > self.max_frame_len {
            error!(
                "Encode failed: frame of {} bytes exceeds maximum {}",
                frame.len(),
                self.max_frame_len
            );
            return Err(CodecError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        Ok(frame)
    }

    pub fn encode(&self, message: &RawMessage) -> Result<BytesMut, CodecError> {
        let mut frame = self.begin_frame(&message.kind, message.payload.len())?;
        frame.put_slice(&message.payload);
        self.finish_frame(frame)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<RawMessage, CodecError> {
        if buf.len() > self.max_frame_len {
            error!(
                "Decode failed: buffer of {} bytes exceeds maximum {}",
                buf.len(),
                self.max_frame_len
            );
            return Err(CodecError::FrameTooLarge {
                len: buf.len(),
                max: self.max_frame_len,
            });
        }
        if buf.len() < LEN_HEADER {
            error!("Decode failed: {} bytes is shorter than the length header", buf.len());
            return Err(CodecError::Truncated {
                len: buf.len(),
                need: LEN_HEADER,
            });
        }

        let mut header = [0u8; LEN_HEADER];
        header.copy_from_slice(&buf[..LEN_HEADER]);
        let name_len = u32::from_be_bytes(header) as usize;
        if name_len > self.max_name_len {
            error!(
                "Decode failed: declared name length {} exceeds maximum {}",
                name_len, self.max_name_len
            );
            return Err(CodecError::NameTooLong {
                len: name_len,
                max: self.max_name_len,
            });
        }
        if name_len == 0 {
            error!("Decode failed: empty type name");
            return Err(CodecError::MalformedName("empty type name"));
        }
        let body = &buf[LEN_HEADER..];
        if body.len() < name_len {
            error!(
                "Decode failed: name length {} but only {} bytes follow the header",
                name_len,
                body.len()
            );
            return Err(CodecError::Truncated {
                len: buf.len(),
                need: LEN_HEADER + name_len,
            });
        }

        let (name_bytes, payload) = body.split_at(name_len);
        let name = match name_bytes.split_last() {
            Some((&0, name)) if !name.contains(&0) => name,
            _ => {
                error!("Decode failed: type name is not NUL-terminated");
                return Err(CodecError::MalformedName("missing NUL terminator"));
            }
        };
        let name = std::str::from_utf8(name).map_err(|_| {
            error!("Decode failed: type name is not valid UTF-8");
            CodecError::MalformedName("type name is not UTF-8")
        })?;

        let kind = MessageKind::from_name(name);
        if !kind.is_known() {
            warn!("Decode failed: unknown message type '{}'", name);
            return Err(CodecError::UnknownType(name.to_string()));
        }

        Ok(RawMessage {
            kind,
            payload: payload.to_vec(),
        })
    }
}

/// Write one frame as a packet: `[u32 BE frame length][frame]`.
pub fn write_packet<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame larger than 4 GiB"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(frame)?;
    writer.flush()
}

/// Read one packet. Returns `Ok(None)` when the peer closed the stream cleanly
/// before a new packet started. A declared length above `max_len` is rejected
/// before the body buffer is allocated.
pub fn read_packet<R: Read>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; LEN_HEADER];
    let mut filled = 0;
    while filled < LEN_HEADER {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a packet header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {} bytes exceeds maximum {}", len, max_len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ping_frame_layout() {
        let codec = FrameCodec::default();
        let frame = codec
            .encode(&RawMessage::new(MessageKind::Ping, b"x".to_vec()))
            .unwrap();

        assert_eq!(&frame[..], b"\x00\x00\x00\x05Ping\x00x");

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.type_name(), "Ping");
        assert_eq!(decoded.payload, b"x");
    }

    #[test]
    fn test_roundtrip_known_kinds() {
        let codec = FrameCodec::default();
        for kind in [MessageKind::Handshake, MessageKind::FileChunk, MessageKind::JobFinished] {
            let msg = RawMessage::new(kind, vec![0, 1, 2, 0, 255]);
            let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let codec = FrameCodec::default();
        let msg = RawMessage::new(MessageKind::JobStop, Vec::new());
        assert_eq!(codec.decode(&codec.encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_encode_rejects_long_name() {
        let codec = FrameCodec::new(8, 1024);
        let msg = RawMessage::new(MessageKind::Unknown("VeryLongTypeName".into()), b"x".to_vec());
        assert!(matches!(
            codec.encode(&msg),
            Err(CodecError::NameTooLong { len: 17, max: 8 })
        ));
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&[0, 0, 5]),
            Err(CodecError::Truncated { len: 3, need: 4 })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_buffer() {
        let codec = FrameCodec::new(16, 64);
        let mut frame = codec
            .encode(&RawMessage::new(MessageKind::Ping, Vec::new()))
            .unwrap()
            .to_vec();

        frame.resize(64, b'a');
        assert!(codec.decode(&frame).is_ok());

        frame.push(b'a');
        assert_eq!(
            codec.decode(&frame),
            Err(CodecError::FrameTooLarge { len: 65, max: 64 })
        );
    }

    #[test]
    fn test_decode_rejects_declared_name_len() {
        let codec = FrameCodec::new(16, 1024);
        let mut frame = vec![0, 0, 0, 200];
        frame.extend_from_slice(b"Ping\0");
        assert_eq!(
            codec.decode(&frame),
            Err(CodecError::NameTooLong { len: 200, max: 16 })
        );
    }

    #[test]
    fn test_decode_rejects_name_past_end() {
        let codec = FrameCodec::default();
        let frame = b"\x00\x00\x00\x09Ping\x00";
        assert!(matches!(codec.decode(frame), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_rejects_missing_terminator() {
        let codec = FrameCodec::default();
        let frame = b"\x00\x00\x00\x04Pingx";
        assert_eq!(
            codec.decode(frame),
            Err(CodecError::MalformedName("missing NUL terminator"))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let codec = FrameCodec::default();
        let frame = codec
            .encode(&RawMessage::new(MessageKind::Unknown("Bogus".into()), b"x".to_vec()))
            .unwrap();
        assert_eq!(
            codec.decode(&frame),
            Err(CodecError::UnknownType("Bogus".into()))
        );
    }

    #[test]
    fn test_packet_roundtrip_and_eof() {
        let mut wire = Vec::new();
        write_packet(&mut wire, b"first").unwrap();
        write_packet(&mut wire, b"").unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(read_packet(&mut reader, 64).unwrap().unwrap(), b"first");
        assert_eq!(read_packet(&mut reader, 64).unwrap().unwrap(), b"");
        assert!(read_packet(&mut reader, 64).unwrap().is_none());
    }

    #[test]
    fn test_packet_length_checked_before_allocation() {
        let mut reader = Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        let err = read_packet(&mut reader, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_packet_truncated_header() {
        let mut reader = Cursor::new(vec![0, 0]);
        let err = read_packet(&mut reader, 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
