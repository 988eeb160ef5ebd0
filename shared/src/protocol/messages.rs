//! Typed control and data messages.
//!
//! [`WireMessage`] is the closed catalogue of everything that travels over a
//! transport channel. Payloads are bincode with an explicit fixint config so host
//! and device always agree on the encoding; `Ping` is the exception and carries
//! its bytes verbatim.

use super::wire::{CodecError, FrameCodec, MessageKind, RawMessage};
use bincode::Options;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::job::DeviceId;

/// Single bincode config for message payloads.
fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Which sub-channel a handshake opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Control,
    Data,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Control => f.write_str("control"),
            ChannelKind::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub device_id: DeviceId,
    pub job_id: String,
    /// Deployment mode string, e.g. "soc" or "rpc".
    pub mode: String,
    pub channel: ChannelKind,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Error,
}

/// Status object embedded in every response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: Status,
    pub info: String,
    pub device_id: String,
}

impl StatusInfo {
    pub fn success(device_id: DeviceId) -> Self {
        Self {
            status: Status::Success,
            info: String::new(),
            device_id: device_id.to_string(),
        }
    }

    pub fn error(device_id: DeviceId, info: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            info: info.into(),
            device_id: device_id.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Generic response envelope: status plus an optional serialized body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: StatusInfo,
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn ok(device_id: DeviceId) -> Self {
        Self {
            status: StatusInfo::success(device_id),
            body: Vec::new(),
        }
    }

    pub fn ok_with_body(device_id: DeviceId, body: Vec<u8>) -> Self {
        Self {
            status: StatusInfo::success(device_id),
            body,
        }
    }

    pub fn error(device_id: DeviceId, info: impl Into<String>) -> Self {
        Self {
            status: StatusInfo::error(device_id, info),
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStartRequest {
    pub job_id: String,
    pub device_id: DeviceId,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStopRequest {
    pub job_id: String,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStartRequest {
    pub job_id: String,
    pub device_id: DeviceId,
    pub mode: String,
    /// Resolved event/configuration payload.
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStopRequest {
    pub job_id: String,
    pub device_id: DeviceId,
}

/// One chunk of a named output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub job_id: String,
    pub device_id: DeviceId,
    pub stream_name: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// The device has finished producing one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFinished {
    pub job_id: String,
    pub device_id: DeviceId,
    pub stream_name: String,
}

/// The device considers the job complete; `payload` is trailing data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    pub job_id: String,
    pub device_id: DeviceId,
    pub payload: Vec<u8>,
}

/// Every message type that can cross a transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Ping(Vec<u8>),
    Handshake(HandshakeRequest),
    Response(ResponseEnvelope),
    JobStart(JobStartRequest),
    JobStop(JobStopRequest),
    ReplayStart(ReplayStartRequest),
    ReplayStop(ReplayStopRequest),
    FileChunk(FileChunk),
    ChannelFinished(ChannelFinished),
    JobFinished(JobFinished),
}

fn serialize_frame<T: Serialize>(
    codec: &FrameCodec,
    kind: &MessageKind,
    value: &T,
) -> Result<BytesMut, CodecError> {
    let payload_error = |e: bincode::Error| CodecError::Payload {
        kind: kind.name().to_string(),
        reason: e.to_string(),
    };
    let size = wire_bincode().serialized_size(value).map_err(payload_error)? as usize;
    let mut frame = codec.begin_frame(kind, size)?;
    wire_bincode()
        .serialize_into((&mut frame).writer(), value)
        .map_err(payload_error)?;
    Ok(frame)
}

fn take_payload<T: for<'de> Deserialize<'de>>(raw: &RawMessage) -> Result<T, CodecError> {
    wire_bincode()
        .deserialize(&raw.payload)
        .map_err(|e| {
            tracing::warn!("Failed to decode '{}' payload: {}", raw.kind, e);
            CodecError::Payload {
                kind: raw.kind.name().to_string(),
                reason: e.to_string(),
            }
        })
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            WireMessage::Ping(_) => MessageKind::Ping,
            WireMessage::Handshake(_) => MessageKind::Handshake,
            WireMessage::Response(_) => MessageKind::Response,
            WireMessage::JobStart(_) => MessageKind::JobStart,
            WireMessage::JobStop(_) => MessageKind::JobStop,
            WireMessage::ReplayStart(_) => MessageKind::ReplayStart,
            WireMessage::ReplayStop(_) => MessageKind::ReplayStop,
            WireMessage::FileChunk(_) => MessageKind::FileChunk,
            WireMessage::ChannelFinished(_) => MessageKind::ChannelFinished,
            WireMessage::JobFinished(_) => MessageKind::JobFinished,
        }
    }

    /// Encode into a frame, serializing the payload straight into the frame buffer.
    pub fn encode(&self, codec: &FrameCodec) -> Result<BytesMut, CodecError> {
        let kind = self.kind();
        let frame = match self {
            WireMessage::Ping(bytes) => {
                let mut frame = codec.begin_frame(&kind, bytes.len())?;
                frame.put_slice(bytes);
                frame
            }
            WireMessage::Handshake(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::Response(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::JobStart(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::JobStop(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::ReplayStart(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::ReplayStop(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::FileChunk(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::ChannelFinished(m) => serialize_frame(codec, &kind, m)?,
            WireMessage::JobFinished(m) => serialize_frame(codec, &kind, m)?,
        };
        codec.finish_frame(frame)
    }

    pub fn decode(codec: &FrameCodec, frame: &[u8]) -> Result<Self, CodecError> {
        Self::from_raw(codec.decode(frame)?)
    }

    pub fn from_raw(raw: RawMessage) -> Result<Self, CodecError> {
        let message = match &raw.kind {
            MessageKind::Ping => return Ok(WireMessage::Ping(raw.payload)),
            MessageKind::Handshake => WireMessage::Handshake(take_payload(&raw)?),
            MessageKind::Response => WireMessage::Response(take_payload(&raw)?),
            MessageKind::JobStart => WireMessage::JobStart(take_payload(&raw)?),
            MessageKind::JobStop => WireMessage::JobStop(take_payload(&raw)?),
            MessageKind::ReplayStart => WireMessage::ReplayStart(take_payload(&raw)?),
            MessageKind::ReplayStop => WireMessage::ReplayStop(take_payload(&raw)?),
            MessageKind::FileChunk => WireMessage::FileChunk(take_payload(&raw)?),
            MessageKind::ChannelFinished => WireMessage::ChannelFinished(take_payload(&raw)?),
            MessageKind::JobFinished => WireMessage::JobFinished(take_payload(&raw)?),
            MessageKind::Unknown(name) => return Err(CodecError::UnknownType(name.clone())),
        };
        Ok(message)
    }

    /// Job id carried by the message, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            WireMessage::Ping(_) | WireMessage::Response(_) => None,
            WireMessage::Handshake(m) => Some(&m.job_id),
            WireMessage::JobStart(m) => Some(&m.job_id),
            WireMessage::JobStop(m) => Some(&m.job_id),
            WireMessage::ReplayStart(m) => Some(&m.job_id),
            WireMessage::ReplayStop(m) => Some(&m.job_id),
            WireMessage::FileChunk(m) => Some(&m.job_id),
            WireMessage::ChannelFinished(m) => Some(&m.job_id),
            WireMessage::JobFinished(m) => Some(&m.job_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn test_ping_is_verbatim() {
        let frame = WireMessage::Ping(b"x".to_vec()).encode(&codec()).unwrap();
        assert_eq!(&frame[..], b"\x00\x00\x00\x05Ping\x00x");
        assert_eq!(
            WireMessage::decode(&codec(), &frame).unwrap(),
            WireMessage::Ping(b"x".to_vec())
        );
    }

    #[test]
    fn test_job_start_roundtrip() {
        let mut config = BTreeMap::new();
        config.insert("aic_metrics".to_string(), "PipeUtilization".to_string());
        let msg = WireMessage::JobStart(JobStartRequest {
            job_id: "job-7".into(),
            device_id: 3,
            config,
        });

        let frame = msg.encode(&codec()).unwrap();
        assert_eq!(&frame[4..13], b"JobStart\0");
        assert_eq!(WireMessage::decode(&codec(), &frame).unwrap(), msg);
        assert_eq!(msg.job_id(), Some("job-7"));
    }

    #[test]
    fn test_response_status_survives_roundtrip() {
        let msg = WireMessage::Response(ResponseEnvelope::error(1, "device busy"));
        match WireMessage::decode(&codec(), &msg.encode(&codec()).unwrap()).unwrap() {
            WireMessage::Response(resp) => {
                assert!(!resp.status.is_success());
                assert_eq!(resp.status.info, "device busy");
                assert_eq!(resp.status.device_id, "1");
            }
            other => panic!("expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let msg = WireMessage::FileChunk(FileChunk {
            job_id: "job".into(),
            device_id: 0,
            stream_name: "trace.bin".into(),
            start_ns: 1,
            end_ns: 2,
            is_last: false,
            data: vec![1; 32],
        });
        let frame = msg.encode(&codec()).unwrap();
        let cut = &frame[..frame.len() - 8];
        assert!(matches!(
            WireMessage::decode(&codec(), cut),
            Err(CodecError::Payload { .. })
        ));
    }

    #[test]
    fn test_encode_respects_frame_limit() {
        let small = FrameCodec::new(32, 64);
        let msg = WireMessage::Ping(vec![0; 128]);
        assert!(matches!(
            msg.encode(&small),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
