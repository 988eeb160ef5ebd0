//! Host-device wire protocol.
//!
//! `wire` owns the frame and packet layout; `messages` owns the typed catalogue
//! carried inside frames.

pub mod messages;
pub mod wire;

pub use messages::{ChannelKind, ResponseEnvelope, Status, StatusInfo, WireMessage};
pub use wire::{CodecError, FrameCodec, MessageKind, RawMessage};
