//! Host-device transport.
//!
//! A [`TransportChannel`] is one job's link to one device. It is made of two
//! independent connections opened through a [`Connector`]: a control
//! sub-channel for synchronous request/response traffic and a data sub-channel
//! that streams trace chunks and completion notices back to the host.

pub mod channel;
pub mod memory;
pub mod registry;
pub mod tcp;

pub use channel::{ChannelSettings, ChannelState, TransportChannel};
pub use registry::TransportRegistry;

use devscope_shared::protocol::messages::{ChannelFinished, ChannelKind, FileChunk, JobFinished};
use devscope_shared::protocol::wire::CodecError;
use devscope_shared::DeviceId;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// One established connection carrying length-prefixed packets.
pub trait Connection: Send {
    /// Send one frame as a packet.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Receive the next packet. `Ok(None)` means the peer ended the stream.
    fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// A second handle to the same connection, used to shut it down from
    /// another thread while the first handle is blocked.
    fn try_clone(&self) -> io::Result<Box<dyn Connection>>;

    /// Unblock and fail pending and future I/O on every handle.
    fn shutdown(&self);
}

/// Opens sub-channel connections to devices.
pub trait Connector: Send + Sync {
    fn connect(&self, device: DeviceId, kind: ChannelKind) -> io::Result<Box<dyn Connection>>;
}

/// Receiver for messages arriving on a data sub-channel.
///
/// Called on the channel's receive thread; implementations must not block for
/// long or the data stream stalls.
pub trait DataHandler: Send + Sync {
    fn on_file_chunk(&self, origin: &Arc<TransportChannel>, chunk: FileChunk);

    fn on_channel_finished(&self, origin: &Arc<TransportChannel>, notice: ChannelFinished);

    fn on_job_finished(&self, origin: &Arc<TransportChannel>, notice: JobFinished);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel to device {0} is closed")]
    Closed(DeviceId),

    #[error("{channel} sub-channel to device {device} is not connected")]
    NotConnected { device: DeviceId, channel: ChannelKind },

    #[error("I/O error on {channel} sub-channel to device {device}: {source}")]
    Io {
        device: DeviceId,
        channel: ChannelKind,
        #[source]
        source: io::Error,
    },

    #[error("device {device} ended the {channel} stream")]
    PeerClosed { device: DeviceId, channel: ChannelKind },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{channel} handshake with device {device} failed: {info}")]
    Handshake {
        device: DeviceId,
        channel: ChannelKind,
        info: String,
    },

    #[error("device {device} rejected {kind}: {info}")]
    Rejected {
        device: DeviceId,
        kind: String,
        info: String,
    },

    #[error("device {device} answered with {kind} where a response was expected")]
    UnexpectedMessage { device: DeviceId, kind: String },
}

impl TransportError {
    /// True for failures of the link itself, as opposed to a device saying no.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Io { .. }
                | TransportError::PeerClosed { .. }
                | TransportError::NotConnected { .. }
                | TransportError::Closed(_)
        )
    }
}
