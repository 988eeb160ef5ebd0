//! In-process loopback devices.
//!
//! [`MemoryConnector`] answers handshakes and control requests from a peer
//! thread per connection, driven by a [`DeviceBehavior`]. Data sub-channels are
//! exposed through [`DataPort`] so a behavior (or a test) can push trace
//! messages to the host. Used by `--simulate` and by the test suites.

use super::{Connection, Connector};
use devscope_shared::protocol::messages::{
    ChannelFinished, ChannelKind, FileChunk, HandshakeRequest, JobFinished, ResponseEnvelope,
    StatusInfo, WireMessage,
};
use devscope_shared::protocol::wire::FrameCodec;
use devscope_shared::DeviceId;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a loopback device answers the host.
pub trait DeviceBehavior: Send + Sync {
    fn handshake(&self, device: DeviceId, _request: &HandshakeRequest) -> StatusInfo {
        StatusInfo::success(device)
    }

    fn request(&self, device: DeviceId, _message: &WireMessage, _data: &DataPort) -> ResponseEnvelope {
        ResponseEnvelope::ok(device)
    }
}

/// Accepts every handshake and request.
#[derive(Debug, Default)]
pub struct AckingDevice;

impl DeviceBehavior for AckingDevice {}

/// Streams a small trace after `ReplayStart` and finishes the job on the
/// first `JobStop`.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    finished: Mutex<HashSet<(String, DeviceId)>>,
}

impl SimulatedDevice {
    const STREAMS: [&'static str; 2] = ["ai_core.data", "task_time.data"];
}

impl DeviceBehavior for SimulatedDevice {
    fn request(&self, device: DeviceId, message: &WireMessage, data: &DataPort) -> ResponseEnvelope {
        match message {
            WireMessage::ReplayStart(req) => {
                for name in Self::STREAMS {
                    for seq in 0..4u64 {
                        let line = format!("{} device={} seq={}\n", name, device, seq);
                        data.push(
                            &req.job_id,
                            device,
                            WireMessage::FileChunk(FileChunk {
                                job_id: req.job_id.clone(),
                                device_id: device,
                                stream_name: name.to_string(),
                                start_ns: seq * 1_000,
                                end_ns: seq * 1_000 + 999,
                                is_last: false,
                                data: line.into_bytes(),
                            }),
                        );
                    }
                }
            }
            WireMessage::JobStop(req) => {
                if self.finished.lock().insert((req.job_id.clone(), device)) {
                    for name in Self::STREAMS {
                        data.push(
                            &req.job_id,
                            device,
                            WireMessage::ChannelFinished(ChannelFinished {
                                job_id: req.job_id.clone(),
                                device_id: device,
                                stream_name: name.to_string(),
                            }),
                        );
                    }
                    data.push(
                        &req.job_id,
                        device,
                        WireMessage::JobFinished(JobFinished {
                            job_id: req.job_id.clone(),
                            device_id: device,
                            payload: Vec::new(),
                        }),
                    );
                }
            }
            _ => {}
        }
        ResponseEnvelope::ok(device)
    }
}

struct Shared {
    behavior: Arc<dyn DeviceBehavior>,
    codec: FrameCodec,
    outlets: Mutex<HashMap<(String, DeviceId), Sender<Vec<u8>>>>,
    refused: Mutex<HashSet<DeviceId>>,
    requests: Mutex<HashMap<DeviceId, Vec<WireMessage>>>,
}

/// Host-to-device push handle for data sub-channels.
#[derive(Clone)]
pub struct DataPort {
    shared: Arc<Shared>,
}

impl DataPort {
    /// Send `message` on the data sub-channel of `(job_id, device)`.
    /// Returns false when no such channel is open.
    pub fn push(&self, job_id: &str, device: DeviceId, message: WireMessage) -> bool {
        let frame = match message.encode(&self.shared.codec) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Loopback device cannot encode {}: {}", message.kind(), e);
                return false;
            }
        };
        let key = (job_id.to_string(), device);
        let mut outlets = self.shared.outlets.lock();
        match outlets.get(&key) {
            Some(tx) if tx.send(frame.to_vec()).is_ok() => true,
            Some(_) => {
                outlets.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Push raw bytes as one packet, bypassing the encoder.
    pub fn push_raw(&self, job_id: &str, device: DeviceId, frame: Vec<u8>) -> bool {
        let outlets = self.shared.outlets.lock();
        outlets
            .get(&(job_id.to_string(), device))
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// End the data stream as if the device went away.
    pub fn end(&self, job_id: &str, device: DeviceId) -> bool {
        self.shared
            .outlets
            .lock()
            .remove(&(job_id.to_string(), device))
            .is_some()
    }

    pub fn is_open(&self, job_id: &str, device: DeviceId) -> bool {
        self.shared
            .outlets
            .lock()
            .contains_key(&(job_id.to_string(), device))
    }
}

pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new(behavior: Arc<dyn DeviceBehavior>) -> Self {
        Self::with_codec(behavior, FrameCodec::default())
    }

    pub fn with_codec(behavior: Arc<dyn DeviceBehavior>, codec: FrameCodec) -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior,
                codec,
                outlets: Mutex::new(HashMap::new()),
                refused: Mutex::new(HashSet::new()),
                requests: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make `device` refuse connections.
    pub fn refuse(&self, device: DeviceId) {
        self.shared.refused.lock().insert(device);
    }

    pub fn data_port(&self) -> DataPort {
        DataPort {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Shorthand for `data_port().push(..)`.
    pub fn push_data(&self, job_id: &str, device: DeviceId, message: WireMessage) -> bool {
        self.data_port().push(job_id, device, message)
    }

    /// Control requests `device` has received so far, handshakes excluded.
    pub fn requests(&self, device: DeviceId) -> Vec<WireMessage> {
        self.shared
            .requests
            .lock()
            .get(&device)
            .cloned()
            .unwrap_or_default()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, device: DeviceId, kind: ChannelKind) -> io::Result<Box<dyn Connection>> {
        if self.shared.refused.lock().contains(&device) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("device {} refused the connection", device),
            ));
        }

        let (host, peer) = MemoryConnection::pair();
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name(format!("loopback-{}-{}", device, kind))
            .spawn(move || serve_peer(shared, device, kind, peer))?;
        Ok(Box::new(host))
    }
}

fn serve_peer(shared: Arc<Shared>, device: DeviceId, kind: ChannelKind, mut conn: MemoryConnection) {
    let port = DataPort {
        shared: Arc::clone(&shared),
    };
    loop {
        let packet = match conn.recv() {
            Ok(Some(packet)) => packet,
            Ok(None) | Err(_) => break,
        };

        let (response, data_job) = match WireMessage::decode(&shared.codec, &packet) {
            Ok(WireMessage::Handshake(hello)) => {
                let status = shared.behavior.handshake(device, &hello);
                let data_job = (kind == ChannelKind::Data && status.is_success())
                    .then(|| hello.job_id.clone());
                (ResponseEnvelope { status, body: Vec::new() }, data_job)
            }
            Ok(WireMessage::Ping(body)) => {
                shared
                    .requests
                    .lock()
                    .entry(device)
                    .or_default()
                    .push(WireMessage::Ping(body.clone()));
                (ResponseEnvelope::ok_with_body(device, body), None)
            }
            Ok(message) => {
                shared
                    .requests
                    .lock()
                    .entry(device)
                    .or_default()
                    .push(message.clone());
                (shared.behavior.request(device, &message, &port), None)
            }
            Err(e) => (ResponseEnvelope::error(device, e.to_string()), None),
        };

        let frame = match WireMessage::Response(response).encode(&shared.codec) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Loopback device {} cannot encode response: {}", device, e);
                break;
            }
        };
        if conn.send(&frame).is_err() {
            break;
        }

        if let Some(job_id) = data_job {
            // From here on the data sub-channel only flows device-to-host.
            shared
                .outlets
                .lock()
                .insert((job_id, device), conn.tx.clone());
            debug!(device, "Loopback data channel open");
            break;
        }
    }
}

/// One end of an in-process packet pipe.
pub struct MemoryConnection {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Two connected ends sharing one shutdown flag.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        (
            MemoryConnection {
                tx: a_tx,
                rx: b_rx,
                closed: Arc::clone(&closed),
            },
            MemoryConnection {
                tx: b_tx,
                rx: a_rx,
                closed,
            },
        )
    }
}

impl Connection for MemoryConnection {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(packet) => return Ok(Some(packet)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn try_clone(&self) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devscope_shared::protocol::messages::JobStopRequest;

    #[test]
    fn test_pair_shutdown_unblocks_both_ends() {
        let (mut a, mut b) = MemoryConnection::pair();
        a.send(b"x").unwrap();
        assert_eq!(b.recv().unwrap().unwrap(), b"x");

        let closer = a.try_clone().unwrap();
        closer.shutdown();
        assert!(a.recv().unwrap().is_none());
        assert!(b.recv().unwrap().is_none());
        assert!(b.send(b"y").is_err());
    }

    #[test]
    fn test_refused_device() {
        let connector = MemoryConnector::new(Arc::new(AckingDevice));
        connector.refuse(2);
        let err = connector.connect(2, ChannelKind::Control).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(connector.connect(1, ChannelKind::Control).is_ok());
    }

    #[test]
    fn test_push_without_data_channel() {
        let connector = MemoryConnector::new(Arc::new(AckingDevice));
        let message = WireMessage::JobStop(JobStopRequest {
            job_id: "j".into(),
            device_id: 0,
        });
        assert!(!connector.push_data("j", 0, message));
    }

    #[test]
    fn test_simulated_device_finishes_once() {
        let connector = MemoryConnector::new(Arc::new(AckingDevice));
        let port = connector.data_port();
        let device = SimulatedDevice::default();
        let stop = WireMessage::JobStop(JobStopRequest {
            job_id: "j".into(),
            device_id: 0,
        });
        device.request(0, &stop, &port);
        device.request(0, &stop, &port);
        assert_eq!(device.finished.lock().len(), 1);
    }
}
