//! Transport channel: handshake, synchronous requests, and the data receive loop.

use super::{Connection, Connector, DataHandler, TransportError};
use crate::config::TransportConfig;
use crate::metrics;
use crate::retry::retry_with_fixed_delay;
use devscope_shared::protocol::messages::{
    ChannelKind, HandshakeRequest, ResponseEnvelope, WireMessage,
};
use devscope_shared::protocol::wire::FrameCodec;
use devscope_shared::{DeployMode, DeviceId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
    Failed,
}

/// Identity a channel presents in its handshakes.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub job_id: String,
    pub device: DeviceId,
    pub mode: DeployMode,
    pub host: String,
}

pub struct TransportChannel {
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    codec: FrameCodec,
    handshake_attempts: u32,
    handshake_interval: Duration,

    state: Mutex<ChannelState>,
    closed: AtomicBool,

    // Held for the whole request/response exchange: one request in flight.
    control: Mutex<Option<Box<dyn Connection>>>,
    control_closer: Mutex<Option<Box<dyn Connection>>>,

    // Parked here until the receive loop takes ownership.
    data: Mutex<Option<Box<dyn Connection>>>,
    data_closer: Mutex<Option<Box<dyn Connection>>>,
    data_ready: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("job_id", &self.settings.job_id)
            .field("device", &self.settings.device)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportChannel {
    pub fn new(
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
        config: &TransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            connector,
            codec: config.codec(),
            handshake_attempts: config.handshake_attempts,
            handshake_interval: config.handshake_interval(),
            state: Mutex::new(ChannelState::Uninitialized),
            closed: AtomicBool::new(false),
            control: Mutex::new(None),
            control_closer: Mutex::new(None),
            data: Mutex::new(None),
            data_closer: Mutex::new(None),
            data_ready: AtomicBool::new(false),
            receiver: Mutex::new(None),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.settings.device
    }

    pub fn job_id(&self) -> &str {
        &self.settings.job_id
    }

    pub fn mode(&self) -> DeployMode {
        self.settings.mode
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            return ChannelState::Closed;
        }
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True while the data receive loop owns a live connection.
    pub fn data_ready(&self) -> bool {
        self.data_ready.load(Ordering::Acquire)
    }

    /// Open and handshake both sub-channels.
    ///
    /// The control handshake is retried with a fixed delay; the data handshake is
    /// attempted once. Any failure leaves both sub-channels unopened.
    pub fn init(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.device()));
        }
        if *self.state.lock() == ChannelState::Ready {
            return Ok(());
        }

        self.reset();
        *self.state.lock() = ChannelState::Handshaking;
        debug!(
            job_id = %self.settings.job_id,
            device = self.device(),
            "Handshaking"
        );

        let control = retry_with_fixed_delay(
            "control handshake",
            self.handshake_attempts,
            self.handshake_interval,
            |_| self.open_sub_channel(ChannelKind::Control),
        );
        let control = match control {
            Ok(conn) => conn,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };

        let data = match self.open_sub_channel(ChannelKind::Data) {
            Ok(conn) => conn,
            Err(e) => {
                control.shutdown();
                self.fail();
                return Err(e);
            }
        };

        *self.control_closer.lock() = clone_for_shutdown(control.as_ref(), ChannelKind::Control);
        *self.data_closer.lock() = clone_for_shutdown(data.as_ref(), ChannelKind::Data);
        *self.control.lock() = Some(control);
        *self.data.lock() = Some(data);
        self.data_ready.store(true, Ordering::Release);
        *self.state.lock() = ChannelState::Ready;

        info!(
            job_id = %self.settings.job_id,
            device = self.device(),
            mode = %self.settings.mode,
            "Transport channel ready"
        );
        Ok(())
    }

    fn open_sub_channel(&self, kind: ChannelKind) -> Result<Box<dyn Connection>, TransportError> {
        let result = self.handshake(kind);
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::HANDSHAKES
            .with_label_values(&[&kind.to_string(), label])
            .inc();
        result
    }

    fn handshake(&self, kind: ChannelKind) -> Result<Box<dyn Connection>, TransportError> {
        let device = self.device();
        let io_err = |source| TransportError::Io {
            device,
            channel: kind,
            source,
        };

        let mut conn = self.connector.connect(device, kind).map_err(io_err)?;
        let hello = WireMessage::Handshake(HandshakeRequest {
            device_id: device,
            job_id: self.settings.job_id.clone(),
            mode: self.settings.mode.to_string(),
            channel: kind,
            host: self.settings.host.clone(),
        })
        .encode(&self.codec)?;

        conn.send(&hello).map_err(io_err)?;
        let packet = conn
            .recv()
            .map_err(io_err)?
            .ok_or(TransportError::PeerClosed {
                device,
                channel: kind,
            })?;

        match WireMessage::decode(&self.codec, &packet)? {
            WireMessage::Response(resp) if resp.status.is_success() => Ok(conn),
            WireMessage::Response(resp) => {
                conn.shutdown();
                Err(TransportError::Handshake {
                    device,
                    channel: kind,
                    info: resp.status.info,
                })
            }
            other => {
                conn.shutdown();
                Err(TransportError::UnexpectedMessage {
                    device,
                    kind: other.kind().to_string(),
                })
            }
        }
    }

    /// Drop both sub-channels back to unopened.
    fn reset(&self) {
        if let Some(closer) = self.control_closer.lock().take() {
            closer.shutdown();
        }
        if let Some(closer) = self.data_closer.lock().take() {
            closer.shutdown();
        }
        self.control.lock().take();
        self.data.lock().take();
        self.data_ready.store(false, Ordering::Release);
        self.join_receiver();
    }

    fn fail(&self) {
        self.reset();
        *self.state.lock() = ChannelState::Failed;
    }

    /// Send a control request and block for exactly one response.
    ///
    /// A non-success status comes back as [`TransportError::Rejected`] and leaves
    /// the channel usable; a link failure marks the control sub-channel unopened.
    pub fn send_request(&self, message: &WireMessage) -> Result<ResponseEnvelope, TransportError> {
        let kind = message.kind();
        let started = Instant::now();
        let result = self.exchange(message);

        let label = match &result {
            Ok(_) => "ok",
            Err(TransportError::Rejected { .. }) => "rejected",
            Err(_) => "error",
        };
        metrics::CONTROL_REQUESTS
            .with_label_values(&[kind.name(), label])
            .inc();
        metrics::CONTROL_LATENCY.observe(started.elapsed().as_secs_f64());
        result
    }

    fn exchange(&self, message: &WireMessage) -> Result<ResponseEnvelope, TransportError> {
        let device = self.device();
        if self.is_closed() {
            return Err(TransportError::Closed(device));
        }
        let frame = message.encode(&self.codec)?;

        let packet = {
            let mut control = self.control.lock();
            if self.is_closed() {
                return Err(TransportError::Closed(device));
            }
            let conn = control.as_mut().ok_or(TransportError::NotConnected {
                device,
                channel: ChannelKind::Control,
            })?;

            let received = conn.send(&frame).and_then(|_| conn.recv());
            match received {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    control.take();
                    self.mark_control_lost();
                    return Err(TransportError::PeerClosed {
                        device,
                        channel: ChannelKind::Control,
                    });
                }
                Err(source) => {
                    control.take();
                    self.mark_control_lost();
                    return Err(TransportError::Io {
                        device,
                        channel: ChannelKind::Control,
                        source,
                    });
                }
            }
        };

        let response = match WireMessage::decode(&self.codec, &packet) {
            Ok(WireMessage::Response(resp)) => resp,
            Ok(other) => {
                return Err(TransportError::UnexpectedMessage {
                    device,
                    kind: other.kind().to_string(),
                })
            }
            Err(e) => {
                metrics::FRAMES_REJECTED.with_label_values(&["control"]).inc();
                return Err(e.into());
            }
        };

        if !response.status.is_success() {
            return Err(TransportError::Rejected {
                device,
                kind: message.kind().to_string(),
                info: response.status.info,
            });
        }
        Ok(response)
    }

    fn mark_control_lost(&self) {
        self.control_closer.lock().take();
        if !self.is_closed() {
            warn!(
                job_id = %self.settings.job_id,
                device = self.device(),
                "Control sub-channel lost"
            );
            *self.state.lock() = ChannelState::Failed;
        }
    }

    /// Issue a request from a detached thread; the caller does not wait.
    pub fn send_no_wait(self: &Arc<Self>, message: WireMessage) {
        let channel = Arc::clone(self);
        let kind = message.kind();
        let thread_kind = kind.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("nowait-{}", self.device()))
            .spawn(move || {
                if let Err(e) = channel.send_request(&message) {
                    warn!(
                        job_id = %channel.job_id(),
                        device = channel.device(),
                        "{} (no wait) failed: {}",
                        thread_kind,
                        e
                    );
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn request thread for {}: {}", kind, e);
        }
    }

    /// Round-trip a liveness probe; the device echoes the bytes in the response body.
    pub fn ping(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send_request(&WireMessage::Ping(payload.to_vec()))
            .map(|resp| resp.body)
    }

    /// Hand the data sub-channel to a receive thread that dispatches to `handler`.
    pub fn start_receiving(
        self: &Arc<Self>,
        handler: Arc<dyn DataHandler>,
    ) -> Result<(), TransportError> {
        let conn = self.data.lock().take().ok_or(TransportError::NotConnected {
            device: self.device(),
            channel: ChannelKind::Data,
        })?;

        let channel = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("data-rx-{}", self.device()))
            .spawn(move || channel.receive_loop(conn, handler))
            .map_err(|source| TransportError::Io {
                device: self.device(),
                channel: ChannelKind::Data,
                source,
            })?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    fn receive_loop(self: Arc<Self>, mut conn: Box<dyn Connection>, handler: Arc<dyn DataHandler>) {
        debug!(job_id = %self.settings.job_id, device = self.device(), "Data receive loop started");
        while !self.is_closed() {
            match conn.recv() {
                Ok(Some(packet)) => match WireMessage::decode(&self.codec, &packet) {
                    Ok(message) => self.dispatch(message, handler.as_ref()),
                    Err(e) => {
                        metrics::FRAMES_REJECTED.with_label_values(&["data"]).inc();
                        warn!(device = self.device(), "Dropping data frame: {}", e);
                    }
                },
                Ok(None) => {
                    info!(device = self.device(), "Device ended the data stream");
                    break;
                }
                Err(e) => {
                    if !self.is_closed() {
                        warn!(device = self.device(), "Data receive failed: {}", e);
                    }
                    break;
                }
            }
        }
        self.data_ready.store(false, Ordering::Release);
        debug!(job_id = %self.settings.job_id, device = self.device(), "Data receive loop exited");
    }

    fn dispatch(self: &Arc<Self>, message: WireMessage, handler: &dyn DataHandler) {
        let kind = message.kind();
        metrics::DATA_MESSAGES.with_label_values(&[kind.name()]).inc();
        match message {
            WireMessage::FileChunk(chunk) => handler.on_file_chunk(self, chunk),
            WireMessage::ChannelFinished(notice) => handler.on_channel_finished(self, notice),
            WireMessage::JobFinished(notice) => handler.on_job_finished(self, notice),
            _ => warn!(device = self.device(), "Unexpected {} on data channel", kind),
        }
    }

    fn join_receiver(&self) {
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(device = self.device(), "Data receive thread panicked");
            }
        }
    }

    /// Mark the channel closed and release both sub-channels. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = ChannelState::Closed;

        // Shut down first so a request blocked in recv() gives up the lock.
        if let Some(closer) = self.control_closer.lock().take() {
            closer.shutdown();
        }
        if let Some(closer) = self.data_closer.lock().take() {
            closer.shutdown();
        }
        self.control.lock().take();
        self.data.lock().take();
        self.data_ready.store(false, Ordering::Release);
        self.join_receiver();

        debug!(job_id = %self.settings.job_id, device = self.device(), "Transport channel closed");
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(closer) = self.control_closer.get_mut().take() {
            closer.shutdown();
        }
        if let Some(closer) = self.data_closer.get_mut().take() {
            closer.shutdown();
        }
    }
}

fn clone_for_shutdown(conn: &dyn Connection, kind: ChannelKind) -> Option<Box<dyn Connection>> {
    match conn.try_clone() {
        Ok(clone) => Some(clone),
        Err(e) => {
            warn!("Cannot clone {} connection for shutdown: {}", kind, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{AckingDevice, DeviceBehavior, MemoryConnector};
    use devscope_shared::protocol::messages::{JobStopRequest, StatusInfo};
    use devscope_shared::protocol::wire::MessageKind;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            handshake_attempts: 5,
            handshake_interval_ms: 1,
            ..TransportConfig::default()
        }
    }

    fn settings(device: DeviceId) -> ChannelSettings {
        ChannelSettings {
            job_id: "job-1".into(),
            device,
            mode: DeployMode::Rpc,
            host: "test-host".into(),
        }
    }

    /// Fails the first `failures` control handshakes.
    struct FlakyHandshake {
        failures: AtomicU32,
        seen: AtomicU32,
    }

    impl DeviceBehavior for FlakyHandshake {
        fn handshake(&self, device: DeviceId, request: &HandshakeRequest) -> StatusInfo {
            if request.channel == ChannelKind::Control {
                self.seen.fetch_add(1, Ordering::SeqCst);
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return StatusInfo::error(device, "not ready");
                }
            }
            StatusInfo::success(device)
        }
    }

    /// Rejects every data handshake.
    struct NoData {
        data_attempts: AtomicU32,
    }

    impl DeviceBehavior for NoData {
        fn handshake(&self, device: DeviceId, request: &HandshakeRequest) -> StatusInfo {
            if request.channel == ChannelKind::Data {
                self.data_attempts.fetch_add(1, Ordering::SeqCst);
                return StatusInfo::error(device, "data busy");
            }
            StatusInfo::success(device)
        }
    }

    #[test]
    fn test_init_succeeds_on_fifth_attempt() {
        let behavior = Arc::new(FlakyHandshake {
            failures: AtomicU32::new(4),
            seen: AtomicU32::new(0),
        });
        let connector = Arc::new(MemoryConnector::new(behavior.clone()));
        let channel = TransportChannel::new(settings(0), connector, &fast_config());

        channel.init().unwrap();
        assert_eq!(channel.state(), ChannelState::Ready);
        assert!(channel.data_ready());
        assert_eq!(behavior.seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_init_gives_up_after_attempts() {
        let behavior = Arc::new(FlakyHandshake {
            failures: AtomicU32::new(5),
            seen: AtomicU32::new(0),
        });
        let connector = Arc::new(MemoryConnector::new(behavior.clone()));
        let channel = TransportChannel::new(settings(0), connector, &fast_config());

        let err = channel.init().unwrap_err();
        assert!(matches!(err, TransportError::Handshake { .. }));
        assert_eq!(channel.state(), ChannelState::Failed);
        assert!(!channel.data_ready());
        assert!(matches!(
            channel.send_request(&WireMessage::Ping(vec![])),
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_data_handshake_is_not_retried() {
        let behavior = Arc::new(NoData {
            data_attempts: AtomicU32::new(0),
        });
        let connector = Arc::new(MemoryConnector::new(behavior.clone()));
        let channel = TransportChannel::new(settings(0), connector, &fast_config());

        assert!(channel.init().is_err());
        assert_eq!(behavior.data_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Failed);
    }

    #[test]
    fn test_unreachable_device() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(AckingDevice)));
        connector.refuse(3);
        let channel = TransportChannel::new(settings(3), connector, &fast_config());
        assert!(matches!(channel.init(), Err(TransportError::Io { .. })));
    }

    #[test]
    fn test_request_and_ping() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(AckingDevice)));
        let channel = TransportChannel::new(settings(1), connector.clone(), &fast_config());
        channel.init().unwrap();

        let resp = channel
            .send_request(&WireMessage::JobStop(JobStopRequest {
                job_id: "job-1".into(),
                device_id: 1,
            }))
            .unwrap();
        assert!(resp.status.is_success());
        assert_eq!(channel.ping(b"hello").unwrap(), b"hello");
        assert_eq!(connector.requests(1).len(), 2);
    }

    #[test]
    fn test_send_no_wait_reaches_device() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(AckingDevice)));
        let channel = TransportChannel::new(settings(2), connector.clone(), &fast_config());
        channel.init().unwrap();

        channel.send_no_wait(WireMessage::JobStop(JobStopRequest {
            job_id: "job-1".into(),
            device_id: 2,
        }));

        let deadline = Instant::now() + Duration::from_secs(5);
        while connector.requests(2).is_empty() {
            assert!(Instant::now() < deadline, "request never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(connector.requests(2)[0].kind(), MessageKind::JobStop);
    }

    #[test]
    fn test_closed_channel_fails_fast() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(AckingDevice)));
        let channel = TransportChannel::new(settings(1), connector.clone(), &fast_config());
        channel.init().unwrap();
        channel.close();
        channel.close();

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send_request(&WireMessage::Ping(vec![])),
            Err(TransportError::Closed(1))
        ));
        assert!(connector.requests(1).is_empty());
        assert!(matches!(channel.init(), Err(TransportError::Closed(1))));
    }
}
