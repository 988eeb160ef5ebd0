//! Per-device job controllers.
//!
//! A [`JobController`] owns one OS thread that starts profiling on its device,
//! sleeps on a [`StopSignal`] until told to stop (or to quit), then stops
//! profiling and reports its exit.

pub mod adapter;
pub mod device;
pub mod signal;

pub use adapter::{JobAdapter, ProfParams};
pub use device::{DeviceCapabilities, DeviceQuery, StaticDeviceQuery};
pub use signal::{StopSignal, WakeReason};

use crate::pipeline::{StreamOwner, UploadPipeline};
use crate::transport::{TransportChannel, TransportError};
use crossbeam_channel::{bounded, Sender};
use devscope_shared::{DeployMode, DeviceId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Initialized,
    Started,
    AwaitingStop,
    Stopped,
    Exited,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("controller is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ControllerState,
        actual: ControllerState,
    },

    #[error("{stage} failed: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("failed to spawn controller thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("controller thread exited before reporting start")]
    ThreadLost,

    #[error("controller thread panicked")]
    Panicked,
}

/// Sent once per controller when its thread is about to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerExit {
    pub job_id: String,
    pub device: DeviceId,
    /// Whether the start sequence was acknowledged.
    pub started: bool,
}

pub struct JobController {
    job_id: String,
    device: DeviceId,
    adapter: JobAdapter,
    config: BTreeMap<String, String>,
    transport: Arc<TransportChannel>,
    pipeline: Arc<UploadPipeline>,
    signal: Arc<StopSignal>,
    state: Arc<Mutex<ControllerState>>,
    params: Mutex<Option<ProfParams>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("job_id", &self.job_id)
            .field("device", &self.device)
            .field("adapter", &self.adapter)
            .field("state", &self.state())
            .finish()
    }
}

impl JobController {
    pub fn new(
        job_id: impl Into<String>,
        device: DeviceId,
        mode: DeployMode,
        config: BTreeMap<String, String>,
        transport: Arc<TransportChannel>,
        pipeline: Arc<UploadPipeline>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            device,
            adapter: JobAdapter::for_device(mode),
            config,
            transport,
            pipeline,
            signal: Arc::new(StopSignal::new()),
            state: Arc::new(Mutex::new(ControllerState::Created)),
            params: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn expect_state(&self, expected: ControllerState) -> Result<(), ControllerError> {
        let actual = self.state();
        if actual != expected {
            return Err(ControllerError::InvalidState { expected, actual });
        }
        Ok(())
    }

    /// Validate the device and resolve the replay payload.
    pub fn init(&self, query: &dyn DeviceQuery) -> Result<(), ControllerError> {
        self.expect_state(ControllerState::Created)?;
        let params = self
            .adapter
            .resolve_params(query, &self.job_id, self.device, &self.config)?;
        *self.params.lock() = Some(params);
        *self.state.lock() = ControllerState::Initialized;
        Ok(())
    }

    /// Spawn the controller thread and block until the device acknowledged (or
    /// refused) the start sequence. `exits` receives a [`ControllerExit`] when
    /// the thread finishes, whatever the outcome.
    pub fn start(&self, exits: Sender<ControllerExit>) -> Result<(), ControllerError> {
        self.expect_state(ControllerState::Initialized)?;
        let params = self
            .params
            .lock()
            .clone()
            .ok_or(ControllerError::InvalidState {
                expected: ControllerState::Initialized,
                actual: ControllerState::Created,
            })?;

        let (started_tx, started_rx) = bounded(1);
        let run = Run {
            adapter: self.adapter,
            params,
            transport: Arc::clone(&self.transport),
            signal: Arc::clone(&self.signal),
            state: Arc::clone(&self.state),
        };
        *self.state.lock() = ControllerState::Started;

        let handle = std::thread::Builder::new()
            .name(format!("ctl-{}-{}", self.job_id, self.device))
            .spawn(move || run.run(started_tx, exits))
            .map_err(|e| {
                *self.state.lock() = ControllerState::Exited;
                ControllerError::Spawn(e)
            })?;
        *self.thread.lock() = Some(handle);

        match started_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(ControllerError::ThreadLost),
        }
    }

    /// Post the stop signal. Idempotent; returns true for the first call.
    pub fn stop(&self) -> bool {
        let first = self.signal.post_stop();
        if first {
            debug!(job_id = %self.job_id, device = self.device, "Stop posted");
        }
        first
    }

    /// Wake the thread for shutdown without a stop request.
    pub fn quit(&self) {
        self.signal.quit();
    }

    /// Join the controller thread, then flush this device's streams.
    pub fn wait(&self) -> Result<(), ControllerError> {
        let handle = self.thread.lock().take();
        let joined = match handle {
            Some(handle) => handle.join().map_err(|_| ControllerError::Panicked),
            None => Ok(()),
        };
        if joined.is_err() {
            *self.state.lock() = ControllerState::Exited;
        }
        self.pipeline
            .flush_owner(&StreamOwner::new(self.job_id.clone(), self.device));
        joined
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }
}

/// State moved onto the controller thread.
struct Run {
    adapter: JobAdapter,
    params: ProfParams,
    transport: Arc<TransportChannel>,
    signal: Arc<StopSignal>,
    state: Arc<Mutex<ControllerState>>,
}

impl Run {
    fn run(
        self,
        started: Sender<Result<(), ControllerError>>,
        exits: Sender<ControllerExit>,
    ) {
        let job_id = self.params.job_id.clone();
        let device = self.params.device;

        let was_started = match self.adapter.start_prof(&self.transport, &self.params) {
            Ok(()) => {
                *self.state.lock() = ControllerState::AwaitingStop;
                info!(job_id = %job_id, device, "Profiling started");
                let _ = started.send(Ok(()));
                true
            }
            Err(e) => {
                *self.state.lock() = ControllerState::Exited;
                error!(job_id = %job_id, device, "Profiling start failed: {}", e);
                let _ = started.send(Err(e));
                false
            }
        };

        if was_started {
            let reason = self.signal.wait();
            debug!(job_id = %job_id, device, ?reason, "Controller woke");
            match self.adapter.stop_prof(&self.transport, &job_id, device) {
                Ok(()) => {
                    *self.state.lock() = ControllerState::Stopped;
                    info!(job_id = %job_id, device, "Profiling stopped");
                }
                Err(e) => warn!(job_id = %job_id, device, "Profiling stop failed: {}", e),
            }
            *self.state.lock() = ControllerState::Exited;
        }

        let _ = exits.send(ControllerExit {
            job_id,
            device,
            started: was_started,
        });
    }
}
