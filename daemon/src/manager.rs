//! Profiling manager: the task registry and the job lifecycle around it.
//!
//! [`ProfileManager::handle`] validates a job, opens one transport per device and
//! starts a [`JobController`] for each. Controllers report their exit to a reaper
//! thread; once every controller of a job has exited the reaper joins them,
//! closes the job's transports and removes the registry entry.

use crate::audit;
use crate::controller::{ControllerError, ControllerExit, ControllerState, DeviceQuery, JobController};
use crate::metrics;
use crate::pipeline::{ChunkTarget, Fragment, PipelineError, StreamId, StreamOwner, UploadPipeline};
use crate::transport::{DataHandler, TransportChannel, TransportError, TransportRegistry};
use crate::watcher::TaskControl;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use devscope_shared::protocol::messages::{
    ChannelFinished, ChannelKind, FileChunk, JobFinished, JobStopRequest, WireMessage,
};
use devscope_shared::{DeployMode, DeviceId, JobSpec, ProfileJob, SpecError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Job option naming a device that receives every stream of the job.
pub const RELAY_DEVICE_OPTION: &str = "relay_device";

/// Stream name for the trailing payload of a `JobFinished` notice.
pub const TRAILER_STREAM: &str = "job_finished.data";

/// Upper bound on how long shutdown waits for running jobs to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("invalid job option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("device unreachable: {device}: {reason}")]
    DeviceUnreachable { device: DeviceId, reason: String },

    #[error("already running: {0}")]
    AlreadyRunning(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("internal transport failure on device {device}: {reason}")]
    Transport { device: DeviceId, reason: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("profile manager is shutting down")]
    ShuttingDown,
}

impl ManagerError {
    fn from_controller(device: DeviceId, e: ControllerError) -> Self {
        match e {
            ControllerError::UnknownDevice(device) => ManagerError::DeviceUnreachable {
                device,
                reason: "unknown device".to_string(),
            },
            ControllerError::Transport { source, .. } if source.is_link_failure() => {
                ManagerError::DeviceUnreachable {
                    device,
                    reason: source.to_string(),
                }
            }
            ControllerError::Transport { stage, source } => ManagerError::Transport {
                device,
                reason: format!("{} failed: {}", stage, source),
            },
            other => ManagerError::Internal(other.to_string()),
        }
    }

    /// Short label for metrics and status files.
    pub fn label(&self) -> &'static str {
        match self {
            ManagerError::InvalidSpec(_) | ManagerError::InvalidOption { .. } => "invalid",
            ManagerError::DeviceUnreachable { .. } => "unreachable",
            ManagerError::AlreadyRunning(_) => "already_running",
            ManagerError::NotFound(_) => "not_found",
            ManagerError::Transport { .. } => "transport",
            ManagerError::Internal(_) => "internal",
            ManagerError::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Transports and controllers are being brought up.
    Launching,
    Running,
    /// Stop was posted to every controller.
    Stopping,
    /// Every controller exited; the reaper is joining them.
    Finishing,
}

struct TaskEntry {
    job: Arc<ProfileJob>,
    state: TaskState,
    controllers: Vec<Arc<JobController>>,
    exited: HashSet<DeviceId>,
    stop_requested: bool,
    relay: Option<DeviceId>,
}

impl TaskEntry {
    fn all_exited(&self) -> bool {
        self.exited.len() >= self.job.devices.len()
    }
}

/// Point-in-time view of a registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub job_id: String,
    pub devices: Vec<DeviceId>,
    pub mode: DeployMode,
    pub state: TaskState,
    pub controllers: Vec<(DeviceId, ControllerState)>,
    pub exited: Vec<DeviceId>,
}

enum ReaperCommand {
    Check(String),
    Shutdown,
}

struct ManagerInner {
    transports: Arc<TransportRegistry>,
    pipeline: Arc<UploadPipeline>,
    devices: Arc<dyn DeviceQuery>,
    output_dir: PathBuf,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    removed: Condvar,
    exits: Sender<ControllerExit>,
    commands: Sender<ReaperCommand>,
    shutting_down: AtomicBool,
}

pub struct ProfileManager {
    inner: Arc<ManagerInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ProfileManager {
    pub fn new(
        transports: Arc<TransportRegistry>,
        pipeline: Arc<UploadPipeline>,
        devices: Arc<dyn DeviceQuery>,
        output_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let (exit_tx, exit_rx) = unbounded();
        let (cmd_tx, cmd_rx) = unbounded();
        let inner = Arc::new(ManagerInner {
            transports,
            pipeline,
            devices,
            output_dir: output_dir.into(),
            tasks: Mutex::new(HashMap::new()),
            removed: Condvar::new(),
            exits: exit_tx,
            commands: cmd_tx,
            shutting_down: AtomicBool::new(false),
        });

        let reaper_inner = Arc::clone(&inner);
        let reaper = std::thread::Builder::new()
            .name("task-reaper".to_string())
            .spawn(move || reaper_loop(reaper_inner, exit_rx, cmd_rx))?;

        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Validate `spec`, register it and start one controller per device.
    ///
    /// Returns once every device acknowledged the start sequence. On failure no
    /// registry entry, controller or transport of the job is left behind.
    pub fn handle(&self, spec: JobSpec) -> Result<(), ManagerError> {
        let job_id = spec.job_id.clone();
        let result = self.inner.handle(spec);
        match &result {
            Ok(()) => metrics::JOBS.with_label_values(&["accepted"]).inc(),
            Err(e) => {
                metrics::JOBS.with_label_values(&[e.label()]).inc();
                audit::job_rejected(&job_id, &e.to_string());
            }
        }
        result
    }

    /// Post stop to every controller of the job. Does not wait for them.
    pub fn stop_task(&self, job_id: &str) -> Result<(), ManagerError> {
        self.inner.stop_task(job_id, "api")
    }

    pub fn get_task(&self, job_id: &str) -> Option<TaskInfo> {
        let tasks = self.inner.tasks.lock();
        tasks.get(job_id).map(|entry| TaskInfo {
            job_id: entry.job.job_id.clone(),
            devices: entry.job.devices.clone(),
            mode: entry.job.mode,
            state: entry.state,
            controllers: entry
                .controllers
                .iter()
                .map(|c| (c.device(), c.state()))
                .collect(),
            exited: {
                let mut exited: Vec<_> = entry.exited.iter().copied().collect();
                exited.sort_unstable();
                exited
            },
        })
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Block until `job_id` leaves the registry. Returns false on timeout.
    pub fn wait_task(&self, job_id: &str, timeout: Duration) -> bool {
        self.inner.wait_removed(Some(job_id), timeout)
    }

    /// Completion reported by a device for a job this host no longer tracks:
    /// store the trailing payload and tell the device the host saw it.
    pub fn on_task_finished(
        &self,
        job_id: &str,
        device: DeviceId,
        payload: Vec<u8>,
    ) -> Result<(), ManagerError> {
        let channel = self.inner.transports.get(job_id, device);
        self.inner.on_task_finished(job_id, device, payload, channel)
    }

    /// The handler to pass to [`TransportRegistry::open`].
    pub fn data_handler(&self) -> Arc<dyn DataHandler> {
        Arc::new(ManagerDataHandler {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Stop and join every controller, then the reaper. New jobs are refused
    /// from the first call on.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let running = self.task_ids();
        if !running.is_empty() {
            info!("Stopping {} running jobs", running.len());
        }
        {
            let mut tasks = self.inner.tasks.lock();
            for entry in tasks.values_mut() {
                entry.stop_requested = true;
                for controller in &entry.controllers {
                    controller.stop();
                    controller.quit();
                }
            }
        }
        if !self.inner.wait_removed(None, SHUTDOWN_GRACE) {
            warn!("Jobs still registered after {:?}: {:?}", SHUTDOWN_GRACE, self.task_ids());
        }

        let _ = self.inner.commands.send(ReaperCommand::Shutdown);
        if let Some(reaper) = self.reaper.lock().take() {
            if reaper.join().is_err() {
                error!("Task reaper panicked");
            }
        }
    }
}

impl Drop for ProfileManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TaskControl for ProfileManager {
    fn handle(&self, spec: JobSpec) -> Result<(), ManagerError> {
        ProfileManager::handle(self, spec)
    }

    fn stop_task(&self, job_id: &str) -> Result<(), ManagerError> {
        self.inner.stop_task(job_id, "watcher")
    }
}

impl ManagerInner {
    fn handle(self: &Arc<Self>, spec: JobSpec) -> Result<(), ManagerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ManagerError::ShuttingDown);
        }
        let job = Arc::new(ProfileJob::from_spec(spec)?);
        for &device in &job.devices {
            if !self.devices.device_exists(device) {
                return Err(ManagerError::DeviceUnreachable {
                    device,
                    reason: "unknown device".to_string(),
                });
            }
        }
        let relay = parse_relay(&job)?;

        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&job.job_id) {
                return Err(ManagerError::AlreadyRunning(job.job_id.clone()));
            }
            tasks.insert(
                job.job_id.clone(),
                TaskEntry {
                    job: Arc::clone(&job),
                    state: TaskState::Launching,
                    controllers: Vec::new(),
                    exited: HashSet::new(),
                    stop_requested: false,
                    relay,
                },
            );
            metrics::ACTIVE_TASKS.set(tasks.len() as f64);
        }

        if let Err(e) = self.launch(&job) {
            self.abort(&job.job_id);
            return Err(e);
        }

        let stop_now = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&job.job_id) {
                Some(entry) => {
                    entry.state = TaskState::Running;
                    entry.stop_requested
                }
                None => false,
            }
        };
        audit::job_accepted(&job.job_id, &job.devices);
        if stop_now {
            self.stop_task(&job.job_id, "launch")?;
        }
        // Controllers may have exited while the entry was still launching.
        let _ = self.commands.send(ReaperCommand::Check(job.job_id.clone()));
        Ok(())
    }

    fn launch(self: &Arc<Self>, job: &Arc<ProfileJob>) -> Result<(), ManagerError> {
        let handler: Arc<dyn DataHandler> = Arc::new(ManagerDataHandler {
            inner: Arc::downgrade(self),
        });

        for &device in &job.devices {
            let transport = self
                .transports
                .open(&job.job_id, device, job.mode, Arc::clone(&handler))
                .map_err(|e| ManagerError::DeviceUnreachable {
                    device,
                    reason: e.to_string(),
                })?;

            let controller = Arc::new(JobController::new(
                job.job_id.clone(),
                device,
                job.mode,
                job.config.clone(),
                transport,
                Arc::clone(&self.pipeline),
            ));
            controller
                .init(self.devices.as_ref())
                .map_err(|e| ManagerError::from_controller(device, e))?;

            // Registered before start so a failed launch still joins it.
            if let Some(entry) = self.tasks.lock().get_mut(&job.job_id) {
                entry.controllers.push(Arc::clone(&controller));
            }
            controller
                .start(self.exits.clone())
                .map_err(|e| ManagerError::from_controller(device, e))?;
        }
        Ok(())
    }

    /// Undo a partial launch.
    fn abort(&self, job_id: &str) {
        let controllers = self
            .tasks
            .lock()
            .get(job_id)
            .map(|entry| entry.controllers.clone())
            .unwrap_or_default();
        for controller in &controllers {
            controller.stop();
        }
        for controller in &controllers {
            if let Err(e) = controller.wait() {
                warn!(job_id, device = controller.device(), "Controller join failed: {}", e);
            }
        }
        self.transports.close_job(job_id);
        self.remove(job_id);
    }

    fn remove(&self, job_id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        let removed = tasks.remove(job_id).is_some();
        metrics::ACTIVE_TASKS.set(tasks.len() as f64);
        self.removed.notify_all();
        removed
    }

    fn stop_task(&self, job_id: &str, origin: &str) -> Result<(), ManagerError> {
        let mut tasks = self.tasks.lock();
        let entry = tasks
            .get_mut(job_id)
            .ok_or_else(|| ManagerError::NotFound(job_id.to_string()))?;

        entry.stop_requested = true;
        entry.job.cancel();
        if entry.state == TaskState::Running {
            entry.state = TaskState::Stopping;
        }
        for controller in &entry.controllers {
            controller.stop();
        }
        drop(tasks);
        audit::job_stop_requested(job_id, origin);
        Ok(())
    }

    fn wait_removed(&self, job_id: Option<&str>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        loop {
            let gone = match job_id {
                Some(id) => !tasks.contains_key(id),
                None => tasks.is_empty(),
            };
            if gone {
                return true;
            }
            if self.removed.wait_until(&mut tasks, deadline).timed_out() {
                return match job_id {
                    Some(id) => !tasks.contains_key(id),
                    None => tasks.is_empty(),
                };
            }
        }
    }

    /// Record one controller exit; finish the job once all have exited.
    fn record_exit(&self, exit: ControllerExit) {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&exit.job_id) {
            Some(entry) => {
                entry.exited.insert(exit.device);
            }
            None => {
                debug!(job_id = %exit.job_id, device = exit.device, "Exit for unregistered job");
                return;
            }
        }
        drop(tasks);
        self.try_finish(&exit.job_id);
    }

    fn try_finish(&self, job_id: &str) {
        let controllers = {
            let mut tasks = self.tasks.lock();
            let entry = match tasks.get_mut(job_id) {
                Some(entry) => entry,
                None => return,
            };
            if matches!(entry.state, TaskState::Launching | TaskState::Finishing)
                || !entry.all_exited()
            {
                return;
            }
            entry.state = TaskState::Finishing;
            entry.controllers.clone()
        };

        for controller in &controllers {
            if let Err(e) = controller.wait() {
                warn!(job_id, device = controller.device(), "Controller join failed: {}", e);
            }
        }
        self.transports.close_job(job_id);
        self.remove(job_id);
        metrics::JOBS.with_label_values(&["finished"]).inc();
        audit::job_finished(job_id);
        info!(job_id, "Job finished");
    }

    fn stream_for(&self, job_id: &str, device: DeviceId, name: &str) -> StreamId {
        let relay = self
            .tasks
            .lock()
            .get(job_id)
            .and_then(|entry| entry.relay);
        let sink = match relay {
            Some(relay) if relay != device => ChunkTarget::Remote { device: relay },
            _ => ChunkTarget::File {
                path: self
                    .output_dir
                    .join(sanitize(job_id))
                    .join(format!("device_{}", device))
                    .join(sanitize(name)),
            },
        };
        StreamId::new(StreamOwner::new(job_id, device), name, sink)
    }

    fn on_task_finished(
        &self,
        job_id: &str,
        device: DeviceId,
        payload: Vec<u8>,
        channel: Option<Arc<TransportChannel>>,
    ) -> Result<(), ManagerError> {
        if !payload.is_empty() {
            let stream = self.stream_for(job_id, device, TRAILER_STREAM);
            if let Err(e) = self.pipeline.send(&stream, Fragment::new(payload).last()) {
                warn!(job_id, device, "Trailing payload upload failed: {}", e);
            }
        }

        let channel = channel.ok_or_else(|| ManagerError::Transport {
            device,
            reason: TransportError::NotConnected {
                device,
                channel: ChannelKind::Control,
            }
            .to_string(),
        })?;
        channel.send_no_wait(WireMessage::JobStop(JobStopRequest {
            job_id: job_id.to_string(),
            device_id: device,
        }));
        debug!(job_id, device, "Acknowledged finish of untracked job");
        Ok(())
    }
}

fn parse_relay(job: &ProfileJob) -> Result<Option<DeviceId>, ManagerError> {
    let raw = match job.config.get(RELAY_DEVICE_OPTION) {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let invalid = |reason: String| ManagerError::InvalidOption {
        key: RELAY_DEVICE_OPTION.to_string(),
        reason,
    };
    let device: DeviceId = raw
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{:?}: {}", raw, e)))?;
    if !job.devices.contains(&device) {
        return Err(invalid(format!("device {} is not part of the job", device)));
    }
    Ok(Some(device))
}

/// Keep a device-supplied name inside its output directory.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn reaper_loop(
    inner: Arc<ManagerInner>,
    exits: Receiver<ControllerExit>,
    commands: Receiver<ReaperCommand>,
) {
    debug!("Task reaper started");
    loop {
        select! {
            recv(exits) -> exit => match exit {
                Ok(exit) => inner.record_exit(exit),
                Err(_) => break,
            },
            recv(commands) -> command => match command {
                Ok(ReaperCommand::Check(job_id)) => inner.try_finish(&job_id),
                Ok(ReaperCommand::Shutdown) | Err(_) => break,
            },
        }
    }
    // Exits that raced with shutdown.
    while let Ok(exit) = exits.try_recv() {
        inner.record_exit(exit);
    }
    debug!("Task reaper stopped");
}

/// Routes data sub-channel traffic into the manager without keeping it alive.
struct ManagerDataHandler {
    inner: Weak<ManagerInner>,
}

impl DataHandler for ManagerDataHandler {
    fn on_file_chunk(&self, _origin: &Arc<TransportChannel>, chunk: FileChunk) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let stream = inner.stream_for(&chunk.job_id, chunk.device_id, &chunk.stream_name);
        let fragment = Fragment {
            data: chunk.data,
            start_ns: chunk.start_ns,
            end_ns: chunk.end_ns,
            is_last: chunk.is_last,
        };
        if let Err(e) = inner.pipeline.send(&stream, fragment) {
            match e {
                PipelineError::Closed => debug!("Dropping chunk of {}: pipeline closed", stream),
                e => warn!("Dropping chunk of {}: {}", stream, e),
            }
        }
    }

    fn on_channel_finished(&self, _origin: &Arc<TransportChannel>, notice: ChannelFinished) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let stream = inner.stream_for(&notice.job_id, notice.device_id, &notice.stream_name);
        if let Err(e) = inner.pipeline.finish_stream(&stream) {
            warn!("Cannot finish {}: {}", stream, e);
        }
    }

    fn on_job_finished(&self, origin: &Arc<TransportChannel>, notice: JobFinished) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let controller = inner.tasks.lock().get(&notice.job_id).and_then(|entry| {
            entry
                .controllers
                .iter()
                .find(|c| c.device() == notice.device_id)
                .cloned()
        });

        match controller {
            Some(controller) => {
                info!(
                    job_id = %notice.job_id,
                    device = notice.device_id,
                    "Device reported job finished"
                );
                if !notice.payload.is_empty() {
                    let stream = inner.stream_for(&notice.job_id, notice.device_id, TRAILER_STREAM);
                    if let Err(e) = inner.pipeline.send(&stream, Fragment::new(notice.payload).last()) {
                        warn!("Trailing payload upload failed: {}", e);
                    }
                }
                controller.stop();
            }
            None => {
                if let Err(e) = inner.on_task_finished(
                    &notice.job_id,
                    notice.device_id,
                    notice.payload,
                    Some(Arc::clone(origin)),
                ) {
                    warn!(job_id = %notice.job_id, "Finish handling failed: {}", e);
                }
            }
        }
    }
}
