//! Filesystem-driven job lifecycle for disconnected deployments.
//!
//! Jobs are started, kept alive and stopped by sentinel files named
//! `<jobId>_<kind>` in the watched root. A `start` sentinel registers a
//! [`WatchedJobEntry`], adds a sub-watch on `<root>/<jobId>/` and launches the
//! job from a short-lived lifecycle thread. `stop`/`done` sentinels, or a
//! heartbeat older than the timeout, stop the job and drop the entry.

pub mod sentinel;

pub use sentinel::{SentinelEvent, SentinelKind, StartPayload, Trigger};

use crate::audit;
use crate::config::WatcherConfig;
use crate::manager::ManagerError;
use crate::metrics;
use crate::pipeline::LocalStorage;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use devscope_shared::utils::time::rfc3339_now;
use devscope_shared::{DeviceId, JobSpec};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Configuration key the `uuid` sentinel payload is forwarded under.
pub const UUID_OPTION: &str = "uuid";

/// Job control surface the watcher drives.
pub trait TaskControl: Send + Sync {
    fn handle(&self, spec: JobSpec) -> Result<(), ManagerError>;

    fn stop_task(&self, job_id: &str) -> Result<(), ManagerError>;
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher root is not configured")]
    NoRoot,

    #[error("cannot prepare {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Per-job state kept between sentinel events.
#[derive(Debug, Clone)]
pub struct WatchedJobEntry {
    pub job_id: String,
    pub device_id: DeviceId,
    pub watched_path: PathBuf,
    pub last_heartbeat: Instant,
    pub is_started: bool,
    pub uuid: Option<String>,
    pub payload: StartPayload,
}

/// Filesystem watch changes requested by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    AddWatch(PathBuf),
    RemoveWatch(PathBuf),
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    job_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    info: String,
    time: String,
}

/// Sentinel state machine, independent of the notify event source.
pub struct LifecycleCore {
    root: PathBuf,
    heartbeat_timeout: Duration,
    control: Arc<dyn TaskControl>,
    storage: Arc<LocalStorage>,
    entries: Arc<Mutex<HashMap<String, WatchedJobEntry>>>,
    /// uuids seen before their start sentinel, with arrival time.
    pending_uuids: Mutex<HashMap<String, (String, Instant)>>,
    deferred: Arc<Mutex<Vec<WatchAction>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleCore {
    pub fn new(
        root: impl Into<PathBuf>,
        heartbeat_timeout: Duration,
        control: Arc<dyn TaskControl>,
        storage: Arc<LocalStorage>,
    ) -> Self {
        Self {
            root: root.into(),
            heartbeat_timeout,
            control,
            storage,
            entries: Arc::new(Mutex::new(HashMap::new())),
            pending_uuids: Mutex::new(HashMap::new()),
            deferred: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn entry(&self, job_id: &str) -> Option<WatchedJobEntry> {
        self.entries.lock().get(job_id).cloned()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if `path` is one of the per-job directories the core created.
    fn is_job_dir(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| entry.watched_path == path)
    }

    /// Apply one sentinel event.
    pub fn process(&self, event: SentinelEvent, now: Instant) -> Vec<WatchAction> {
        metrics::WATCHER_EVENTS
            .with_label_values(&[event.kind.as_str()])
            .inc();
        match event.kind {
            SentinelKind::Start => self.on_start(event, now),
            SentinelKind::Stop | SentinelKind::Done => self.on_stop(event),
            SentinelKind::Beat => {
                self.on_beat(event, now);
                Vec::new()
            }
            SentinelKind::Uuid => {
                self.on_uuid(event, now);
                Vec::new()
            }
        }
    }

    fn read_payload(&self, event: &SentinelEvent) -> Option<String> {
        match self.storage.read_to_string(&event.path) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(text),
            Err(e) => {
                debug!(job_id = %event.job_id, "Sentinel payload unreadable: {}", e);
                None
            }
        }
    }

    fn on_start(&self, event: SentinelEvent, now: Instant) -> Vec<WatchAction> {
        if event.trigger == Trigger::Written {
            return Vec::new();
        }
        if self.entries.lock().contains_key(&event.job_id) {
            debug!(job_id = %event.job_id, "Start sentinel for a watched job");
            return Vec::new();
        }
        // Creation may be seen before the writer is done; the close event follows.
        let Some(text) = self.read_payload(&event) else {
            return Vec::new();
        };

        let payload = match StartPayload::parse(&text) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = format!("invalid start payload: {}", e);
                audit::sentinel_ignored(&event.job_id, "start", &reason);
                self.write_status(&event.job_id, Err(("invalid", reason)));
                return Vec::new();
            }
        };
        if let Err(e) = devscope_shared::validate_job_id(&event.job_id) {
            let reason = e.to_string();
            audit::sentinel_ignored(&event.job_id, "start", &reason);
            self.write_status(&event.job_id, Err(("invalid", reason)));
            return Vec::new();
        }

        let watched_path = self.job_dir(&event.job_id);
        if let Err(e) = self.storage.create_dir(&watched_path) {
            warn!(job_id = %event.job_id, "Cannot create job directory: {}", e);
            return Vec::new();
        }

        let uuid = self
            .pending_uuids
            .lock()
            .remove(&event.job_id)
            .map(|(uuid, _)| uuid);
        let entry = WatchedJobEntry {
            job_id: event.job_id.clone(),
            device_id: payload.device_id,
            watched_path: watched_path.clone(),
            last_heartbeat: now,
            is_started: false,
            uuid,
            payload,
        };
        info!(job_id = %entry.job_id, device = entry.device_id, "Start sentinel accepted");
        // The lifecycle thread updates the entry, so it must be visible first.
        self.entries.lock().insert(event.job_id.clone(), entry.clone());
        self.spawn_lifecycle(&entry);
        vec![WatchAction::AddWatch(watched_path)]
    }

    fn spawn_lifecycle(&self, entry: &WatchedJobEntry) {
        let mut spec = JobSpec::new(entry.job_id.clone(), vec![entry.device_id]);
        if let Some(mode) = entry.payload.mode {
            spec = spec.with_mode(mode);
        }
        spec.config = entry.payload.string_config();
        if let Some(uuid) = &entry.uuid {
            spec.config.insert(UUID_OPTION.to_string(), uuid.clone());
        }

        let control = Arc::clone(&self.control);
        let storage = Arc::clone(&self.storage);
        let entries = Arc::clone(&self.entries);
        let deferred = Arc::clone(&self.deferred);
        let status_path = self.root.join(sentinel::status_file_name(&entry.job_id));
        let job_id = entry.job_id.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("lifecycle-{}", job_id))
            .spawn(move || {
                let result = control.handle(spec);
                let report = match &result {
                    Ok(()) => {
                        let watched = match entries.lock().get_mut(&job_id) {
                            Some(entry) => {
                                entry.is_started = true;
                                true
                            }
                            None => false,
                        };
                        if watched {
                            status_report(&job_id, Ok(()))
                        } else {
                            // A stop or done sentinel won the race with the launch.
                            info!(job_id = %job_id, "Job stopped while starting");
                            match control.stop_task(&job_id) {
                                Ok(()) | Err(ManagerError::NotFound(_)) => {}
                                Err(e) => warn!(job_id = %job_id, "Stop failed: {}", e),
                            }
                            status_report(
                                &job_id,
                                Err(("stopped", "stopped before the start completed".to_string())),
                            )
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job_id, "Job start from sentinel failed: {}", e);
                        if let Some(entry) = entries.lock().remove(&job_id) {
                            deferred.lock().push(WatchAction::RemoveWatch(entry.watched_path));
                        }
                        status_report(&job_id, Err((e.label(), e.to_string())))
                    }
                };
                if let Err(e) = storage.write_file(&status_path, report.as_bytes()) {
                    warn!(job_id = %job_id, "Cannot write status file: {}", e);
                }
            });

        match spawned {
            Ok(handle) => {
                let mut tasks = self.tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
            Err(e) => error!(job_id = %entry.job_id, "Cannot spawn lifecycle task: {}", e),
        }
    }

    fn on_stop(&self, event: SentinelEvent) -> Vec<WatchAction> {
        if event.trigger != Trigger::Created {
            return Vec::new();
        }
        let removed = self.entries.lock().remove(&event.job_id);
        match removed {
            Some(entry) => {
                info!(job_id = %entry.job_id, "{} sentinel, stopping job", event.kind);
                self.stop(&entry.job_id);
                vec![WatchAction::RemoveWatch(entry.watched_path)]
            }
            None => {
                self.pending_uuids.lock().remove(&event.job_id);
                audit::sentinel_ignored(&event.job_id, event.kind.as_str(), "no watched job");
                Vec::new()
            }
        }
    }

    fn on_beat(&self, event: SentinelEvent, now: Instant) {
        match self.entries.lock().get_mut(&event.job_id) {
            Some(entry) => entry.last_heartbeat = now,
            None => debug!(job_id = %event.job_id, "Heartbeat for unwatched job"),
        }
    }

    fn on_uuid(&self, event: SentinelEvent, now: Instant) {
        if event.trigger == Trigger::Written {
            return;
        }
        let Some(text) = self.read_payload(&event) else {
            return;
        };
        let uuid = text.trim().to_string();
        let mut entries = self.entries.lock();
        match entries.get_mut(&event.job_id) {
            Some(entry) => {
                if entry.is_started {
                    debug!(job_id = %event.job_id, "uuid arrived after the job started");
                }
                entry.uuid = Some(uuid);
            }
            None => {
                self.pending_uuids.lock().insert(event.job_id, (uuid, now));
            }
        }
    }

    fn stop(&self, job_id: &str) {
        match self.control.stop_task(job_id) {
            Ok(()) => {}
            Err(ManagerError::NotFound(_)) => debug!(job_id, "Job already gone"),
            Err(e) => warn!(job_id, "Stop failed: {}", e),
        }
    }

    /// Stop every job whose last heartbeat is older than the timeout. uuids
    /// that waited that long for a start sentinel are dropped too.
    pub fn sweep(&self, now: Instant) -> Vec<WatchAction> {
        self.pending_uuids.lock().retain(|job_id, (_, seen)| {
            let keep = now.saturating_duration_since(*seen) <= self.heartbeat_timeout;
            if !keep {
                debug!(job_id = %job_id, "Dropping uuid without a start sentinel");
            }
            keep
        });

        let stale: Vec<WatchedJobEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .values()
                .filter(|e| now.saturating_duration_since(e.last_heartbeat) > self.heartbeat_timeout)
                .map(|e| e.job_id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        stale
            .into_iter()
            .map(|entry| {
                warn!(
                    job_id = %entry.job_id,
                    "No heartbeat for {:?}, stopping job",
                    now.saturating_duration_since(entry.last_heartbeat)
                );
                self.stop(&entry.job_id);
                WatchAction::RemoveWatch(entry.watched_path)
            })
            .collect()
    }

    /// Watch changes queued by lifecycle threads.
    pub fn take_deferred(&self) -> Vec<WatchAction> {
        std::mem::take(&mut *self.deferred.lock())
    }

    pub fn join_tasks(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if task.join().is_err() {
                error!("Lifecycle task panicked");
            }
        }
    }

    fn write_status(&self, job_id: &str, result: Result<(), (&str, String)>) {
        let path = self.root.join(sentinel::status_file_name(job_id));
        let report = status_report(job_id, result);
        if let Err(e) = self.storage.write_file(&path, report.as_bytes()) {
            warn!(job_id, "Cannot write status file: {}", e);
        }
    }
}

fn status_report(job_id: &str, result: Result<(), (&str, String)>) -> String {
    let report = match &result {
        Ok(()) => StatusReport {
            job_id,
            status: "success",
            reason: None,
            info: String::new(),
            time: rfc3339_now(),
        },
        Err((reason, info)) => StatusReport {
            job_id,
            status: "error",
            reason: Some(reason),
            info: info.clone(),
            time: rfc3339_now(),
        },
    };
    serde_json::to_string(&report).unwrap_or_default()
}

/// Owns the notify watcher and the thread that drives [`LifecycleCore`].
pub struct LifecycleWatcher {
    core: Arc<LifecycleCore>,
    shutdown: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleWatcher {
    pub fn start(
        config: &WatcherConfig,
        control: Arc<dyn TaskControl>,
        storage: Arc<LocalStorage>,
    ) -> Result<Self, WatcherError> {
        let root = config.root.clone().ok_or(WatcherError::NoRoot)?;
        std::fs::create_dir_all(&root).map_err(|source| WatcherError::Io {
            path: root.clone(),
            source,
        })?;

        let (event_tx, event_rx) = unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = event_tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;

        let core = Arc::new(LifecycleCore::new(
            root.clone(),
            config.heartbeat_timeout(),
            control,
            storage,
        ));
        let (shutdown_tx, shutdown_rx) = unbounded();
        let tick = config.heartbeat_interval();
        let loop_core = Arc::clone(&core);
        let thread = std::thread::Builder::new()
            .name("sentinel-watcher".to_string())
            .spawn(move || run_loop(loop_core, watcher, event_rx, shutdown_rx, tick))
            .map_err(WatcherError::Spawn)?;

        info!(root = %root.display(), "Sentinel watcher started");
        Ok(Self {
            core,
            shutdown: shutdown_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn core(&self) -> &Arc<LifecycleCore> {
        &self.core
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("Sentinel watcher thread panicked");
            }
        }
    }
}

impl Drop for LifecycleWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply(watcher: &mut RecommendedWatcher, actions: Vec<WatchAction>) {
    for action in actions {
        let result = match &action {
            WatchAction::AddWatch(path) => watcher.watch(path, RecursiveMode::NonRecursive),
            WatchAction::RemoveWatch(path) => watcher.unwatch(path),
        };
        if let Err(e) = result {
            warn!("{:?} failed: {}", action, e);
        }
    }
}

fn dispatch(core: &LifecycleCore, watcher: &mut RecommendedWatcher, event: notify::Event) {
    let now = Instant::now();
    let (events, rejected) = sentinel::sentinel_events(&event);
    for (path, reason) in rejected {
        if !core.is_job_dir(&path) {
            debug!(path = %path.display(), ?reason, "Skipping non-sentinel path");
        }
    }
    for event in events {
        let actions = core.process(event, now);
        apply(watcher, actions);
    }
}

fn run_loop(
    core: Arc<LifecycleCore>,
    mut watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
    shutdown: Receiver<()>,
    tick: Duration,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(events) -> first => {
                let Ok(first) = first else { break };
                let batch = std::iter::once(first).chain(events.try_iter());
                for result in batch {
                    match result {
                        Ok(event) => dispatch(&core, &mut watcher, event),
                        Err(e) => warn!("Filesystem watch error: {}", e),
                    }
                }
            },
            default(tick) => {},
        }

        // Runs on every wake so a missed event cannot keep a job alive.
        let swept = core.sweep(Instant::now());
        apply(&mut watcher, swept);
        apply(&mut watcher, core.take_deferred());
    }
    core.join_tasks();
    debug!("Sentinel watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<JobSpec>>,
        stops: AtomicUsize,
        fail_handle: bool,
    }

    impl TaskControl for Recorder {
        fn handle(&self, spec: JobSpec) -> Result<(), ManagerError> {
            self.handled.lock().push(spec.clone());
            if self.fail_handle {
                return Err(ManagerError::AlreadyRunning(spec.job_id));
            }
            Ok(())
        }

        fn stop_task(&self, _job_id: &str) -> Result<(), ManagerError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Launch takes a while; stop only finds jobs that finished launching.
    #[derive(Default)]
    struct SlowLauncher {
        running: Mutex<HashSet<String>>,
    }

    impl TaskControl for SlowLauncher {
        fn handle(&self, spec: JobSpec) -> Result<(), ManagerError> {
            std::thread::sleep(Duration::from_millis(100));
            self.running.lock().insert(spec.job_id);
            Ok(())
        }

        fn stop_task(&self, job_id: &str) -> Result<(), ManagerError> {
            if self.running.lock().remove(job_id) {
                Ok(())
            } else {
                Err(ManagerError::NotFound(job_id.to_string()))
            }
        }
    }

    fn event(root: &Path, job: &str, kind: SentinelKind, trigger: Trigger) -> SentinelEvent {
        SentinelEvent {
            job_id: job.to_string(),
            kind,
            trigger,
            path: root.join(sentinel::sentinel_name(job, kind)),
        }
    }

    fn core(root: &Path, control: Arc<Recorder>) -> LifecycleCore {
        LifecycleCore::new(
            root,
            Duration::from_secs(30),
            control,
            Arc::new(LocalStorage::new()),
        )
    }

    #[test]
    fn test_start_registers_and_launches() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());

        std::fs::write(dir.path().join("JOB1_uuid"), "abc-123\n").unwrap();
        core.process(event(dir.path(), "JOB1", SentinelKind::Uuid, Trigger::Closed), Instant::now());
        std::fs::write(
            dir.path().join("JOB1_start"),
            r#"{"device_id": 2, "config": {"metrics": "ai_core"}}"#,
        )
        .unwrap();
        let actions = core.process(
            event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed),
            Instant::now(),
        );
        core.join_tasks();

        assert_eq!(actions, vec![WatchAction::AddWatch(dir.path().join("JOB1"))]);
        let entry = core.entry("JOB1").unwrap();
        assert!(entry.is_started);
        assert_eq!(entry.device_id, 2);

        let handled = control.handled.lock();
        assert_eq!(handled.len(), 1);
        assert_eq!(handled[0].devices, vec![2]);
        assert_eq!(handled[0].config["uuid"], "abc-123");
        assert_eq!(handled[0].config["metrics"], "ai_core");

        let status = std::fs::read_to_string(dir.path().join("JOB1_status")).unwrap();
        assert!(status.contains("\"success\""));
    }

    #[test]
    fn test_empty_start_payload_waits_for_close() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_start"), "").unwrap();

        let actions = core.process(
            event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Created),
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert_eq!(core.entry_count(), 0);
        assert!(control.handled.lock().is_empty());
    }

    #[test]
    fn test_invalid_payload_writes_status() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_start"), "{not json").unwrap();

        core.process(
            event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed),
            Instant::now(),
        );
        assert_eq!(core.entry_count(), 0);
        let status = std::fs::read_to_string(dir.path().join("JOB1_status")).unwrap();
        assert!(status.contains("\"error\""));
        assert!(control.handled.lock().is_empty());
    }

    #[test]
    fn test_failed_handle_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder {
            fail_handle: true,
            ..Default::default()
        });
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_start"), r#"{"device_id": 0}"#).unwrap();

        core.process(
            event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed),
            Instant::now(),
        );
        core.join_tasks();

        assert_eq!(core.entry_count(), 0);
        assert_eq!(
            core.take_deferred(),
            vec![WatchAction::RemoveWatch(dir.path().join("JOB1"))]
        );
        let status = std::fs::read_to_string(dir.path().join("JOB1_status")).unwrap();
        assert!(status.contains("already_running"));
    }

    #[test]
    fn test_stop_for_unknown_job_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());

        let actions = core.process(
            event(dir.path(), "JOB1", SentinelKind::Stop, Trigger::Created),
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_beat_refreshes_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_start"), r#"{"device_id": 0}"#).unwrap();

        let t0 = Instant::now();
        core.process(event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed), t0);
        let later = t0 + Duration::from_secs(25);
        core.process(event(dir.path(), "JOB1", SentinelKind::Beat, Trigger::Written), later);
        core.join_tasks();

        assert!(core.sweep(t0 + Duration::from_secs(40)).is_empty());
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
        assert_eq!(core.sweep(later + Duration::from_secs(31)).len(), 1);
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_done_behaves_like_stop() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_start"), r#"{"device_id": 0}"#).unwrap();
        core.process(
            event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed),
            Instant::now(),
        );
        core.join_tasks();

        let actions = core.process(
            event(dir.path(), "JOB1", SentinelKind::Done, Trigger::Created),
            Instant::now(),
        );
        assert_eq!(actions, vec![WatchAction::RemoveWatch(dir.path().join("JOB1"))]);
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(core.entry_count(), 0);
    }

    #[test]
    fn test_stop_during_launch_stops_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(SlowLauncher::default());
        let core = LifecycleCore::new(
            dir.path(),
            Duration::from_secs(30),
            control.clone(),
            Arc::new(LocalStorage::new()),
        );
        std::fs::write(dir.path().join("JOB1_start"), r#"{"device_id": 0}"#).unwrap();

        let now = Instant::now();
        core.process(event(dir.path(), "JOB1", SentinelKind::Start, Trigger::Closed), now);
        let actions = core.process(event(dir.path(), "JOB1", SentinelKind::Stop, Trigger::Created), now);
        assert_eq!(actions, vec![WatchAction::RemoveWatch(dir.path().join("JOB1"))]);
        core.join_tasks();

        assert!(control.running.lock().is_empty());
        assert_eq!(core.entry_count(), 0);
        assert!(core.sweep(now + Duration::from_secs(3600)).is_empty());
        let status = std::fs::read_to_string(dir.path().join("JOB1_status")).unwrap();
        assert!(status.contains("\"stopped\""));
    }

    #[test]
    fn test_orphan_uuid_expires() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(Recorder::default());
        let core = core(dir.path(), control.clone());
        std::fs::write(dir.path().join("JOB1_uuid"), "abc-123").unwrap();
        std::fs::write(dir.path().join("JOB2_uuid"), "def-456").unwrap();

        let t0 = Instant::now();
        core.process(event(dir.path(), "JOB1", SentinelKind::Uuid, Trigger::Closed), t0);
        core.process(event(dir.path(), "JOB2", SentinelKind::Uuid, Trigger::Closed), t0);
        core.process(event(dir.path(), "JOB2", SentinelKind::Done, Trigger::Created), t0);
        core.sweep(t0 + Duration::from_secs(31));

        // A late start no longer picks up either uuid.
        for job in ["JOB1", "JOB2"] {
            std::fs::write(dir.path().join(format!("{}_start", job)), r#"{"device_id": 0}"#)
                .unwrap();
            core.process(
                event(dir.path(), job, SentinelKind::Start, Trigger::Closed),
                t0 + Duration::from_secs(32),
            );
        }
        core.join_tasks();

        let handled = control.handled.lock();
        assert_eq!(handled.len(), 2);
        assert!(handled.iter().all(|spec| !spec.config.contains_key("uuid")));
    }
}
