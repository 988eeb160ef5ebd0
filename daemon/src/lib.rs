//! Devscope Daemon Library
//!
//! Host-side profiling daemon: talks to device agents over a control/data
//! transport, runs one controller per (job, device), and stores the streamed
//! trace data either locally or by relaying it to another device.

pub mod audit;
pub mod config;
pub mod controller;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod transport;
pub mod watcher;

pub use config::DaemonConfig;
pub use manager::{ManagerError, ProfileManager, TaskInfo, TaskState};

use anyhow::{Context, Result};
use controller::StaticDeviceQuery;
use pipeline::{ChunkRouter, LocalStorage, UploadPipeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use transport::{Connector, TransportRegistry};
use watcher::LifecycleWatcher;

/// The assembled services of one daemon process.
pub struct Daemon {
    transports: Arc<TransportRegistry>,
    storage: Arc<LocalStorage>,
    pipeline: Arc<UploadPipeline>,
    manager: Arc<ProfileManager>,
    watcher: Option<LifecycleWatcher>,
    stopped: AtomicBool,
}

impl Daemon {
    /// Build every service from `config`. The watcher is started only when
    /// `watcher.root` is set.
    pub fn start(config: &DaemonConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let transports = Arc::new(TransportRegistry::new(connector, config.transport.clone()));
        let storage = Arc::new(LocalStorage::new());
        let router = Arc::new(ChunkRouter::new(Arc::clone(&storage), Arc::clone(&transports)));
        let pipeline = Arc::new(
            UploadPipeline::new(&config.pipeline, router).context("Failed to start upload pipeline")?,
        );
        let devices = Arc::new(StaticDeviceQuery::from_entries(&config.devices));
        let manager = Arc::new(
            ProfileManager::new(
                Arc::clone(&transports),
                Arc::clone(&pipeline),
                devices,
                config.pipeline.output_dir.clone(),
            )
            .context("Failed to start profile manager")?,
        );

        let watcher = match &config.watcher.root {
            Some(root) => {
                let watcher = LifecycleWatcher::start(
                    &config.watcher,
                    manager.clone(),
                    Arc::clone(&storage),
                )
                .with_context(|| format!("Failed to watch {}", root.display()))?;
                Some(watcher)
            }
            None => None,
        };

        info!(
            devices = config.devices.len(),
            workers = pipeline.worker_count(),
            watcher = watcher.is_some(),
            "Daemon started"
        );
        Ok(Self {
            transports,
            storage,
            pipeline,
            manager,
            watcher,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn manager(&self) -> &Arc<ProfileManager> {
        &self.manager
    }

    pub fn pipeline(&self) -> &Arc<UploadPipeline> {
        &self.pipeline
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn storage(&self) -> &Arc<LocalStorage> {
        &self.storage
    }

    pub fn watcher(&self) -> Option<&LifecycleWatcher> {
        self.watcher.as_ref()
    }

    /// Stop in dependency order: no new sentinel starts, then running jobs,
    /// then pending uploads, then the links.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watcher) = &self.watcher {
            watcher.shutdown();
        }
        self.manager.shutdown();
        self.pipeline.shutdown();
        let closed = self.storage.close_all();
        self.transports.close_all();
        info!(open_files = closed, "Daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
