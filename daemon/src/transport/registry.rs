//! Per-daemon table of open transport channels.

use super::{ChannelSettings, ChannelState, Connector, DataHandler, TransportChannel, TransportError};
use crate::config::TransportConfig;
use devscope_shared::{DeployMode, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

type ChannelKey = (String, DeviceId);

pub struct TransportRegistry {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    host: String,
    channels: Mutex<HashMap<ChannelKey, Arc<TransportChannel>>>,
}

impl TransportRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            connector,
            config,
            host,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Return the ready channel for `(job_id, device)`, handshaking a new one
    /// if needed. The data receive loop is started with `handler`.
    pub fn open(
        &self,
        job_id: &str,
        device: DeviceId,
        mode: DeployMode,
        handler: Arc<dyn DataHandler>,
    ) -> Result<Arc<TransportChannel>, TransportError> {
        let key = (job_id.to_string(), device);
        if let Some(existing) = self.channels.lock().get(&key) {
            if existing.state() == ChannelState::Ready {
                return Ok(Arc::clone(existing));
            }
        }

        // Handshakes can take seconds; keep the table unlocked meanwhile.
        let channel = TransportChannel::new(
            ChannelSettings {
                job_id: job_id.to_string(),
                device,
                mode,
                host: self.host.clone(),
            },
            Arc::clone(&self.connector),
            &self.config,
        );
        if let Err(e) = channel.init().and_then(|_| channel.start_receiving(handler)) {
            channel.close();
            return Err(e);
        }

        let previous = self.channels.lock().insert(key, Arc::clone(&channel));
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(job_id, device, "Registered transport channel");
        Ok(channel)
    }

    pub fn get(&self, job_id: &str, device: DeviceId) -> Option<Arc<TransportChannel>> {
        self.channels
            .lock()
            .get(&(job_id.to_string(), device))
            .cloned()
    }

    /// Close and forget every channel of `job_id`.
    pub fn close_job(&self, job_id: &str) {
        let removed: Vec<_> = {
            let mut channels = self.channels.lock();
            let keys: Vec<_> = channels
                .keys()
                .filter(|(job, _)| job == job_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| channels.remove(k)).collect()
        };
        for channel in removed {
            channel.close();
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        if !drained.is_empty() {
            info!("Closing {} transport channels", drained.len());
        }
        for channel in drained {
            channel.close();
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{AckingDevice, MemoryConnector};
    use devscope_shared::protocol::messages::{ChannelFinished, FileChunk, JobFinished};

    struct Ignore;

    impl DataHandler for Ignore {
        fn on_file_chunk(&self, _: &Arc<TransportChannel>, _: FileChunk) {}
        fn on_channel_finished(&self, _: &Arc<TransportChannel>, _: ChannelFinished) {}
        fn on_job_finished(&self, _: &Arc<TransportChannel>, _: JobFinished) {}
    }

    fn registry() -> (Arc<MemoryConnector>, TransportRegistry) {
        let connector = Arc::new(MemoryConnector::new(Arc::new(AckingDevice)));
        let registry = TransportRegistry::new(connector.clone(), TransportConfig::default());
        (connector, registry)
    }

    #[test]
    fn test_open_reuses_ready_channel() {
        let (_, registry) = registry();
        let a = registry.open("job", 0, DeployMode::Rpc, Arc::new(Ignore)).unwrap();
        let b = registry.open("job", 0, DeployMode::Rpc, Arc::new(Ignore)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_open_is_not_registered() {
        let (connector, _) = registry();
        connector.refuse(7);
        let config = TransportConfig {
            handshake_attempts: 1,
            ..TransportConfig::default()
        };
        let registry = TransportRegistry::new(connector, config);
        assert!(registry.open("job", 7, DeployMode::Soc, Arc::new(Ignore)).is_err());
        assert!(registry.get("job", 7).is_none());
    }

    #[test]
    fn test_close_job_only_touches_that_job() {
        let (_, registry) = registry();
        let a = registry.open("a", 0, DeployMode::Rpc, Arc::new(Ignore)).unwrap();
        let b = registry.open("b", 0, DeployMode::Rpc, Arc::new(Ignore)).unwrap();
        registry.close_job("a");
        assert_eq!(a.state(), ChannelState::Closed);
        assert_eq!(b.state(), ChannelState::Ready);
        registry.close_all();
        assert!(registry.is_empty());
        assert_eq!(b.state(), ChannelState::Closed);
    }
}
