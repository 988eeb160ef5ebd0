//! Deployment-specific start/stop sequences.

use super::device::{DeviceCapabilities, DeviceQuery};
use super::ControllerError;
use crate::transport::TransportChannel;
use devscope_shared::protocol::messages::{
    JobStartRequest, JobStopRequest, ReplayStartRequest, ReplayStopRequest, WireMessage,
};
use devscope_shared::{DeployMode, DeviceId};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Everything a start sequence sends to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfParams {
    pub job_id: String,
    pub device: DeviceId,
    /// Job configuration forwarded with the job-start request.
    pub config: BTreeMap<String, String>,
    /// Resolved replay payload.
    pub replay: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAdapter {
    /// Host and device share a board; system-level groups are collected too.
    Soc,
    /// Device reached over a remote link; only on-chip groups are collected.
    Rpc,
}

impl JobAdapter {
    pub fn for_device(mode: DeployMode) -> Self {
        match mode {
            DeployMode::Soc => JobAdapter::Soc,
            DeployMode::Rpc => JobAdapter::Rpc,
        }
    }

    pub fn mode(&self) -> DeployMode {
        match self {
            JobAdapter::Soc => DeployMode::Soc,
            JobAdapter::Rpc => DeployMode::Rpc,
        }
    }

    fn metric_groups(&self) -> &'static str {
        match self {
            JobAdapter::Soc => "task_time,ai_core,ai_cpu,sys_mem,sys_cpu",
            JobAdapter::Rpc => "task_time,ai_core",
        }
    }

    /// Build the replay payload: device counts, the variant's metric groups,
    /// then job configuration on top.
    pub fn resolve_params(
        &self,
        query: &dyn DeviceQuery,
        job_id: &str,
        device: DeviceId,
        config: &BTreeMap<String, String>,
    ) -> Result<ProfParams, ControllerError> {
        if !query.device_exists(device) {
            return Err(ControllerError::UnknownDevice(device));
        }
        let caps: DeviceCapabilities = query.capabilities(device).unwrap_or_default();

        let mut replay = BTreeMap::new();
        replay.insert("mode".to_string(), self.mode().to_string());
        replay.insert("metrics".to_string(), self.metric_groups().to_string());
        replay.insert("ai_core_num".to_string(), caps.ai_core_num.to_string());
        replay.insert("ai_cpu_num".to_string(), caps.ai_cpu_num.to_string());
        replay.insert("vector_core_num".to_string(), caps.vector_core_num.to_string());
        replay.insert("freq_mhz".to_string(), caps.freq_mhz.to_string());
        replay.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(ProfParams {
            job_id: job_id.to_string(),
            device,
            config: config.clone(),
            replay,
        })
    }

    /// Send job-start then replay-start. If the replay is refused, the
    /// acknowledged job-start is undone with a job-stop.
    pub fn start_prof(
        &self,
        transport: &TransportChannel,
        params: &ProfParams,
    ) -> Result<(), ControllerError> {
        let response = transport
            .send_request(&WireMessage::JobStart(JobStartRequest {
                job_id: params.job_id.clone(),
                device_id: params.device,
                config: params.config.clone(),
            }))
            .map_err(|source| ControllerError::Transport {
                stage: "job start",
                source,
            })?;

        let mut replay = params.replay.clone();
        if !response.body.is_empty() {
            // The device may adjust the payload, e.g. clamp sampling rates.
            match serde_json::from_slice::<BTreeMap<String, String>>(&response.body) {
                Ok(overrides) => {
                    debug!(device = params.device, "Device adjusted {} replay params", overrides.len());
                    replay.extend(overrides);
                }
                Err(e) => warn!(device = params.device, "Ignoring job start response body: {}", e),
            }
        }

        let started = transport.send_request(&WireMessage::ReplayStart(ReplayStartRequest {
            job_id: params.job_id.clone(),
            device_id: params.device,
            mode: self.mode().to_string(),
            params: replay,
        }));
        if let Err(source) = started {
            if let Err(e) = self.stop_job(transport, &params.job_id, params.device) {
                warn!(device = params.device, "Undoing job start failed: {}", e);
            }
            return Err(ControllerError::Transport {
                stage: "replay start",
                source,
            });
        }
        Ok(())
    }

    /// Send replay-stop then job-stop. Job-stop is sent even if the replay stop
    /// fails; the first error is returned.
    pub fn stop_prof(
        &self,
        transport: &TransportChannel,
        job_id: &str,
        device: DeviceId,
    ) -> Result<(), ControllerError> {
        let replay = transport
            .send_request(&WireMessage::ReplayStop(ReplayStopRequest {
                job_id: job_id.to_string(),
                device_id: device,
            }))
            .map(|_| ())
            .map_err(|source| ControllerError::Transport {
                stage: "replay stop",
                source,
            });
        let job = self.stop_job(transport, job_id, device);
        replay.and(job)
    }

    fn stop_job(
        &self,
        transport: &TransportChannel,
        job_id: &str,
        device: DeviceId,
    ) -> Result<(), ControllerError> {
        transport
            .send_request(&WireMessage::JobStop(JobStopRequest {
                job_id: job_id.to_string(),
                device_id: device,
            }))
            .map(|_| ())
            .map_err(|source| ControllerError::Transport {
                stage: "job stop",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::controller::device::StaticDeviceQuery;
    use crate::transport::memory::{DataPort, DeviceBehavior, MemoryConnector};
    use crate::transport::{ChannelSettings, TransportError};
    use devscope_shared::protocol::messages::ResponseEnvelope;
    use devscope_shared::protocol::wire::MessageKind;
    use std::sync::Arc;

    struct RefuseReplay;

    impl DeviceBehavior for RefuseReplay {
        fn request(&self, device: DeviceId, message: &WireMessage, _: &DataPort) -> ResponseEnvelope {
            match message {
                WireMessage::ReplayStart(_) => ResponseEnvelope::error(device, "no replay"),
                WireMessage::JobStart(_) => {
                    ResponseEnvelope::ok_with_body(device, br#"{"freq_mhz":"900"}"#.to_vec())
                }
                _ => ResponseEnvelope::ok(device),
            }
        }
    }

    fn channel(connector: Arc<MemoryConnector>) -> Arc<TransportChannel> {
        let channel = TransportChannel::new(
            ChannelSettings {
                job_id: "j".into(),
                device: 0,
                mode: DeployMode::Soc,
                host: "h".into(),
            },
            connector,
            &TransportConfig::default(),
        );
        channel.init().unwrap();
        channel
    }

    #[test]
    fn test_for_device() {
        assert_eq!(JobAdapter::for_device(DeployMode::Soc), JobAdapter::Soc);
        assert_eq!(JobAdapter::for_device(DeployMode::Rpc).mode(), DeployMode::Rpc);
    }

    #[test]
    fn test_resolve_params_layers_config_over_defaults() {
        let query = StaticDeviceQuery::with_ids([0]);
        let mut config = BTreeMap::new();
        config.insert("metrics".to_string(), "ai_core".to_string());
        let params = JobAdapter::Soc
            .resolve_params(&query, "j", 0, &config)
            .unwrap();
        assert_eq!(params.replay["metrics"], "ai_core");
        assert_eq!(params.replay["mode"], "soc");
        assert_eq!(params.replay["ai_core_num"], "32");

        let rpc = JobAdapter::Rpc
            .resolve_params(&query, "j", 0, &BTreeMap::new())
            .unwrap();
        assert_eq!(rpc.replay["metrics"], "task_time,ai_core");
    }

    #[test]
    fn test_resolve_params_unknown_device() {
        let query = StaticDeviceQuery::with_ids([0]);
        assert!(matches!(
            JobAdapter::Rpc.resolve_params(&query, "j", 3, &BTreeMap::new()),
            Err(ControllerError::UnknownDevice(3))
        ));
    }

    #[test]
    fn test_replay_failure_sends_only_job_stop() {
        let connector = Arc::new(MemoryConnector::new(Arc::new(RefuseReplay)));
        let channel = channel(connector.clone());
        let params = JobAdapter::Soc
            .resolve_params(&StaticDeviceQuery::with_ids([0]), "j", 0, &BTreeMap::new())
            .unwrap();

        let err = JobAdapter::Soc.start_prof(&channel, &params).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Transport {
                stage: "replay start",
                source: TransportError::Rejected { .. }
            }
        ));

        let kinds: Vec<_> = connector.requests(0).iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::JobStart, MessageKind::ReplayStart, MessageKind::JobStop]
        );
        match &connector.requests(0)[1] {
            WireMessage::ReplayStart(req) => assert_eq!(req.params["freq_mhz"], "900"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
