//! Profiling job descriptions.
//!
//! [`JobSpec`] is what a front-end (CLI, cloud watcher, RPC endpoint) submits;
//! [`ProfileJob`] is the validated, immutable form the daemon keeps for the
//! lifetime of the job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Accelerator device index on the host.
pub type DeviceId = u32;

/// Longest accepted job id.
pub const MAX_JOB_ID_LEN: usize = 64;

/// Most devices a single job may span.
pub const MAX_DEVICES_PER_JOB: usize = 64;

/// Where the profiling agent runs relative to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Host drives a remote device over the transport.
    #[default]
    Rpc,
    /// Profiling runs on the device SoC itself, including system-level metrics.
    Soc,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Rpc => "rpc",
            DeployMode::Soc => "soc",
        }
    }
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeployMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rpc" => Ok(DeployMode::Rpc),
            "soc" => Ok(DeployMode::Soc),
            _ => anyhow::bail!("Invalid deploy mode: {}", s),
        }
    }
}

/// Reasons a job description is rejected before anything is started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("job id is empty")]
    EmptyJobId,

    #[error("job id is {0} bytes (max 64)")]
    JobIdTooLong(usize),

    #[error("job id '{0}' contains unsupported characters")]
    InvalidJobId(String),

    #[error("job requests no devices")]
    NoDevices,

    #[error("job requests {0} devices (max 64)")]
    TooManyDevices(usize),

    #[error("device {0} is listed more than once")]
    DuplicateDevice(DeviceId),
}

/// Validate a job id. Ids end up in file names, so they are restricted to
/// ASCII alphanumerics plus `-`, `_` and `.`, and must start alphanumeric.
pub fn validate_job_id(job_id: &str) -> Result<(), SpecError> {
    if job_id.is_empty() {
        return Err(SpecError::EmptyJobId);
    }
    if job_id.len() > MAX_JOB_ID_LEN {
        return Err(SpecError::JobIdTooLong(job_id.len()));
    }
    let starts_ok = job_id
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric());
    let chars_ok = job_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !starts_ok || !chars_ok {
        return Err(SpecError::InvalidJobId(job_id.to_string()));
    }
    Ok(())
}

/// A profiling request as submitted by a front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,

    /// Devices in the order controllers are created.
    pub devices: Vec<DeviceId>,

    #[serde(default)]
    pub mode: DeployMode,

    /// Opaque key/value configuration forwarded to the device.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>, devices: Vec<DeviceId>) -> Self {
        Self {
            job_id: job_id.into(),
            devices,
            mode: DeployMode::default(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: DeployMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        validate_job_id(&self.job_id)?;
        if self.devices.is_empty() {
            return Err(SpecError::NoDevices);
        }
        if self.devices.len() > MAX_DEVICES_PER_JOB {
            return Err(SpecError::TooManyDevices(self.devices.len()));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(*device) {
                return Err(SpecError::DuplicateDevice(*device));
            }
        }
        Ok(())
    }
}

/// A validated job owned by the daemon for its lifetime.
#[derive(Debug)]
pub struct ProfileJob {
    pub job_id: String,
    pub devices: Vec<DeviceId>,
    pub mode: DeployMode,
    pub config: BTreeMap<String, String>,
    cancelled: AtomicBool,
}

impl ProfileJob {
    pub fn from_spec(spec: JobSpec) -> Result<Self, SpecError> {
        spec.validate()?;
        Ok(Self {
            job_id: spec.job_id,
            devices: spec.devices,
            mode: spec.mode,
            config: spec.config,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Mark the job cancelled. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_rules() {
        assert!(validate_job_id("JOB1").is_ok());
        assert!(validate_job_id("job-2024.10_a").is_ok());
        assert_eq!(validate_job_id(""), Err(SpecError::EmptyJobId));
        assert!(matches!(validate_job_id("../etc"), Err(SpecError::InvalidJobId(_))));
        assert!(matches!(validate_job_id("a/b"), Err(SpecError::InvalidJobId(_))));
        assert!(matches!(
            validate_job_id(&"x".repeat(MAX_JOB_ID_LEN + 1)),
            Err(SpecError::JobIdTooLong(_))
        ));
    }

    #[test]
    fn test_spec_validation() {
        assert!(JobSpec::new("job", vec![0, 1]).validate().is_ok());
        assert_eq!(JobSpec::new("job", vec![]).validate(), Err(SpecError::NoDevices));
        assert_eq!(
            JobSpec::new("job", vec![1, 2, 1]).validate(),
            Err(SpecError::DuplicateDevice(1))
        );
    }

    #[test]
    fn test_spec_from_json_defaults() {
        let spec: JobSpec =
            serde_json::from_str(r#"{"job_id":"j1","devices":[3]}"#).unwrap();
        assert_eq!(spec.mode, DeployMode::Rpc);
        assert!(spec.config.is_empty());

        let spec: JobSpec =
            serde_json::from_str(r#"{"job_id":"j1","devices":[3],"mode":"soc"}"#).unwrap();
        assert_eq!(spec.mode, DeployMode::Soc);
    }

    #[test]
    fn test_cancel_once() {
        let job = ProfileJob::from_spec(JobSpec::new("job", vec![0])).unwrap();
        assert!(!job.is_cancelled());
        assert!(job.cancel());
        assert!(!job.cancel());
        assert!(job.is_cancelled());
    }

    #[test]
    fn test_deploy_mode_parse() {
        assert_eq!("SOC".parse::<DeployMode>().unwrap(), DeployMode::Soc);
        assert!("cloud".parse::<DeployMode>().is_err());
    }
}
