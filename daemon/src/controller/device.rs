//! Device capability lookup used to size replay payloads.

use crate::config::DeviceEntry;
use devscope_shared::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hardware counts reported for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    pub ai_core_num: u32,
    pub ai_cpu_num: u32,
    pub vector_core_num: u32,
    pub freq_mhz: u32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            ai_core_num: 32,
            ai_cpu_num: 8,
            vector_core_num: 0,
            freq_mhz: 1800,
        }
    }
}

pub trait DeviceQuery: Send + Sync {
    fn device_exists(&self, device: DeviceId) -> bool;

    fn capabilities(&self, device: DeviceId) -> Option<DeviceCapabilities>;
}

/// Devices as listed in the daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceQuery {
    devices: HashMap<DeviceId, DeviceCapabilities>,
}

impl StaticDeviceQuery {
    pub fn from_entries(entries: &[DeviceEntry]) -> Self {
        Self {
            devices: entries.iter().map(|e| (e.id, e.capabilities)).collect(),
        }
    }

    /// Every id in `ids` with default capabilities.
    pub fn with_ids(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            devices: ids
                .into_iter()
                .map(|id| (id, DeviceCapabilities::default()))
                .collect(),
        }
    }

    pub fn insert(&mut self, device: DeviceId, capabilities: DeviceCapabilities) {
        self.devices.insert(device, capabilities);
    }
}

impl DeviceQuery for StaticDeviceQuery {
    fn device_exists(&self, device: DeviceId) -> bool {
        self.devices.contains_key(&device)
    }

    fn capabilities(&self, device: DeviceId) -> Option<DeviceCapabilities> {
        self.devices.get(&device).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_query() {
        let mut query = StaticDeviceQuery::with_ids([0, 1]);
        query.insert(
            2,
            DeviceCapabilities {
                ai_core_num: 24,
                ..Default::default()
            },
        );
        assert!(query.device_exists(1));
        assert!(!query.device_exists(5));
        assert_eq!(query.capabilities(2).unwrap().ai_core_num, 24);
        assert_eq!(query.capabilities(0), Some(DeviceCapabilities::default()));
    }
}
