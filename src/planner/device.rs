//! Target device identity.

use serde::{Deserialize, Serialize};

/// A compute device addressed by host, device and sub-device index.
///
/// Ordering is lexicographic over `(host_id, device_id, sub_device_id)` so the
/// planner iterates devices deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host_id: u32,
    pub device_id: u32,
    #[serde(default)]
    pub sub_device_id: u32,
}

impl DeviceInfo {
    pub fn new(host_id: u32, device_id: u32, sub_device_id: u32) -> Self {
        Self { host_id, device_id, sub_device_id }
    }

    /// Suffix used to name per-device replicas, e.g. `h0d1s0`.
    pub fn key(&self) -> String {
        format!("h{}d{}s{}", self.host_id, self.device_id, self.sub_device_id)
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host_id, self.device_id, self.sub_device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn orders_by_host_then_device() {
        let a = DeviceInfo::new(0, 1, 0);
        let b = DeviceInfo::new(0, 0, 3);
        let c = DeviceInfo::new(1, 0, 0);
        let mut map = BTreeMap::new();
        map.insert(c, "c");
        map.insert(a, "a");
        map.insert(b, "b");
        let order: Vec<_> = map.values().copied().collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn key_is_stable() {
        assert_eq!(DeviceInfo::new(2, 3, 1).key(), "h2d3s1");
    }
}
