//! Runtime permission checks guarding every radio operation.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// API level from which connect/scan access must be granted at runtime
pub const RUNTIME_GRANT_API_LEVEL: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlePermission {
    Connect,
    Scan,
}

pub trait PermissionGate: Send + Sync {
    /// True if every permission needed for radio operations is held.
    /// Must have no side effects.
    fn has_ble_permissions(&self) -> bool;
}

/// For hosts that have no runtime permission policy
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn has_ble_permissions(&self) -> bool {
        true
    }
}

/// Gate for platforms where access is granted by the user at runtime.
///
/// Clones share the same grant set, so the host can keep one copy to record
/// grants and revocations while the link loop checks another.
#[derive(Debug, Clone)]
pub struct RuntimePermissionGate {
    api_level: u32,
    granted: Arc<RwLock<HashSet<BlePermission>>>,
}

impl RuntimePermissionGate {
    pub fn new(api_level: u32) -> Self {
        Self {
            api_level,
            granted: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn grant(&self, permission: BlePermission) {
        if let Ok(mut granted) = self.granted.write() {
            granted.insert(permission);
        }
    }

    pub fn revoke(&self, permission: BlePermission) {
        if let Ok(mut granted) = self.granted.write() {
            granted.remove(&permission);
        }
    }

    fn requires_runtime_grant(&self) -> bool {
        self.api_level >= RUNTIME_GRANT_API_LEVEL
    }
}

impl PermissionGate for RuntimePermissionGate {
    fn has_ble_permissions(&self) -> bool {
        if !self.requires_runtime_grant() {
            return true;
        }
        // A poisoned lock denies rather than guesses
        self.granted
            .read()
            .map(|granted| {
                granted.contains(&BlePermission::Connect) && granted.contains(&BlePermission::Scan)
            })
            .unwrap_or(false)
    }
}
