//! Runtime permission checks consulted before BLE operations.
//!
//! The link layer never requests permissions itself; it asks a
//! [`PermissionProvider`] and skips the operation when access is denied.

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether scan / connect operations are currently permitted.
pub trait PermissionProvider: Send + Sync {
    /// Whether BLE scanning is allowed.
    fn can_scan(&self) -> bool;

    /// Whether connecting (and reading device names) is allowed.
    fn can_connect(&self) -> bool;
}

/// Provider for platforms where the OS enforces access on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl PermissionProvider for GrantAll {
    fn can_scan(&self) -> bool {
        true
    }

    fn can_connect(&self) -> bool {
        true
    }
}

/// Provider backed by flags that can be flipped at runtime.
#[derive(Debug)]
pub struct StaticPermissions {
    scan: AtomicBool,
    connect: AtomicBool,
}

impl StaticPermissions {
    pub fn new(scan: bool, connect: bool) -> Self {
        Self {
            scan: AtomicBool::new(scan),
            connect: AtomicBool::new(connect),
        }
    }

    pub fn set_scan(&self, granted: bool) {
        self.scan.store(granted, Ordering::SeqCst);
    }

    pub fn set_connect(&self, granted: bool) {
        self.connect.store(granted, Ordering::SeqCst);
    }
}

impl PermissionProvider for StaticPermissions {
    fn can_scan(&self) -> bool {
        self.scan.load(Ordering::SeqCst)
    }

    fn can_connect(&self) -> bool {
        self.connect.load(Ordering::SeqCst)
    }
}
