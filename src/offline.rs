//! Process-wide offline mode.
//!
//! One boolean under a read/write lock; reads dominate (every outbound URL
//! gate consults it), writes happen on operator command. When offline, every
//! network-flavoured feature gate returns an error naming the applicable
//! control, and URL validation additionally requires loopback hosts.

use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::CoreError;

static OFFLINE: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

/// Switch offline mode on or off.
pub fn set_mode(offline: bool) {
    *OFFLINE.write().expect("offline lock poisoned") = offline;
    tracing::info!(offline, "offline mode changed");
}

/// Current offline flag.
pub fn is_offline() -> bool {
    *OFFLINE.read().expect("offline lock poisoned")
}

/// Gate for cloud inference.
pub fn check_cloud_allowed() -> Result<(), CoreError> {
    gate("SC-7: cloud inference blocked in offline mode")
}

/// Gate for web fetches.
pub fn check_web_fetch_allowed() -> Result<(), CoreError> {
    gate("SC-7: web fetch blocked in offline mode")
}

/// Gate for telemetry export.
pub fn check_telemetry_allowed() -> Result<(), CoreError> {
    gate("SC-7: telemetry export blocked in offline mode")
}

/// Gate for any other outbound network operation.
pub fn check_network_allowed() -> Result<(), CoreError> {
    gate("SC-7: network operation blocked in offline mode")
}

fn gate(message: &str) -> Result<(), CoreError> {
    if is_offline() {
        Err(CoreError::OfflineModeBlocks(message.to_string()))
    } else {
        Ok(())
    }
}

/// Fixed badge string for status surfaces.
pub fn status_badge() -> &'static str {
    if is_offline() {
        "OFFLINE — loopback only"
    } else {
        "ONLINE"
    }
}
