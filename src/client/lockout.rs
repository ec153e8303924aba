//! Credential lockout table (AC-7 semantics).
//!
//! Every authentication attempt against the remote gateway is recorded under
//! the credential's *fingerprint* — the first 4 bytes of its SHA-256, hex
//! encoded. The raw credential never enters this module's state or any log
//! line (IA-5(1): authentication feedback must be obscured).
//!
//! Policy: 3 consecutive failures lock the fingerprint for 15 minutes; any
//! success resets the counter. The table is process-wide so every client
//! instance sharing a credential shares its lockout state.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Consecutive failures before a fingerprint locks.
pub const MAX_FAILURES: u32 = 3;
/// How long a locked fingerprint stays locked.
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// First 4 bytes of `SHA-256(credential)` as 8 hex chars — the only form in
/// which a credential may appear in logs or keys.
pub fn fingerprint(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    hex::encode(&digest[..4])
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Fingerprint-keyed attempt table.
#[derive(Debug, Default)]
pub struct AuthLockout {
    records: DashMap<String, AttemptRecord>,
}

static GLOBAL: Lazy<AuthLockout> = Lazy::new(AuthLockout::default);

/// The process-wide table used by the remote client.
pub fn global() -> &'static AuthLockout {
    &GLOBAL
}

impl AuthLockout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the fingerprint may attempt authentication.
    ///
    /// An expired lock is cleared here, so a fingerprint regains its full
    /// failure budget after waiting out the window.
    pub fn check(&self, fp: &str) -> Result<(), CoreError> {
        if let Some(mut entry) = self.records.get_mut(fp) {
            if let Some(until) = entry.locked_until {
                let now = Instant::now();
                if now < until {
                    return Err(CoreError::Locked {
                        remaining_secs: (until - now).as_secs().max(1),
                    });
                }
                entry.failures = 0;
                entry.locked_until = None;
            }
        }
        Ok(())
    }

    /// Record a failed authentication. Locks on the `MAX_FAILURES`th
    /// consecutive failure.
    pub fn record_failure(&self, fp: &str) {
        let mut entry = self.records.entry(fp.to_string()).or_insert(AttemptRecord {
            failures: 0,
            locked_until: None,
        });
        entry.failures += 1;
        if entry.failures >= MAX_FAILURES {
            entry.locked_until = Some(Instant::now() + LOCKOUT_WINDOW);
            tracing::warn!(
                fingerprint = fp,
                failures = entry.failures,
                "credential locked out"
            );
        }
    }

    /// Record a successful authentication; clears failures and any lock.
    pub fn record_success(&self, fp: &str) {
        if let Some(mut entry) = self.records.get_mut(fp) {
            entry.failures = 0;
            entry.locked_until = None;
        }
    }

    /// Current consecutive-failure count (for status surfaces).
    pub fn failures(&self, fp: &str) -> u32 {
        self.records.get(fp).map(|e| e.failures).unwrap_or(0)
    }
}
