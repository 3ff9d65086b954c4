//! State locking for concurrent access protection.
//!
//! A provisioning pass holds the lock from planning until the final state
//! save, so two passes never interleave writes to the same stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StackError, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Claims the lock over whatever the backend currently stores.
    ///
    /// An expired lock is taken over; a live one is reported as held by
    /// its owner. An empty `holder` gets a generated identifier.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if `existing` has not expired.
    pub fn claim(existing: Option<Self>, holder: &str) -> Result<Self> {
        if let Some(current) = existing {
            if !current.is_expired() {
                return Err(StackError::State(StateError::LockedByOther {
                    holder: current.holder,
                    since: current.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Taking over expired lock {} from {}", current.lock_id, current.holder);
        }

        if holder.is_empty() {
            Ok(Self::new(&generate_holder_id()))
        } else {
            Ok(Self::new(holder))
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_claim_rejects_live_lock() {
        let current = LockInfo::new("pipeline-42");
        let err = LockInfo::claim(Some(current), "laptop").unwrap_err();
        assert!(err.to_string().contains("pipeline-42"));
    }

    #[test]
    fn test_claim_takes_over_expired_lock() {
        let mut current = LockInfo::new("pipeline-42");
        current.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let claimed = LockInfo::claim(Some(current.clone()), "laptop").unwrap();
        assert_eq!(claimed.holder, "laptop");
        assert_ne!(claimed.lock_id, current.lock_id);
    }

    #[test]
    fn test_claim_generates_holder_when_empty() {
        let claimed = LockInfo::claim(None, "").unwrap();
        assert!(claimed.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
