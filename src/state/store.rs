//! State store trait definition.
//!
//! This module defines the common interface for state storage backends and
//! the JSON encoding they share.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{STATE_VERSION, StackState};
use crate::error::{Result, StackError, StateError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the stack state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StackState>>;

    /// Saves the stack state.
    async fn save(&self, state: &StackState) -> Result<()>;

    /// Deletes the stack state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of its owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StackState>> {
        (**self).load().await
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Serializes state for storage.
pub(crate) fn encode_state(state: &StackState) -> Result<String> {
    serde_json::to_string_pretty(state).map_err(|e| {
        StackError::State(StateError::serialization(format!(
            "Failed to serialize state: {e}"
        )))
    })
}

/// Parses stored state, rejecting other major format versions.
pub(crate) fn decode_state(content: &str) -> Result<StackState> {
    let state: StackState = serde_json::from_str(content).map_err(|e| {
        StackError::State(StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    })?;

    let major = |v: &str| v.split('.').next().map(str::to_string);
    if major(&state.version) != major(STATE_VERSION) {
        return Err(StackError::State(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: state.version,
        }));
    }

    Ok(state)
}

/// Serializes a lock for storage.
pub(crate) fn encode_lock(lock: &LockInfo) -> Result<String> {
    serde_json::to_string_pretty(lock).map_err(|e| {
        StackError::State(StateError::serialization(format!(
            "Failed to serialize lock: {e}"
        )))
    })
}

/// Parses a stored lock.
pub(crate) fn decode_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        StackError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_other_major_version() {
        let mut state = StackState::new("shop", "dev");
        state.version = "2.0".to_string();
        let json = serde_json::to_string(&state).unwrap();
        assert!(matches!(
            decode_state(&json),
            Err(StackError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_state("{not json"),
            Err(StackError::State(StateError::Corrupted { .. }))
        ));
    }
}
