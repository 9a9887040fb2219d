use std::error::Error as _;
use thiserror::Error;

/// Error taxonomy returned from the lifecycle manager and its collaborators.
///
/// Each variant maps to one of the HTTP status classes described in the
/// handler's error handling design: config errors are load-time fatal,
/// discovery/spawn/readiness errors are per-request 5xx, and proxy errors
/// are passed through from the host's reverse-proxy implementation.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A directive or upstream spec failed to parse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dynamic proxy detector exited non-zero or produced unparseable output.
    #[error("dynamic proxy detector failed: {0}")]
    DiscoveryFailed(String),

    /// The backend executable could not be started.
    #[error("failed to start backend '{key}': {source}")]
    SpawnFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The backend did not become ready before its startup timeout elapsed.
    #[error("backend '{key}' did not become ready within {timeout_ms}ms")]
    ReadinessTimeout { key: String, timeout_ms: u64 },

    /// The instance was found dead between lookup and dispatch, even after a retry.
    #[error("backend '{key}' is dead")]
    BackendDead { key: String },

    /// The host's reverse-proxy implementation reported an error.
    #[error("reverse proxy error: {0}")]
    Proxy(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Returns true if this error represents a transient race that is worth
    /// retrying once before surfacing to the caller.
    pub fn is_retryable_race(&self) -> bool {
        matches!(self, LifecycleError::BackendDead { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_timeout_message_contains_key_and_timeout() {
        let err = LifecycleError::ReadinessTimeout {
            key: "abc123".to_string(),
            timeout_ms: 30_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("30000"));
    }

    #[test]
    fn backend_dead_is_retryable_race() {
        let err = LifecycleError::BackendDead {
            key: "k".to_string(),
        };
        assert!(err.is_retryable_race());

        let other = LifecycleError::InvalidConfig("bad".to_string());
        assert!(!other.is_retryable_race());
    }

    #[test]
    fn spawn_failed_carries_source() {
        let source = anyhow::anyhow!("exec not found");
        let err = LifecycleError::SpawnFailed {
            key: "k".to_string(),
            source,
        };
        let msg = err.to_string();
        assert!(msg.contains('k'));
        assert!(err.source().is_some());
    }
}
