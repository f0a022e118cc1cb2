//! Capsule host error types.

use thiserror::Error;

use super::types::CapsuleState;

/// Which phase of the capsule lifecycle an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Startup,
    Handshake,
    Call,
    Shutdown,
}

/// Errors that can occur while managing a capsule process.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// `start()` was called from a state that does not allow it.
    #[error("cannot start capsule '{tool}' in state {state}")]
    InvalidState { tool: String, state: CapsuleState },

    /// A stdio pipe could not be captured from the spawned process.
    #[error("failed to create {pipe} pipe for capsule '{tool}'")]
    PipeUnavailable { tool: String, pipe: &'static str },

    /// The capsule process failed to start.
    #[error("failed to start capsule process '{tool}': {reason}")]
    SpawnFailed { tool: String, reason: String },

    /// The capsule did not emit `orla.hello` within the startup timeout.
    #[error("handshake timeout after {timeout_ms}ms for capsule '{tool}'")]
    HandshakeTimeout { tool: String, timeout_ms: u64 },

    /// The capsule closed its stdout before emitting `orla.hello`.
    #[error("capsule '{tool}' exited before completing the handshake")]
    HandshakeAborted { tool: String },

    /// The manager was stopped while waiting for the handshake.
    #[error("capsule '{tool}' context cancelled during handshake")]
    HandshakeCancelled { tool: String },

    /// `call_tool()` was invoked while the capsule was not `READY`.
    #[error("capsule '{tool}' is not ready (state: {state})")]
    NotReady { tool: String, state: CapsuleState },

    /// The request could not be serialized.
    #[error("failed to encode JSON-RPC request {id} for capsule '{tool}': {reason}")]
    EncodeFailed { tool: String, id: i64, reason: String },

    /// The request could not be written to the capsule's stdin.
    #[error("failed to send JSON-RPC request {id} to capsule '{tool}': {reason}")]
    WriteFailed { tool: String, id: i64, reason: String },

    /// The caller's deadline elapsed before a response arrived.
    #[error("request {id} to capsule '{tool}' timed out after {timeout_ms}ms")]
    CallTimeout { tool: String, id: i64, timeout_ms: u64 },

    /// The caller cancelled its context before a response arrived.
    #[error("request {id} to capsule '{tool}' was cancelled by the caller")]
    CallCancelled { tool: String, id: i64 },

    /// The manager was stopped while the call was in flight.
    #[error("capsule '{tool}' context cancelled while request {id} was in flight")]
    CallAborted { tool: String, id: i64 },

    /// Killing or reaping the process failed during shutdown.
    #[error("failed to stop capsule '{tool}': {}", failures.join("; "))]
    ShutdownFailed { tool: String, failures: Vec<String> },
}

impl CapsuleError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CapsuleError::InvalidState { .. }
            | CapsuleError::PipeUnavailable { .. }
            | CapsuleError::SpawnFailed { .. } => ErrorCategory::Startup,
            CapsuleError::HandshakeTimeout { .. }
            | CapsuleError::HandshakeAborted { .. }
            | CapsuleError::HandshakeCancelled { .. } => ErrorCategory::Handshake,
            CapsuleError::NotReady { .. }
            | CapsuleError::EncodeFailed { .. }
            | CapsuleError::WriteFailed { .. }
            | CapsuleError::CallTimeout { .. }
            | CapsuleError::CallCancelled { .. }
            | CapsuleError::CallAborted { .. } => ErrorCategory::Call,
            CapsuleError::ShutdownFailed { .. } => ErrorCategory::Shutdown,
        }
    }

    /// The tool the error refers to.
    pub fn tool(&self) -> &str {
        match self {
            CapsuleError::InvalidState { tool, .. }
            | CapsuleError::PipeUnavailable { tool, .. }
            | CapsuleError::SpawnFailed { tool, .. }
            | CapsuleError::HandshakeTimeout { tool, .. }
            | CapsuleError::HandshakeAborted { tool }
            | CapsuleError::HandshakeCancelled { tool }
            | CapsuleError::NotReady { tool, .. }
            | CapsuleError::EncodeFailed { tool, .. }
            | CapsuleError::WriteFailed { tool, .. }
            | CapsuleError::CallTimeout { tool, .. }
            | CapsuleError::CallCancelled { tool, .. }
            | CapsuleError::CallAborted { tool, .. }
            | CapsuleError::ShutdownFailed { tool, .. } => tool,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = CapsuleError::InvalidState {
            tool: "calc".into(),
            state: CapsuleState::Ready,
        };
        assert_eq!(err.to_string(), "cannot start capsule 'calc' in state READY");
        assert_eq!(err.category(), ErrorCategory::Startup);
    }

    #[test]
    fn test_shutdown_failures_are_joined() {
        let err = CapsuleError::ShutdownFailed {
            tool: "calc".into(),
            failures: vec!["kill: no such process".into(), "wait: interrupted".into()],
        };
        assert_eq!(
            err.to_string(),
            "failed to stop capsule 'calc': kill: no such process; wait: interrupted"
        );
        assert_eq!(err.category(), ErrorCategory::Shutdown);
    }

    #[test]
    fn test_categories() {
        let timeout = CapsuleError::HandshakeTimeout {
            tool: "t".into(),
            timeout_ms: 50,
        };
        assert_eq!(timeout.category(), ErrorCategory::Handshake);
        assert!(timeout.to_string().contains("handshake timeout"));

        let not_ready = CapsuleError::NotReady {
            tool: "t".into(),
            state: CapsuleState::Created,
        };
        assert_eq!(not_ready.category(), ErrorCategory::Call);
        assert!(not_ready.to_string().contains("is not ready"));
        assert_eq!(not_ready.tool(), "t");
    }
}
