//! Error types for control-plane calls.

use thiserror::Error;

const NOT_FOUND_PATTERNS: [&str; 3] = ["entity does not exist", "does not exist", "not found"];
const RANGE_CONFLICT_PATTERN: &str = "conflicts with rule";
const ALREADY_EXISTS_PATTERN: &str = "already exis";
const INTERRUPTED_MESSAGE: &str = "interruption requested";

/// Errors raised by a control-plane client or by a failed asynchronous job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// The control plane rejected a command.
    #[error("{command} failed: {message}")]
    Api {
        /// Command that was rejected (for example `createFirewallRule`).
        command: String,
        /// Message returned by the control plane.
        message: String,
    },
    /// An asynchronous job finished in the failed state.
    #[error("job {job_id} failed: {message}")]
    JobFailed {
        /// Identifier of the failed job.
        job_id: String,
        /// Failure detail embedded in the job result.
        message: String,
    },
    /// The control plane could not be reached.
    #[error("control plane unreachable: {message}")]
    Transport {
        /// Transport level error message.
        message: String,
    },
    /// Interruption was requested while a job was still pending. The job
    /// itself may still finish on the control plane.
    #[error("abandoned job {job_id}: interruption requested")]
    Interrupted {
        /// Identifier of the abandoned job.
        job_id: String,
    },
}

impl ControlPlaneError {
    /// Builds an [`ControlPlaneError::Api`] error.
    #[must_use]
    pub fn api(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Message reported by the control plane.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Api { message, .. }
            | Self::JobFailed { message, .. }
            | Self::Transport { message } => message,
            Self::Interrupted { .. } => INTERRUPTED_MESSAGE,
        }
    }

    /// True when a job wait was abandoned because interruption was
    /// requested.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Errors that carry a message from the control plane itself.
    const fn is_remote(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::JobFailed { .. })
    }

    /// True when the error reports that the entity no longer exists.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        if !self.is_remote() {
            return false;
        }
        let message = self.message().to_ascii_lowercase();
        NOT_FOUND_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }

    /// True when a port range overlaps an existing forwarding or firewall
    /// rule.
    #[must_use]
    pub fn is_range_conflict(&self) -> bool {
        self.is_remote()
            && self
                .message()
                .to_ascii_lowercase()
                .contains(RANGE_CONFLICT_PATTERN)
    }

    /// True when a named entity already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.is_remote()
            && self
                .message()
                .to_ascii_lowercase()
                .contains(ALREADY_EXISTS_PATTERN)
    }
}
