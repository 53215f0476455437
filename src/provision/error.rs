//! Error types for provisioning.

use thiserror::Error;

use crate::config::ConfigError;
use crate::control_plane::ControlPlaneError;
use crate::ledger::LedgerError;
use crate::port_allocator::AllocationError;
use crate::resolver::ResolveError;
use crate::rules::DeriveError;
use crate::teardown::TeardownError;

/// Errors surfaced while provisioning an instance.
///
/// Failures after the instance id was recorded are only returned once
/// teardown has run; when teardown fails too the result is
/// [`ProvisionError::TeardownFailed`].
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A named resource could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Networking rules could not be derived from the configuration.
    #[error(transparent)]
    Derive(#[from] DeriveError),
    /// No public port could be forwarded.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The side-effect ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Teardown after an interruption failed.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    /// The control plane rejected a command.
    #[error("failed to {action} {target}: {source}")]
    ApiCommand {
        /// Operation that failed, for example `create security group`.
        action: &'static str,
        /// Resource the operation targeted.
        target: String,
        /// Underlying control-plane error.
        source: ControlPlaneError,
    },
    /// The instance vanished while it was being waited on.
    #[error("instance {instance_id} disappeared before it became ready")]
    InstanceMissing {
        /// Identifier of the missing instance.
        instance_id: String,
    },
    /// Neither a forwarded public address nor an instance address is known.
    #[error("no address to reach instance {instance_id} on")]
    NoGuestAddress {
        /// Identifier of the unreachable instance.
        instance_id: String,
    },
    /// The instance did not report `Running` within the configured bound.
    #[error(
        "instance {instance_id} was not running after {timeout_secs}s; \
         raise instance_ready_timeout if the zone is slow"
    )]
    ReadinessTimeout {
        /// Identifier of the instance that was torn down.
        instance_id: String,
        /// Configured timeout in seconds.
        timeout_secs: u64,
    },
    /// Provisioning failed and releasing what it created failed as well.
    #[error("{original}; teardown also failed: {teardown}")]
    TeardownFailed {
        /// The error that triggered teardown.
        original: Box<ProvisionError>,
        /// The teardown failure.
        teardown: Box<TeardownError>,
    },
}

impl ProvisionError {
    pub(crate) fn api(
        action: &'static str,
        target: impl Into<String>,
        source: ControlPlaneError,
    ) -> Self {
        Self::ApiCommand {
            action,
            target: target.into(),
            source,
        }
    }

    /// True when a job wait was abandoned because interruption was
    /// requested. The orchestrator turns these into an interrupted outcome
    /// rather than a failure.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        match self {
            Self::ApiCommand { source, .. }
            | Self::Allocation(AllocationError::Create { source, .. }) => source.is_interrupted(),
            _ => false,
        }
    }
}
