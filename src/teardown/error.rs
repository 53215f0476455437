//! Error types for teardown.

use thiserror::Error;

use crate::control_plane::ControlPlaneError;
use crate::ledger::LedgerError;

/// Errors raised while reversing recorded side effects.
///
/// Entities that are already gone never produce an error; they are
/// reported through [`super::TeardownReport::already_removed`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TeardownError {
    /// The control plane refused a removal.
    #[error("failed to {action} {target}: {source}")]
    ApiCommand {
        /// Removal that failed, for example `delete firewall rule`.
        action: &'static str,
        /// Identifier of the entity being removed.
        target: String,
        /// Underlying control-plane error.
        source: ControlPlaneError,
    },
    /// The ledger could not be read or updated.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
