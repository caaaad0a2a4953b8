//! Error taxonomy for the balancing core.

use thiserror::Error;

/// Result alias used throughout the balancing core.
pub type Result<T> = std::result::Result<T, BalancerError>;

/// Errors surfaced by the balancing core and its hypervisor collaborator.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// The hypervisor client could not complete a call this tick.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Authentication with the hypervisor failed and could not be refreshed.
    #[error("hypervisor authentication failed: {0}")]
    Unauthorized(String),

    /// No feasible destination exists for a migration candidate.
    #[error("no feasible destination for vmid {vmid}")]
    Infeasible { vmid: u32 },

    /// The hypervisor rejected a migration dispatch outright.
    #[error("migration dispatch rejected for vmid {vmid}: {reason}")]
    DispatchRejected { vmid: u32, reason: String },

    /// The persisted configuration document failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The management API caller presented a missing or invalid API key.
    #[error("unauthorized request")]
    ApiUnauthorized,

    /// A requested entity (node, vm, migration) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl BalancerError {
    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Self::HypervisorUnavailable(msg.into())
    }

    pub fn dispatch_rejected(vmid: u32, reason: impl Into<String>) -> Self {
        Self::DispatchRejected { vmid, reason: reason.into() }
    }
}
