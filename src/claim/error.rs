//! Lease error taxonomy

use thiserror::Error;

use crate::storage::StoreError;

/// Result type for lease operations
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Failures surfaced by the claim manager and liveness reporter
///
/// Losing a claim race is not an error; see [`crate::models::ClaimOutcome`].
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The caller no longer owns the unit; stop processing it
    #[error("Instance {instance_id} no longer owns unit {unit_id}")]
    OwnershipLost { unit_id: i64, instance_id: String },

    /// The store could not be reached within the call timeout
    #[error("Store unavailable during {operation}: {reason}")]
    StoreUnavailable {
        operation: &'static str,
        reason: String,
    },

    /// No such unit
    #[error("Work unit not found: {0}")]
    UnitNotFound(i64),

    /// The store rejected the request
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    pub fn ownership_lost(unit_id: i64, instance_id: &str) -> Self {
        Self::OwnershipLost {
            unit_id,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, Self::OwnershipLost { .. })
    }

    /// Transient; worth retrying while the lease lasts
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}
