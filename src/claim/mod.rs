//! Claim manager: discovery, conditional claims, lease renewal and release
//!
//! # State machine
//!
//! ```text
//! available --try_claim--> claimed --heartbeat--> claimed
//! claimed --release--> available
//! claimed --lease expiry (passive)--> available
//! claimed --report_processing_error x threshold--> error --cooldown/reset--> available
//! claimed --mark_offline--> offline --cooldown/reset--> available
//! ```
//!
//! Every store call runs under a timeout shorter than any lease, so a hung
//! connection surfaces as [`LeaseError::StoreUnavailable`] while the lease can
//! still be renewed or given back.

pub mod error;
pub mod policy;
pub mod session;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::LeaseConfig;
use crate::metrics;
use crate::models::{ClaimOutcome, Platform, ProcessingErrorOutcome, WorkUnit};
use crate::storage::{ClaimRequest, DiscoverQuery, LeaseStore, StoreResult};

pub use error::{LeaseError, LeaseResult};
pub use policy::RebalancePolicy;
pub use session::{keep_alive, LeaseGuard, RevokeReason};

/// Run a store call under `timeout`, mapping failures into the lease taxonomy
pub(crate) async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> LeaseResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_unavailable() => {
            warn!(operation, error = %e, "Store call failed");
            metrics::record_store_failure(operation);
            Err(LeaseError::StoreUnavailable {
                operation,
                reason: e.to_string(),
            })
        }
        Ok(Err(e)) => Err(LeaseError::Store(e)),
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Store call timed out");
            metrics::record_store_failure(operation);
            Err(LeaseError::StoreUnavailable {
                operation,
                reason: format!("timed out after {}ms", timeout.as_millis()),
            })
        }
    }
}

/// Lease operations against the shared store
pub struct ClaimManager {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Lease length granted to `unit`
    pub fn lease_for(&self, unit: &WorkUnit) -> Duration {
        self.config.lease_for(unit.heartbeat_interval_seconds)
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> LeaseResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        bounded(operation, self.config.store_timeout(), fut).await
    }

    /// Ordered claim candidates for a platform; read-only
    pub async fn discover_claimable(&self, platform: Platform, limit: usize) -> LeaseResult<Vec<WorkUnit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = DiscoverQuery {
            platform,
            limit,
            cooldown: self.config.error_cooldown(),
        };
        self.call("discover", self.store.discover_claimable(&query)).await
    }

    /// Claim a unit by id, observing its current ownership first
    pub async fn try_claim(&self, unit_id: i64, instance_id: &str, lease: Duration) -> LeaseResult<ClaimOutcome> {
        let unit = self
            .call("get", self.store.get(unit_id))
            .await?
            .ok_or(LeaseError::UnitNotFound(unit_id))?;
        self.try_claim_observed(&unit, instance_id, lease).await
    }

    /// Claim a unit only if its ownership columns still match `observed`
    pub async fn try_claim_observed(
        &self,
        observed: &WorkUnit,
        instance_id: &str,
        lease: Duration,
    ) -> LeaseResult<ClaimOutcome> {
        let request = ClaimRequest {
            unit_id: observed.id,
            instance_id: instance_id.to_string(),
            lease,
            observed: observed.observed_claim(),
            cooldown: self.config.error_cooldown(),
        };

        let platform = observed.platform.as_str();
        let granted = match self.call("claim", self.store.try_claim(&request)).await {
            Ok(granted) => granted,
            Err(e) => {
                metrics::record_claim(platform, "failed");
                return Err(e);
            }
        };

        match granted {
            Some(lease) => {
                metrics::record_claim(platform, "claimed");
                info!(
                    unit_id = observed.id,
                    entity_id = %observed.entity_id,
                    instance = %instance_id,
                    expires_at = %lease.expires_at,
                    "Claimed work unit"
                );
                Ok(ClaimOutcome::Claimed(lease))
            }
            None => {
                metrics::record_claim(platform, "conflict");
                debug!(
                    unit_id = observed.id,
                    instance = %instance_id,
                    "Claim conflict, unit changed since discovery"
                );
                Ok(ClaimOutcome::Conflict)
            }
        }
    }

    /// Extend the lease; `OwnershipLost` if another instance holds the unit
    pub async fn heartbeat(&self, unit_id: i64, instance_id: &str) -> LeaseResult<DateTime<Utc>> {
        match self.call("heartbeat", self.store.heartbeat(unit_id, instance_id)).await? {
            Some(expires) => Ok(expires),
            None => {
                warn!(unit_id, instance = %instance_id, "Heartbeat rejected, ownership lost");
                Err(LeaseError::ownership_lost(unit_id, instance_id))
            }
        }
    }

    /// Give the unit back; `false` (not an error) when ownership already moved on
    pub async fn release(&self, unit_id: i64, instance_id: &str) -> LeaseResult<bool> {
        let released = self.call("release", self.store.release(unit_id, instance_id)).await?;
        if released {
            info!(unit_id, instance = %instance_id, "Released work unit");
        } else {
            debug!(unit_id, instance = %instance_id, "Release skipped, not the owner");
        }
        Ok(released)
    }

    /// Count a processing failure; parks the unit in `error` at the threshold
    pub async fn report_processing_error(
        &self,
        unit_id: i64,
        instance_id: &str,
    ) -> LeaseResult<ProcessingErrorOutcome> {
        let threshold = self.config.error_threshold_i32();
        let outcome = self
            .call(
                "record_processing_error",
                self.store.record_processing_error(unit_id, instance_id, threshold),
            )
            .await?
            .ok_or_else(|| LeaseError::ownership_lost(unit_id, instance_id))?;

        if outcome.escalated {
            error!(
                unit_id,
                instance = %instance_id,
                error_count = outcome.error_count,
                "Work unit reached error threshold, parked in error status"
            );
        } else {
            warn!(
                unit_id,
                instance = %instance_id,
                error_count = outcome.error_count,
                threshold,
                "Processing error recorded"
            );
        }
        Ok(outcome)
    }

    /// Owner-initiated release into `offline`
    pub async fn mark_offline(&self, unit_id: i64, instance_id: &str) -> LeaseResult<()> {
        if self.call("mark_offline", self.store.mark_offline(unit_id, instance_id)).await? {
            info!(unit_id, instance = %instance_id, "Work unit marked offline");
            Ok(())
        } else {
            Err(LeaseError::ownership_lost(unit_id, instance_id))
        }
    }

    /// Manual retry of an `error`/`offline` unit; `false` if it was not parked
    pub async fn reset(&self, unit_id: i64) -> LeaseResult<bool> {
        let reset = self.call("reset", self.store.reset(unit_id)).await?;
        if reset {
            info!(unit_id, "Work unit reset to available");
        }
        Ok(reset)
    }

    /// Reset every parked shard of an entity
    pub async fn reset_entity(&self, entity_id: &str) -> LeaseResult<u64> {
        let changed = self.call("reset", self.store.reset_entity(entity_id)).await?;
        if changed > 0 {
            info!(entity_id, shards = changed, "Entity reset to available");
        }
        Ok(changed)
    }
}
