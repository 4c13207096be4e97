//! Liveness reporting from collectors
//!
//! Activity and live-state columns are informational and never change
//! ownership. The store does not check the owner on these writes, so the
//! reporter refuses them itself once the caller's lease is no longer valid.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::claim::{bounded, LeaseError, LeaseGuard, LeaseResult};
use crate::models::LiveTransition;
use crate::storage::LeaseStore;

/// Writes activity and live state for units held under a [`LeaseGuard`]
#[derive(Clone)]
pub struct LivenessReporter {
    store: Arc<dyn LeaseStore>,
    timeout: Duration,
}

impl LivenessReporter {
    pub fn new(store: Arc<dyn LeaseStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Touch `last_activity` (a message or event was seen)
    pub async fn record_activity(&self, guard: &LeaseGuard) -> LeaseResult<()> {
        guard.ensure_valid()?;
        let unit_id = guard.unit_id();
        if bounded("record_activity", self.timeout, self.store.record_activity(unit_id)).await? {
            Ok(())
        } else {
            Err(LeaseError::UnitNotFound(unit_id))
        }
    }

    /// Record a live-status poll result
    pub async fn record_live_state(
        &self,
        guard: &LeaseGuard,
        is_live: bool,
        viewer_count: u32,
    ) -> LeaseResult<LiveTransition> {
        guard.ensure_valid()?;
        let unit_id = guard.unit_id();
        let viewers = i32::try_from(viewer_count).unwrap_or(i32::MAX);

        let transition = bounded(
            "record_live_state",
            self.timeout,
            self.store.record_live_state(unit_id, is_live, viewers),
        )
        .await?
        .ok_or(LeaseError::UnitNotFound(unit_id))?;

        match transition {
            LiveTransition::WentLive => {
                info!(unit_id, viewer_count, "Channel went live");
            }
            LiveTransition::WentOffline => {
                info!(unit_id, "Channel went offline");
            }
            LiveTransition::Unchanged => {
                debug!(unit_id, is_live, viewer_count, "Live state unchanged");
            }
        }
        Ok(transition)
    }
}
