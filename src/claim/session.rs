//! Per-unit lease session
//!
//! A [`LeaseGuard`] is the local view of one held lease. It tracks a
//! conservative monotonic deadline and a revocation signal that processing
//! tasks select on. [`keep_alive`] renews the lease on the unit's heartbeat
//! interval and revokes the guard when ownership is lost or the lease cannot
//! be confirmed before it runs out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::{ClaimManager, LeaseError, LeaseResult};
use crate::metrics;
use crate::models::Platform;
use crate::utils::retry::with_retry_until;

/// Why a lease session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    /// Another instance owns the unit now
    OwnershipLost,
    /// Renewal could not be confirmed before the local deadline
    LeaseUnconfirmed,
    /// Processing errors reached the threshold
    Escalated,
    /// Processing finished and the unit was given back
    Released,
    /// The instance is shutting down
    Shutdown,
}

struct GuardInner {
    unit_id: i64,
    instance_id: String,
    platform: Platform,
    lease: Duration,
    safety_margin: Duration,
    deadline: Mutex<Instant>,
    revoked: watch::Sender<Option<RevokeReason>>,
}

/// Shared handle to one held lease
#[derive(Clone)]
pub struct LeaseGuard {
    inner: Arc<GuardInner>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("unit_id", &self.inner.unit_id)
            .field("instance_id", &self.inner.instance_id)
            .field("revoked", &self.revoked())
            .finish()
    }
}

impl LeaseGuard {
    /// Start a session for a lease requested at `issued_at`
    ///
    /// The deadline is counted from when the claim was sent, not when it
    /// was confirmed, so it never outlives the stored expiry.
    pub fn new(
        unit_id: i64,
        instance_id: impl Into<String>,
        platform: Platform,
        lease: Duration,
        safety_margin: Duration,
        issued_at: Instant,
    ) -> Self {
        let (revoked, _) = watch::channel(None);
        Self {
            inner: Arc::new(GuardInner {
                unit_id,
                instance_id: instance_id.into(),
                platform,
                lease,
                safety_margin,
                deadline: Mutex::new(issued_at + lease),
                revoked,
            }),
        }
    }

    pub fn unit_id(&self) -> i64 {
        self.inner.unit_id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn platform(&self) -> Platform {
        self.inner.platform
    }

    pub fn lease(&self) -> Duration {
        self.inner.lease
    }

    /// Local expiry of the lease
    pub fn deadline(&self) -> Instant {
        *self
            .inner
            .deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point after which the lease is treated as lost
    pub fn usable_until(&self) -> Instant {
        self.deadline()
            .checked_sub(self.inner.safety_margin)
            .unwrap_or_else(Instant::now)
    }

    /// Push the deadline out after a renewal sent at `issued_at`; never moves it back
    pub fn extend(&self, issued_at: Instant) {
        let mut deadline = self
            .inner
            .deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let renewed = issued_at + self.inner.lease;
        if renewed > *deadline {
            *deadline = renewed;
        }
    }

    /// Not revoked and not within the safety margin of expiry
    pub fn is_valid(&self) -> bool {
        self.revoked().is_none() && Instant::now() < self.usable_until()
    }

    /// `OwnershipLost` unless the lease is still valid
    pub fn ensure_valid(&self) -> LeaseResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(LeaseError::ownership_lost(
                self.inner.unit_id,
                &self.inner.instance_id,
            ))
        }
    }

    /// End the session; the first reason wins. Returns whether this call revoked it.
    pub fn revoke(&self, reason: RevokeReason) -> bool {
        self.inner.revoked.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn revoked(&self) -> Option<RevokeReason> {
        *self.inner.revoked.borrow()
    }

    /// Resolves once the session is revoked
    pub async fn cancelled(&self) -> RevokeReason {
        let mut rx = self.inner.revoked.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        reason.unwrap_or(RevokeReason::Shutdown)
    }
}

/// Renew `guard`'s lease every `interval` until the session ends
///
/// Transient store failures are retried with backoff until the lease is
/// about to run out. At that point, or on lost ownership, the guard is
/// revoked so processing stops; an unconfirmed lease is also released on a
/// best-effort basis.
pub async fn keep_alive(manager: Arc<ClaimManager>, guard: LeaseGuard, interval: Duration) {
    let unit_id = guard.unit_id();
    let instance_id = guard.instance_id().to_string();
    let retry = manager.config().retry_config();

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = guard.cancelled() => return,
            _ = tokio::time::sleep_until(guard.usable_until()) => {
                lease_unconfirmed(&manager, &guard).await;
                return;
            }
            _ = ticker.tick() => {}
        }

        let issued_at = Instant::now();
        let renewal = with_retry_until(
            &retry,
            guard.usable_until(),
            || manager.heartbeat(unit_id, &instance_id),
            LeaseError::is_store_unavailable,
        );

        let result = tokio::select! {
            _ = guard.cancelled() => return,
            _ = tokio::time::sleep_until(guard.usable_until()) => {
                lease_unconfirmed(&manager, &guard).await;
                return;
            }
            result = renewal => result,
        };

        match result {
            Ok(expires_at) => {
                guard.extend(issued_at);
                metrics::record_heartbeat("ok");
                debug!(unit_id, instance = %instance_id, expires_at = %expires_at, "Lease renewed");
            }
            Err(LeaseError::OwnershipLost { .. }) => {
                metrics::record_heartbeat("lost");
                metrics::record_ownership_lost(guard.platform().as_str());
                warn!(unit_id, instance = %instance_id, "Ownership lost, stopping unit");
                guard.revoke(RevokeReason::OwnershipLost);
                return;
            }
            Err(e) => {
                metrics::record_heartbeat("failed");
                if Instant::now() < guard.usable_until() {
                    warn!(unit_id, instance = %instance_id, error = %e, "Heartbeat failed, lease still valid");
                } else {
                    lease_unconfirmed(&manager, &guard).await;
                    return;
                }
            }
        }
    }
}

async fn lease_unconfirmed(manager: &ClaimManager, guard: &LeaseGuard) {
    if !guard.revoke(RevokeReason::LeaseUnconfirmed) {
        return;
    }
    error!(
        unit_id = guard.unit_id(),
        instance = %guard.instance_id(),
        "Lease could not be renewed in time, cancelling processing"
    );
    if let Err(e) = manager.release(guard.unit_id(), guard.instance_id()).await {
        debug!(unit_id = guard.unit_id(), error = %e, "Best-effort release failed");
    }
}
