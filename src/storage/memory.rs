//! In-memory lease store
//!
//! Mirrors the PostgreSQL semantics row for row behind a mutex, with an
//! injectable [`Clock`] so lease expiry can be driven deterministically, a
//! switch that makes every call fail as if the database were unreachable and
//! one that makes heartbeats hang.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ClaimRequest, Clock, DiscoverQuery, LeaseStore, StoreError, StoreResult, SystemClock};
use crate::claim::policy::discovery_order;
use crate::models::{
    to_chrono, Lease, LiveTransition, NewWorkUnit, PolicyUpdate, ProcessingErrorOutcome, UnitFilter,
    UnitStatus, WorkUnit,
};

/// Lease store held in process memory
pub struct InMemoryLeaseStore {
    rows: Mutex<BTreeMap<i64, WorkUnit>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    heartbeat_stalled: AtomicBool,
}

impl InMemoryLeaseStore {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on a caller-provided clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            clock,
            unavailable: AtomicBool::new(false),
            heartbeat_stalled: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make heartbeats hang until the caller gives up, like a stuck connection
    pub fn set_heartbeat_stalled(&self, stalled: bool) {
        self.heartbeat_stalled.store(stalled, Ordering::SeqCst);
    }

    fn rows(&self) -> StoreResult<MutexGuard<'_, BTreeMap<i64, WorkUnit>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        self.rows.lock().map_err(|_| StoreError::Poisoned)
    }

    fn new_row(&self, unit: &NewWorkUnit, shard_index: i32, now: DateTime<Utc>) -> WorkUnit {
        WorkUnit {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            platform: unit.platform,
            server_id: unit.server_id.clone(),
            channel_id: unit.channel_id.clone(),
            entity_id: unit.entity_id.clone(),
            shard_index,
            claimed_by: None,
            claimed_at: None,
            claim_expires: None,
            lease_seconds: None,
            heartbeat_interval_seconds: unit.effective_heartbeat_interval(),
            status: UnitStatus::Available,
            status_changed_at: now,
            is_live: false,
            live_since: None,
            viewer_count: 0,
            last_activity: None,
            last_check: None,
            last_checkin: None,
            priority: unit.priority,
            max_containers: unit.max_containers,
            error_count: 0,
            config: unit.config.clone(),
            metadata: unit.metadata.clone(),
            created_at: now,
        }
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

fn clear_ownership(unit: &mut WorkUnit) {
    unit.claimed_by = None;
    unit.claimed_at = None;
    unit.claim_expires = None;
    unit.lease_seconds = None;
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn discover_claimable(&self, query: &DiscoverQuery) -> StoreResult<Vec<WorkUnit>> {
        let now = self.clock.now();
        let rows = self.rows()?;
        let mut units: Vec<WorkUnit> = rows
            .values()
            .filter(|u| u.platform == query.platform && u.is_claimable(now, query.cooldown))
            .cloned()
            .collect();
        units.sort_by(discovery_order);
        units.truncate(query.limit);
        Ok(units)
    }

    async fn get(&self, unit_id: i64) -> StoreResult<Option<WorkUnit>> {
        Ok(self.rows()?.get(&unit_id).cloned())
    }

    async fn try_claim(&self, request: &ClaimRequest) -> StoreResult<Option<Lease>> {
        let now = self.clock.now();
        let mut rows = self.rows()?;

        let entity_id = match rows.get(&request.unit_id) {
            Some(unit)
                if unit.observed_claim() == request.observed
                    && unit.is_claimable(now, request.cooldown) =>
            {
                unit.entity_id.clone()
            }
            _ => return Ok(None),
        };

        let holds_sibling = rows.values().any(|other| {
            other.entity_id == entity_id
                && other.id != request.unit_id
                && other.claimed_by.as_deref() == Some(request.instance_id.as_str())
                && other.has_live_claim(now)
        });
        if holds_sibling {
            return Ok(None);
        }

        let Some(unit) = rows.get_mut(&request.unit_id) else {
            return Ok(None);
        };
        let expires_at = now + to_chrono(request.lease);
        unit.claimed_by = Some(request.instance_id.clone());
        unit.claimed_at = Some(now);
        unit.claim_expires = Some(expires_at);
        unit.lease_seconds = Some(request.lease.as_secs_f64().ceil() as i32);
        unit.status = UnitStatus::Claimed;
        unit.status_changed_at = now;
        unit.error_count = 0;

        Ok(Some(Lease {
            unit_id: request.unit_id,
            instance_id: request.instance_id.clone(),
            claimed_at: now,
            expires_at,
        }))
    }

    async fn heartbeat(&self, unit_id: i64, instance_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        if self.heartbeat_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id).filter(|u| u.is_owned_by(instance_id)) else {
            return Ok(None);
        };

        let lease_secs = unit
            .lease_seconds
            .unwrap_or(unit.heartbeat_interval_seconds * 3);
        let renewed = now + chrono::Duration::seconds(lease_secs as i64);
        let expires = unit.claim_expires.map_or(renewed, |current| current.max(renewed));
        unit.claim_expires = Some(expires);
        unit.last_checkin = Some(now);
        unit.error_count = 0;
        Ok(Some(expires))
    }

    async fn release(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id).filter(|u| u.is_owned_by(instance_id)) else {
            return Ok(false);
        };
        clear_ownership(unit);
        unit.status = UnitStatus::Available;
        unit.status_changed_at = now;
        Ok(true)
    }

    async fn record_processing_error(
        &self,
        unit_id: i64,
        instance_id: &str,
        threshold: i32,
    ) -> StoreResult<Option<ProcessingErrorOutcome>> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id).filter(|u| u.is_owned_by(instance_id)) else {
            return Ok(None);
        };

        unit.error_count += 1;
        let escalated = unit.error_count >= threshold;
        if escalated {
            clear_ownership(unit);
            unit.status = UnitStatus::Error;
            unit.status_changed_at = now;
        }
        Ok(Some(ProcessingErrorOutcome {
            error_count: unit.error_count,
            escalated,
        }))
    }

    async fn mark_offline(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id).filter(|u| u.is_owned_by(instance_id)) else {
            return Ok(false);
        };
        clear_ownership(unit);
        unit.status = UnitStatus::Offline;
        unit.status_changed_at = now;
        Ok(true)
    }

    async fn reset(&self, unit_id: i64) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id).filter(|u| u.status.is_parked()) else {
            return Ok(false);
        };
        clear_ownership(unit);
        unit.status = UnitStatus::Available;
        unit.status_changed_at = now;
        unit.error_count = 0;
        Ok(true)
    }

    async fn reset_entity(&self, entity_id: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let mut changed = 0;
        for unit in rows
            .values_mut()
            .filter(|u| u.entity_id == entity_id && u.status.is_parked())
        {
            clear_ownership(unit);
            unit.status = UnitStatus::Available;
            unit.status_changed_at = now;
            unit.error_count = 0;
            changed += 1;
        }
        Ok(changed)
    }

    async fn record_activity(&self, unit_id: i64) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        match rows.get_mut(&unit_id) {
            Some(unit) => {
                unit.last_activity = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_live_state(
        &self,
        unit_id: i64,
        is_live: bool,
        viewer_count: i32,
    ) -> StoreResult<Option<LiveTransition>> {
        let now = self.clock.now();
        let mut rows = self.rows()?;
        let Some(unit) = rows.get_mut(&unit_id) else {
            return Ok(None);
        };

        let transition = LiveTransition::between(unit.is_live, is_live);
        match transition {
            LiveTransition::WentLive => unit.live_since = Some(now),
            LiveTransition::WentOffline => unit.live_since = None,
            LiveTransition::Unchanged => {}
        }
        unit.is_live = is_live;
        unit.viewer_count = viewer_count.max(0);
        unit.last_check = Some(now);
        Ok(Some(transition))
    }

    async fn register(&self, unit: &NewWorkUnit) -> StoreResult<Vec<WorkUnit>> {
        unit.validate()?;
        let now = self.clock.now();
        let mut rows = self.rows()?;
        if rows.values().any(|u| u.entity_id == unit.entity_id) {
            return Err(StoreError::Duplicate(unit.entity_id.clone()));
        }

        let created: Vec<WorkUnit> = (0..unit.max_containers)
            .map(|shard| self.new_row(unit, shard, now))
            .collect();
        for row in &created {
            rows.insert(row.id, row.clone());
        }
        Ok(created)
    }

    async fn deregister(&self, entity_id: &str) -> StoreResult<u64> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|_, u| u.entity_id != entity_id);
        Ok((before - rows.len()) as u64)
    }

    async fn update_policy(&self, entity_id: &str, update: &PolicyUpdate) -> StoreResult<u64> {
        update.validate()?;
        let now = self.clock.now();
        let mut rows = self.rows()?;

        let mut changed = 0;
        for unit in rows.values_mut().filter(|u| u.entity_id == entity_id) {
            if let Some(priority) = update.priority {
                unit.priority = priority;
            }
            if let Some(interval) = update.heartbeat_interval_seconds {
                unit.heartbeat_interval_seconds = interval;
            }
            if let Some(max) = update.max_containers {
                unit.max_containers = max;
            }
            changed += 1;
        }

        if let Some(max) = update.max_containers {
            rows.retain(|_, u| u.entity_id != entity_id || u.shard_index < max);
            let template = rows
                .values()
                .find(|u| u.entity_id == entity_id && u.shard_index == 0)
                .cloned();
            if let Some(template) = template {
                let existing: Vec<i32> = rows
                    .values()
                    .filter(|u| u.entity_id == entity_id)
                    .map(|u| u.shard_index)
                    .collect();
                for shard in (0..max).filter(|s| !existing.contains(s)) {
                    let mut row = template.clone();
                    row.id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    row.shard_index = shard;
                    clear_ownership(&mut row);
                    row.status = UnitStatus::Available;
                    row.status_changed_at = now;
                    row.is_live = false;
                    row.live_since = None;
                    row.viewer_count = 0;
                    row.error_count = 0;
                    row.created_at = now;
                    rows.insert(row.id, row);
                }
            }
        }
        Ok(changed)
    }

    async fn find_by_entity(&self, entity_id: &str) -> StoreResult<Vec<WorkUnit>> {
        let rows = self.rows()?;
        let mut units: Vec<WorkUnit> = rows
            .values()
            .filter(|u| u.entity_id == entity_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.shard_index);
        Ok(units)
    }

    async fn list(&self, filter: &UnitFilter) -> StoreResult<Vec<WorkUnit>> {
        let now = self.clock.now();
        let rows = self.rows()?;
        let mut units: Vec<WorkUnit> = rows
            .values()
            .filter(|u| filter.matches(u, now))
            .cloned()
            .collect();
        units.sort_by(|a, b| {
            (a.platform.as_str(), a.priority, &a.entity_id, a.shard_index)
                .cmp(&(b.platform.as_str(), b.priority, &b.entity_id, b.shard_index))
        });
        Ok(units)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
