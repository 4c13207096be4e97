//! Lease store: the shared table every collector instance coordinates through
//!
//! All ownership changes go through conditional (claim-if-unchanged) updates on
//! a single row, so the store is the only source of truth for who owns what.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │       ClaimManager / LivenessReporter / read API            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LeaseStore trait                        │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                         │
//!                    ▼                         ▼
//!          ┌─────────────────┐       ┌─────────────────┐
//!          │   PostgreSQL    │       │    In-memory    │
//!          │  PgLeaseStore   │       │ (tests, drills) │
//!          └─────────────────┘       └─────────────────┘
//! ```

pub mod clock;
pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    Lease, LiveTransition, ModelError, NewWorkUnit, ObservedClaim, Platform, PolicyUpdate,
    ProcessingErrorOutcome, UnitFilter, WorkUnit,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::InMemoryLeaseStore;
pub use postgres::{PgLeaseStore, PgStoreConfig};

// ============================================================================
// Errors
// ============================================================================

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by a lease store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not obtain a pooled connection
    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Pool could not be built from configuration
    #[error("Failed to create connection pool: {0}")]
    CreatePool(String),

    /// Driver or server error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Backend unreachable (used by the in-memory store for fault injection)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Invalid row: {0}")]
    InvalidRow(#[from] ModelError),

    /// Entity already registered
    #[error("Entity already registered: {0}")]
    Duplicate(String),

    /// Internal lock was poisoned by a panicking writer
    #[error("Store state poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the failure means "could not reach the store" rather than
    /// "the store rejected the request"
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Unavailable(_) => true,
            Self::Postgres(e) => e.as_db_error().is_none(),
            Self::CreatePool(_) | Self::InvalidRow(_) | Self::Duplicate(_) | Self::Poisoned => {
                false
            }
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Parameters of a discovery query
#[derive(Debug, Clone, Copy)]
pub struct DiscoverQuery {
    pub platform: Platform,
    pub limit: usize,
    /// How long `error`/`offline` units stay parked before they are claimable again
    pub cooldown: Duration,
}

/// Conditional claim: applied only if the row still matches `observed`
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub unit_id: i64,
    pub instance_id: String,
    pub lease: Duration,
    pub observed: ObservedClaim,
    pub cooldown: Duration,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Access to the lease table
///
/// Ownership-changing calls return `None`/`false` when their condition does
/// not hold instead of failing; callers translate that into conflicts or lost
/// ownership.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claimable units for a platform, ordered by priority then staleness
    async fn discover_claimable(&self, query: &DiscoverQuery) -> StoreResult<Vec<WorkUnit>>;

    /// Fetch one unit
    async fn get(&self, unit_id: i64) -> StoreResult<Option<WorkUnit>>;

    /// Claim-if-unchanged; `None` when another writer got there first
    async fn try_claim(&self, request: &ClaimRequest) -> StoreResult<Option<Lease>>;

    /// Extend the lease held by `instance_id`; `None` when it no longer owns the unit
    async fn heartbeat(&self, unit_id: i64, instance_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Give the unit back; `false` when `instance_id` was not the owner
    async fn release(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool>;

    /// Count one failure; parks the unit in `error` once `threshold` is reached
    async fn record_processing_error(
        &self,
        unit_id: i64,
        instance_id: &str,
        threshold: i32,
    ) -> StoreResult<Option<ProcessingErrorOutcome>>;

    /// Owner-initiated forced release into `offline`
    async fn mark_offline(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool>;

    /// Move a parked (`error`/`offline`) unit back to `available`
    async fn reset(&self, unit_id: i64) -> StoreResult<bool>;

    /// Reset every parked shard of an entity; returns rows changed
    async fn reset_entity(&self, entity_id: &str) -> StoreResult<u64>;

    /// Touch `last_activity`; `false` if the unit does not exist
    async fn record_activity(&self, unit_id: i64) -> StoreResult<bool>;

    /// Update live columns; `None` if the unit does not exist
    async fn record_live_state(
        &self,
        unit_id: i64,
        is_live: bool,
        viewer_count: i32,
    ) -> StoreResult<Option<LiveTransition>>;

    /// Create one row per container slot of a newly monitored entity
    async fn register(&self, unit: &NewWorkUnit) -> StoreResult<Vec<WorkUnit>>;

    /// Delete every row of an entity; returns rows removed
    async fn deregister(&self, entity_id: &str) -> StoreResult<u64>;

    /// Apply policy columns to every shard, adding or dropping shards as needed
    async fn update_policy(&self, entity_id: &str, update: &PolicyUpdate) -> StoreResult<u64>;

    /// All shards of an entity, by shard index
    async fn find_by_entity(&self, entity_id: &str) -> StoreResult<Vec<WorkUnit>>;

    /// Units matching a filter
    async fn list(&self, filter: &UnitFilter) -> StoreResult<Vec<WorkUnit>>;

    /// Current time as the store sees it, for effective-status projections
    fn now(&self) -> DateTime<Utc>;
}
