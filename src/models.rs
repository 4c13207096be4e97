//! Core data structures for collector leases
//!
//! A [`WorkUnit`] is one claimable row of the lease table: a single channel (or
//! one container slot of a channel) on one chat platform, together with its
//! ownership, liveness and policy columns.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Parse Errors
// ============================================================================

/// Errors raised when decoding enum columns or validating new units
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Unknown unit status: {0}")]
    UnknownStatus(String),

    #[error("Invalid work unit: {0}")]
    InvalidUnit(String),
}

// ============================================================================
// Platform
// ============================================================================

/// Chat platform a collector family consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Discord,
    Slack,
}

impl Platform {
    /// All supported platforms
    pub fn all() -> [Platform; 3] {
        [Self::Twitch, Self::Discord, Self::Slack]
    }

    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Discord => "discord",
            Self::Slack => "slack",
        }
    }

    /// Heartbeat interval used when registration does not set one
    pub fn default_heartbeat_interval_secs(&self) -> i32 {
        match self {
            Self::Twitch => 30,
            Self::Discord => 20,
            Self::Slack => 60,
        }
    }

    /// Whether channels on this platform live under a parent server/workspace
    pub fn has_servers(&self) -> bool {
        !matches!(self, Self::Twitch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "twitch" => Ok(Self::Twitch),
            "discord" => Ok(Self::Discord),
            "slack" => Ok(Self::Slack),
            other => Err(ModelError::UnknownPlatform(other.to_string())),
        }
    }
}

// ============================================================================
// Unit Status
// ============================================================================

/// Ownership status column of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Available,
    Claimed,
    Offline,
    Error,
}

impl UnitStatus {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Claimed => "claimed",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// `offline` and `error` hold until a cooldown elapses or an operator resets them
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Offline | Self::Error)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "claimed" => Ok(Self::Claimed),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// Work Unit
// ============================================================================

/// Convert a std duration for timestamp arithmetic, saturating instead of panicking
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128 / 2) as i64)
}

/// One claimable row of the lease table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub platform: Platform,
    /// Parent guild/workspace; `None` on Twitch
    pub server_id: Option<String>,
    pub channel_id: String,
    /// Stable cross-platform identifier shared by every shard of the entity
    pub entity_id: String,
    /// Container slot, `0..max_containers`
    pub shard_index: i32,

    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires: Option<DateTime<Utc>>,
    /// Lease length granted by the current claim
    pub lease_seconds: Option<i32>,
    pub heartbeat_interval_seconds: i32,

    pub status: UnitStatus,
    pub status_changed_at: DateTime<Utc>,

    pub is_live: bool,
    pub live_since: Option<DateTime<Utc>>,
    pub viewer_count: i32,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_checkin: Option<DateTime<Utc>>,

    pub priority: i32,
    pub max_containers: i32,
    pub error_count: i32,
    pub config: serde_json::Value,
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl WorkUnit {
    /// True while the stored claim is backed by an unexpired lease
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.status == UnitStatus::Claimed
            && self.claimed_by.is_some()
            && self.claimed_at.is_some()
            && self.claim_expires.is_some_and(|expires| expires > now)
    }

    /// Status as readers should see it: a lapsed claim is logically available
    ///
    /// `error` and `offline` are reported as stored until an instance reclaims
    /// the unit, even after the cooldown has made it claimable again.
    pub fn effective_status(&self, now: DateTime<Utc>) -> UnitStatus {
        if self.status == UnitStatus::Claimed && !self.has_live_claim(now) {
            UnitStatus::Available
        } else {
            self.status
        }
    }

    /// Claimable predicate shared by discovery and the conditional claim
    pub fn is_claimable(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.status {
            UnitStatus::Available => true,
            UnitStatus::Claimed => self.claim_expires.map_or(true, |expires| expires <= now),
            UnitStatus::Offline | UnitStatus::Error => {
                self.status_changed_at
                    .checked_add_signed(to_chrono(cooldown))
                    .is_some_and(|ready_at| ready_at <= now)
            }
        }
    }

    /// Snapshot of the ownership columns used as the compare-and-swap match
    pub fn observed_claim(&self) -> ObservedClaim {
        ObservedClaim {
            claimed_by: self.claimed_by.clone(),
            claim_expires: self.claim_expires,
        }
    }

    /// Heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1) as u64)
    }

    /// True if `instance_id` is recorded as owner, regardless of expiry
    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.status == UnitStatus::Claimed && self.claimed_by.as_deref() == Some(instance_id)
    }

    /// Read-side projection
    pub fn view(&self, now: DateTime<Utc>) -> WorkUnitView {
        let status = self.effective_status(now);
        WorkUnitView {
            id: self.id,
            entity_id: self.entity_id.clone(),
            platform: self.platform,
            server_id: self.server_id.clone(),
            channel_id: self.channel_id.clone(),
            shard_index: self.shard_index,
            status,
            claimed_by: if status == UnitStatus::Claimed {
                self.claimed_by.clone()
            } else {
                None
            },
            claim_expires: if status == UnitStatus::Claimed {
                self.claim_expires
            } else {
                None
            },
            is_live: self.is_live,
            live_since: self.live_since,
            viewer_count: self.viewer_count,
            last_activity: self.last_activity,
            last_checkin: self.last_checkin,
            error_count: self.error_count,
            priority: self.priority,
        }
    }
}

/// Ownership columns observed at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedClaim {
    pub claimed_by: Option<String>,
    pub claim_expires: Option<DateTime<Utc>>,
}

/// Read API / dashboard projection of a work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitView {
    pub id: i64,
    pub entity_id: String,
    pub platform: Platform,
    pub server_id: Option<String>,
    pub channel_id: String,
    pub shard_index: i32,
    pub status: UnitStatus,
    pub claimed_by: Option<String>,
    pub claim_expires: Option<DateTime<Utc>>,
    pub is_live: bool,
    pub live_since: Option<DateTime<Utc>>,
    pub viewer_count: i32,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_checkin: Option<DateTime<Utc>>,
    pub error_count: i32,
    pub priority: i32,
}

// ============================================================================
// Registration
// ============================================================================

/// Registration request coming from the admin layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkUnit {
    pub platform: Platform,
    pub server_id: Option<String>,
    pub channel_id: String,
    pub entity_id: String,
    pub priority: i32,
    pub max_containers: i32,
    pub heartbeat_interval_seconds: Option<i32>,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewWorkUnit {
    /// Create a registration with default policy
    pub fn new(platform: Platform, entity_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            platform,
            server_id: None,
            channel_id: channel_id.into(),
            entity_id: entity_id.into(),
            priority: 0,
            max_containers: 1,
            heartbeat_interval_seconds: None,
            config: empty_object(),
            metadata: empty_object(),
        }
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_containers(mut self, max_containers: i32) -> Self {
        self.max_containers = max_containers;
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: i32) -> Self {
        self.heartbeat_interval_seconds = Some(secs);
        self
    }

    /// Heartbeat interval after applying the platform default
    pub fn effective_heartbeat_interval(&self) -> i32 {
        self.heartbeat_interval_seconds
            .unwrap_or_else(|| self.platform.default_heartbeat_interval_secs())
    }

    /// Validate before insertion
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.entity_id.trim().is_empty() {
            return Err(ModelError::InvalidUnit("entity_id must not be empty".into()));
        }
        if self.channel_id.trim().is_empty() {
            return Err(ModelError::InvalidUnit("channel_id must not be empty".into()));
        }
        if self.max_containers < 1 {
            return Err(ModelError::InvalidUnit("max_containers must be at least 1".into()));
        }
        if self.effective_heartbeat_interval() < 1 {
            return Err(ModelError::InvalidUnit(
                "heartbeat_interval_seconds must be positive".into(),
            ));
        }
        match (self.platform.has_servers(), self.server_id.is_some()) {
            (false, true) => Err(ModelError::InvalidUnit(format!(
                "{} channels have no parent server",
                self.platform
            ))),
            (true, false) => Err(ModelError::InvalidUnit(format!(
                "{} channels require a server_id",
                self.platform
            ))),
            _ => Ok(()),
        }
    }
}

/// Per-entity policy change from the admin layer; `None` leaves a column untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub priority: Option<i32>,
    pub max_containers: Option<i32>,
    pub heartbeat_interval_seconds: Option<i32>,
}

impl PolicyUpdate {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.max_containers.is_some_and(|n| n < 1) {
            return Err(ModelError::InvalidUnit("max_containers must be at least 1".into()));
        }
        if self.heartbeat_interval_seconds.is_some_and(|n| n < 1) {
            return Err(ModelError::InvalidUnit(
                "heartbeat_interval_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Operation Results
// ============================================================================

/// Lease granted by a successful claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub unit_id: i64,
    pub instance_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a claim attempt; losing a race is not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Lease),
    Conflict,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Claimed(lease) => Some(lease),
            Self::Conflict => None,
        }
    }
}

/// Result of reporting a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingErrorOutcome {
    pub error_count: i32,
    /// The unit crossed the threshold and was parked in `error`
    pub escalated: bool,
}

/// Live-state edge observed by `record_live_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTransition {
    WentLive,
    WentOffline,
    Unchanged,
}

impl LiveTransition {
    pub fn between(was_live: bool, is_live: bool) -> Self {
        match (was_live, is_live) {
            (false, true) => Self::WentLive,
            (true, false) => Self::WentOffline,
            _ => Self::Unchanged,
        }
    }
}

/// Row filter for listing units
///
/// Filtering on `available` excludes parked units whose cooldown has elapsed;
/// discovery (see [`WorkUnit::is_claimable`]) returns them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UnitFilter {
    pub platform: Option<Platform>,
    /// Matched against the effective status
    pub status: Option<UnitStatus>,
}

impl UnitFilter {
    pub fn matches(&self, unit: &WorkUnit, now: DateTime<Utc>) -> bool {
        self.platform.map_or(true, |p| p == unit.platform)
            && self.status.map_or(true, |s| s == unit.effective_status(now))
    }
}
