//! Read API for dashboards and the admin layer
//!
//! Ownership is read through the effective status: a claim whose lease has
//! lapsed is reported as `available` with no owner, whether or not anyone has
//! reclaimed the row yet.

pub mod server;

use std::collections::BTreeMap;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::{bounded, LeaseError};
use crate::metrics;
use crate::models::{Platform, UnitFilter, UnitStatus, WorkUnit, WorkUnitView};

pub use server::{ApiServer, AppState, ServerError};

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

fn store_error_response(e: LeaseError) -> Response {
    let status = if e.is_store_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    tracing::warn!(error = %e, "Read API store call failed");
    error_response(status, e.to_string())
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Status of one entity across its shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity_id: String,
    pub platform: Platform,
    /// Effective status of shard 0
    pub status: UnitStatus,
    /// Owner of shard 0 while its lease is live
    pub claimed_by: Option<String>,
    /// Live if any shard reports live
    pub is_live: bool,
    pub viewer_count: i32,
    pub last_activity: Option<DateTime<Utc>>,
    pub shards: Vec<WorkUnitView>,
}

impl EntityStatus {
    /// Aggregate shard rows; `None` for an unknown entity
    pub fn from_shards(shards: &[WorkUnit], now: DateTime<Utc>) -> Option<Self> {
        let views: Vec<WorkUnitView> = shards.iter().map(|u| u.view(now)).collect();
        let primary = views
            .iter()
            .min_by_key(|v| v.shard_index)?
            .clone();

        Some(Self {
            entity_id: primary.entity_id.clone(),
            platform: primary.platform,
            status: primary.status,
            claimed_by: primary.claimed_by.clone(),
            is_live: views.iter().any(|v| v.is_live),
            viewer_count: views.iter().map(|v| v.viewer_count).max().unwrap_or(0),
            last_activity: views.iter().filter_map(|v| v.last_activity).max(),
            shards: views,
        })
    }
}

/// Unit counts for dashboards
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total: usize,
    pub live: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_platform: BTreeMap<String, usize>,
    pub uptime_secs: u64,
}

/// Result of a manual reset
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub entity_id: String,
    pub shards_reset: u64,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        // Work unit endpoints
        .route("/workunits", get(list_work_units))
        .route("/workunits/{entity_id}", get(get_entity))
        .route("/workunits/{entity_id}/reset", post(reset_entity))
        .route_layer(axum::middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = std::time::Instant::now();

    let response = next.run(req).await;
    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        instance_id: state.instance_id.clone(),
    }))
}

/// Prometheus scrape endpoint
async fn get_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Unit counts by status and platform
async fn get_stats(State(state): State<AppState>) -> Response {
    let store = state.manager.store();
    let units = match bounded("list", state.timeout(), store.list(&UnitFilter::default())).await {
        Ok(units) => units,
        Err(e) => return store_error_response(e),
    };

    let now = store.now();
    let mut stats = StatsResponse {
        total: units.len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        ..Default::default()
    };
    for unit in &units {
        *stats
            .by_status
            .entry(unit.effective_status(now).to_string())
            .or_default() += 1;
        *stats
            .by_platform
            .entry(unit.platform.to_string())
            .or_default() += 1;
        if unit.is_live {
            stats.live += 1;
        }
    }

    (StatusCode::OK, Json(ApiResponse::success(stats))).into_response()
}

// ============================================================================
// Work Unit Handlers
// ============================================================================

/// List units, optionally filtered by platform and effective status
async fn list_work_units(State(state): State<AppState>, Query(filter): Query<UnitFilter>) -> Response {
    let store = state.manager.store();
    match bounded("list", state.timeout(), store.list(&filter)).await {
        Ok(units) => {
            let now = store.now();
            let views: Vec<WorkUnitView> = units.iter().map(|u| u.view(now)).collect();
            (StatusCode::OK, Json(ApiResponse::success(views))).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

/// Status of one entity
async fn get_entity(State(state): State<AppState>, Path(entity_id): Path<String>) -> Response {
    let store = state.manager.store();
    let shards = match bounded("find_by_entity", state.timeout(), store.find_by_entity(&entity_id)).await {
        Ok(shards) => shards,
        Err(e) => return store_error_response(e),
    };

    match EntityStatus::from_shards(&shards, store.now()) {
        Some(status) => (StatusCode::OK, Json(ApiResponse::success(status))).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Work unit not found: {entity_id}"),
        ),
    }
}

/// Manual retry of an entity parked in `error` or `offline`
async fn reset_entity(State(state): State<AppState>, Path(entity_id): Path<String>) -> Response {
    let store = state.manager.store();
    match bounded("find_by_entity", state.timeout(), store.find_by_entity(&entity_id)).await {
        Ok(shards) if shards.is_empty() => {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Work unit not found: {entity_id}"),
            )
        }
        Ok(_) => {}
        Err(e) => return store_error_response(e),
    }

    match state.manager.reset_entity(&entity_id).await {
        Ok(shards_reset) => (
            StatusCode::OK,
            Json(ApiResponse::success(ResetResponse {
                entity_id,
                shards_reset,
            })),
        )
            .into_response(),
        Err(e) => store_error_response(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::unit;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_error_response() {
        let response = ErrorResponse::new("boom");
        assert!(!response.success);
        assert_eq!(response.error, "boom");
    }

    #[test]
    fn test_entity_status_aggregates_shards() {
        let now = Utc::now();
        let mut primary = unit(1, "e1", now);
        primary.status = UnitStatus::Claimed;
        primary.claimed_by = Some("collector-a".into());
        primary.claimed_at = Some(now);
        primary.claim_expires = Some(now + chrono::Duration::seconds(30));
        primary.viewer_count = 10;

        let mut replica = unit(2, "e1", now);
        replica.shard_index = 1;
        replica.is_live = true;
        replica.viewer_count = 25;
        replica.last_activity = Some(now);

        let status = EntityStatus::from_shards(&[replica, primary], now).unwrap();
        assert_eq!(status.status, UnitStatus::Claimed);
        assert_eq!(status.claimed_by.as_deref(), Some("collector-a"));
        assert!(status.is_live);
        assert_eq!(status.viewer_count, 25);
        assert_eq!(status.last_activity, Some(now));
        assert_eq!(status.shards.len(), 2);
    }

    #[test]
    fn test_entity_status_hides_lapsed_owner() {
        let now = Utc::now();
        let mut u = unit(1, "e1", now);
        u.status = UnitStatus::Claimed;
        u.claimed_by = Some("collector-a".into());
        u.claimed_at = Some(now - chrono::Duration::seconds(60));
        u.claim_expires = Some(now - chrono::Duration::seconds(30));

        let status = EntityStatus::from_shards(&[u], now).unwrap();
        assert_eq!(status.status, UnitStatus::Available);
        assert!(status.claimed_by.is_none());
    }

    #[test]
    fn test_unknown_entity() {
        assert!(EntityStatus::from_shards(&[], Utc::now()).is_none());
    }
}
