//! PostgreSQL lease store
//!
//! Every ownership change is one conditional `UPDATE ... RETURNING`; zero rows
//! back means the condition did not hold. Timestamps come from the database
//! clock (`NOW()`) so instances never compare their own wall clocks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use super::{ClaimRequest, DiscoverQuery, LeaseStore, StoreError, StoreResult};
use crate::models::{
    Lease, LiveTransition, NewWorkUnit, PolicyUpdate, ProcessingErrorOutcome, UnitFilter,
    UnitStatus, WorkUnit,
};

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for the lease table
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/collectors".to_string(),
            pool_size: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PgStoreConfig {
    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database_url = url.to_string();
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

// ============================================================================
// SQL
// ============================================================================

const TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS work_units (
        id BIGSERIAL PRIMARY KEY,
        platform TEXT NOT NULL CHECK (platform IN ('twitch', 'discord', 'slack')),
        server_id TEXT,
        channel_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        shard_index INTEGER NOT NULL DEFAULT 0,

        claimed_by TEXT,
        claimed_at TIMESTAMPTZ,
        claim_expires TIMESTAMPTZ,
        lease_seconds INTEGER,
        heartbeat_interval_seconds INTEGER NOT NULL DEFAULT 30
            CHECK (heartbeat_interval_seconds > 0),

        status TEXT NOT NULL DEFAULT 'available'
            CHECK (status IN ('available', 'claimed', 'offline', 'error')),
        status_changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

        is_live BOOLEAN NOT NULL DEFAULT FALSE,
        live_since TIMESTAMPTZ,
        viewer_count INTEGER NOT NULL DEFAULT 0 CHECK (viewer_count >= 0),
        last_activity TIMESTAMPTZ,
        last_check TIMESTAMPTZ,
        last_checkin TIMESTAMPTZ,

        priority INTEGER NOT NULL DEFAULT 0,
        max_containers INTEGER NOT NULL DEFAULT 1 CHECK (max_containers >= 1),
        error_count INTEGER NOT NULL DEFAULT 0,
        config JSONB NOT NULL DEFAULT '{}'::jsonb,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

        UNIQUE (entity_id, shard_index),
        CHECK (status <> 'available' OR claimed_by IS NULL)
    );

    CREATE INDEX IF NOT EXISTS idx_work_units_discovery
        ON work_units(platform, status, priority, claim_expires);

    CREATE INDEX IF NOT EXISTS idx_work_units_entity
        ON work_units(entity_id);

    CREATE INDEX IF NOT EXISTS idx_work_units_claimed_by
        ON work_units(claimed_by);
"#;

const COLUMNS: &str = "id, platform, server_id, channel_id, entity_id, shard_index, \
     claimed_by, claimed_at, claim_expires, lease_seconds, heartbeat_interval_seconds, \
     status, status_changed_at, is_live, live_since, viewer_count, last_activity, \
     last_check, last_checkin, priority, max_containers, error_count, config, metadata, \
     created_at";

const EFFECTIVE_STATUS: &str = "CASE WHEN status = 'claimed' AND (claimed_by IS NULL \
     OR claimed_at IS NULL OR claim_expires IS NULL OR claim_expires <= NOW()) \
     THEN 'available' ELSE status END";

const CLEAR_OWNERSHIP: &str =
    "claimed_by = NULL, claimed_at = NULL, claim_expires = NULL, lease_seconds = NULL";

/// Claimable predicate; the cooldown (seconds, float8) is bound at `$cooldown_param`
fn claimable_predicate(cooldown_param: usize) -> String {
    format!(
        "(status = 'available' \
          OR (status = 'claimed' AND (claim_expires IS NULL OR claim_expires <= NOW())) \
          OR (status IN ('error', 'offline') \
              AND status_changed_at <= NOW() - ${cooldown_param}::float8 * INTERVAL '1 second'))"
    )
}

fn row_to_unit(row: &Row) -> StoreResult<WorkUnit> {
    Ok(WorkUnit {
        id: row.try_get("id")?,
        platform: row.try_get::<_, String>("platform")?.parse()?,
        server_id: row.try_get("server_id")?,
        channel_id: row.try_get("channel_id")?,
        entity_id: row.try_get("entity_id")?,
        shard_index: row.try_get("shard_index")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        claim_expires: row.try_get("claim_expires")?,
        lease_seconds: row.try_get("lease_seconds")?,
        heartbeat_interval_seconds: row.try_get("heartbeat_interval_seconds")?,
        status: row.try_get::<_, String>("status")?.parse()?,
        status_changed_at: row.try_get("status_changed_at")?,
        is_live: row.try_get("is_live")?,
        live_since: row.try_get("live_since")?,
        viewer_count: row.try_get("viewer_count")?,
        last_activity: row.try_get("last_activity")?,
        last_check: row.try_get("last_check")?,
        last_checkin: row.try_get("last_checkin")?,
        priority: row.try_get("priority")?,
        max_containers: row.try_get("max_containers")?,
        error_count: row.try_get("error_count")?,
        config: row.try_get("config")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rows_to_units(rows: &[Row]) -> StoreResult<Vec<WorkUnit>> {
    rows.iter().map(row_to_unit).collect()
}

// ============================================================================
// Store
// ============================================================================

/// Lease store on a pooled PostgreSQL connection
pub struct PgLeaseStore {
    pool: Pool,
    config: PgStoreConfig,
}

impl PgLeaseStore {
    /// Build the pool and verify connectivity
    pub async fn connect(config: PgStoreConfig) -> StoreResult<Self> {
        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(config.database_url.clone());
        pool_config.connect_timeout = Some(config.connect_timeout);
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::CreatePool(e.to_string()))?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        Ok(Self { pool, config })
    }

    /// Create the lease table and its indexes
    pub async fn init_schema(&self) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(TABLE_DDL).await?;

        tracing::info!("Lease schema initialized");
        Ok(())
    }

    /// Get pool status
    pub fn pool_status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
            max_size: self.config.pool_size,
        }
    }

    async fn update_flag(&self, sql: &str, params: &[&(dyn tokio_postgres::types::ToSql + Sync)]) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        Ok(client.execute(sql, params).await? > 0)
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn discover_claimable(&self, query: &DiscoverQuery) -> StoreResult<Vec<WorkUnit>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {COLUMNS} FROM work_units \
             WHERE platform = $1 AND {} \
             ORDER BY priority ASC, claim_expires ASC NULLS FIRST, id ASC \
             LIMIT $3",
            claimable_predicate(2)
        );
        let rows = client
            .query(
                &sql,
                &[
                    &query.platform.as_str(),
                    &query.cooldown.as_secs_f64(),
                    &(query.limit as i64),
                ],
            )
            .await?;
        rows_to_units(&rows)
    }

    async fn get(&self, unit_id: i64) -> StoreResult<Option<WorkUnit>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM work_units WHERE id = $1"),
                &[&unit_id],
            )
            .await?;
        row.as_ref().map(row_to_unit).transpose()
    }

    async fn try_claim(&self, request: &ClaimRequest) -> StoreResult<Option<Lease>> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE work_units SET \
                 claimed_by = $2, \
                 claimed_at = NOW(), \
                 claim_expires = NOW() + $3::float8 * INTERVAL '1 second', \
                 lease_seconds = $4, \
                 status = 'claimed', \
                 status_changed_at = NOW(), \
                 error_count = 0 \
             WHERE id = $1 \
               AND claimed_by IS NOT DISTINCT FROM $5 \
               AND claim_expires IS NOT DISTINCT FROM $6 \
               AND {} \
               AND NOT EXISTS ( \
                   SELECT 1 FROM work_units sibling \
                   WHERE sibling.entity_id = work_units.entity_id \
                     AND sibling.id <> work_units.id \
                     AND sibling.claimed_by = $2 \
                     AND sibling.status = 'claimed' \
                     AND sibling.claim_expires > NOW()) \
             RETURNING claimed_at, claim_expires",
            claimable_predicate(7)
        );
        let lease_seconds = request.lease.as_secs_f64().ceil() as i32;
        let row = client
            .query_opt(
                &sql,
                &[
                    &request.unit_id,
                    &request.instance_id,
                    &request.lease.as_secs_f64(),
                    &lease_seconds,
                    &request.observed.claimed_by,
                    &request.observed.claim_expires,
                    &request.cooldown.as_secs_f64(),
                ],
            )
            .await?;

        match row {
            Some(row) => Ok(Some(Lease {
                unit_id: request.unit_id,
                instance_id: request.instance_id.clone(),
                claimed_at: row.try_get("claimed_at")?,
                expires_at: row.try_get("claim_expires")?,
            })),
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, unit_id: i64, instance_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE work_units SET \
                     claim_expires = GREATEST( \
                         COALESCE(claim_expires, NOW()), \
                         NOW() + COALESCE(lease_seconds, heartbeat_interval_seconds * 3) \
                             * INTERVAL '1 second'), \
                     last_checkin = NOW(), \
                     error_count = 0 \
                 WHERE id = $1 AND claimed_by = $2 AND status = 'claimed' \
                 RETURNING claim_expires",
                &[&unit_id, &instance_id],
            )
            .await?;
        row.map(|r| r.try_get("claim_expires")).transpose().map_err(Into::into)
    }

    async fn release(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool> {
        self.update_flag(
            &format!(
                "UPDATE work_units SET {CLEAR_OWNERSHIP}, status = 'available', \
                     status_changed_at = NOW() \
                 WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'"
            ),
            &[&unit_id, &instance_id],
        )
        .await
    }

    async fn record_processing_error(
        &self,
        unit_id: i64,
        instance_id: &str,
        threshold: i32,
    ) -> StoreResult<Option<ProcessingErrorOutcome>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE work_units SET \
                     error_count = error_count + 1, \
                     status = CASE WHEN error_count + 1 >= $3 THEN 'error' ELSE status END, \
                     status_changed_at = CASE WHEN error_count + 1 >= $3 \
                         THEN NOW() ELSE status_changed_at END, \
                     claimed_by = CASE WHEN error_count + 1 >= $3 THEN NULL ELSE claimed_by END, \
                     claimed_at = CASE WHEN error_count + 1 >= $3 THEN NULL ELSE claimed_at END, \
                     claim_expires = CASE WHEN error_count + 1 >= $3 \
                         THEN NULL ELSE claim_expires END, \
                     lease_seconds = CASE WHEN error_count + 1 >= $3 \
                         THEN NULL ELSE lease_seconds END \
                 WHERE id = $1 AND claimed_by = $2 AND status = 'claimed' \
                 RETURNING error_count, status",
                &[&unit_id, &instance_id, &threshold],
            )
            .await?;

        match row {
            Some(row) => {
                let status: UnitStatus = row.try_get::<_, String>("status")?.parse()?;
                Ok(Some(ProcessingErrorOutcome {
                    error_count: row.try_get("error_count")?,
                    escalated: status == UnitStatus::Error,
                }))
            }
            None => Ok(None),
        }
    }

    async fn mark_offline(&self, unit_id: i64, instance_id: &str) -> StoreResult<bool> {
        self.update_flag(
            &format!(
                "UPDATE work_units SET {CLEAR_OWNERSHIP}, status = 'offline', \
                     status_changed_at = NOW() \
                 WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'"
            ),
            &[&unit_id, &instance_id],
        )
        .await
    }

    async fn reset(&self, unit_id: i64) -> StoreResult<bool> {
        self.update_flag(
            &format!(
                "UPDATE work_units SET {CLEAR_OWNERSHIP}, status = 'available', \
                     status_changed_at = NOW(), error_count = 0 \
                 WHERE id = $1 AND status IN ('error', 'offline')"
            ),
            &[&unit_id],
        )
        .await
    }

    async fn reset_entity(&self, entity_id: &str) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                &format!(
                    "UPDATE work_units SET {CLEAR_OWNERSHIP}, status = 'available', \
                         status_changed_at = NOW(), error_count = 0 \
                     WHERE entity_id = $1 AND status IN ('error', 'offline')"
                ),
                &[&entity_id],
            )
            .await?;
        Ok(changed)
    }

    async fn record_activity(&self, unit_id: i64) -> StoreResult<bool> {
        self.update_flag(
            "UPDATE work_units SET last_activity = NOW() WHERE id = $1",
            &[&unit_id],
        )
        .await
    }

    async fn record_live_state(
        &self,
        unit_id: i64,
        is_live: bool,
        viewer_count: i32,
    ) -> StoreResult<Option<LiveTransition>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE work_units w SET \
                     is_live = $2, \
                     viewer_count = GREATEST($3, 0), \
                     live_since = CASE \
                         WHEN $2 AND NOT prev.is_live THEN NOW() \
                         WHEN NOT $2 THEN NULL \
                         ELSE w.live_since END, \
                     last_check = NOW() \
                 FROM (SELECT id, is_live FROM work_units WHERE id = $1 FOR UPDATE) prev \
                 WHERE w.id = prev.id \
                 RETURNING prev.is_live AS was_live",
                &[&unit_id, &is_live, &viewer_count],
            )
            .await?;

        match row {
            Some(row) => {
                let was_live: bool = row.try_get("was_live")?;
                Ok(Some(LiveTransition::between(was_live, is_live)))
            }
            None => Ok(None),
        }
    }

    async fn register(&self, unit: &NewWorkUnit) -> StoreResult<Vec<WorkUnit>> {
        unit.validate()?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let sql = format!(
            "INSERT INTO work_units \
                 (platform, server_id, channel_id, entity_id, shard_index, \
                  heartbeat_interval_seconds, priority, max_containers, config, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {COLUMNS}"
        );
        let heartbeat = unit.effective_heartbeat_interval();

        let mut created = Vec::with_capacity(unit.max_containers as usize);
        for shard in 0..unit.max_containers {
            let row = tx
                .query_one(
                    &sql,
                    &[
                        &unit.platform.as_str(),
                        &unit.server_id,
                        &unit.channel_id,
                        &unit.entity_id,
                        &shard,
                        &heartbeat,
                        &unit.priority,
                        &unit.max_containers,
                        &unit.config,
                        &unit.metadata,
                    ],
                )
                .await
                .map_err(|e| {
                    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                        StoreError::Duplicate(unit.entity_id.clone())
                    } else {
                        StoreError::Postgres(e)
                    }
                })?;
            created.push(row_to_unit(&row)?);
        }

        tx.commit().await?;
        tracing::info!(
            entity_id = %unit.entity_id,
            platform = %unit.platform,
            shards = created.len(),
            "Registered work unit"
        );
        Ok(created)
    }

    async fn deregister(&self, entity_id: &str) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        let removed = client
            .execute("DELETE FROM work_units WHERE entity_id = $1", &[&entity_id])
            .await?;
        Ok(removed)
    }

    async fn update_policy(&self, entity_id: &str, update: &PolicyUpdate) -> StoreResult<u64> {
        update.validate()?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let changed = tx
            .execute(
                "UPDATE work_units SET \
                     priority = COALESCE($2, priority), \
                     max_containers = COALESCE($3, max_containers), \
                     heartbeat_interval_seconds = COALESCE($4, heartbeat_interval_seconds) \
                 WHERE entity_id = $1",
                &[
                    &entity_id,
                    &update.priority,
                    &update.max_containers,
                    &update.heartbeat_interval_seconds,
                ],
            )
            .await?;

        if let Some(max) = update.max_containers {
            tx.execute(
                "DELETE FROM work_units WHERE entity_id = $1 AND shard_index >= $2",
                &[&entity_id, &max],
            )
            .await?;
            tx.execute(
                "INSERT INTO work_units \
                     (platform, server_id, channel_id, entity_id, shard_index, \
                      heartbeat_interval_seconds, priority, max_containers, config, metadata) \
                 SELECT t.platform, t.server_id, t.channel_id, t.entity_id, g.shard, \
                        t.heartbeat_interval_seconds, t.priority, t.max_containers, \
                        t.config, t.metadata \
                 FROM (SELECT * FROM work_units WHERE entity_id = $1 AND shard_index = 0) t \
                 CROSS JOIN generate_series(0, $2::int - 1) AS g(shard) \
                 ON CONFLICT (entity_id, shard_index) DO NOTHING",
                &[&entity_id, &max],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(changed)
    }

    async fn find_by_entity(&self, entity_id: &str) -> StoreResult<Vec<WorkUnit>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM work_units WHERE entity_id = $1 ORDER BY shard_index"
                ),
                &[&entity_id],
            )
            .await?;
        rows_to_units(&rows)
    }

    async fn list(&self, filter: &UnitFilter) -> StoreResult<Vec<WorkUnit>> {
        let client = self.pool.get().await?;
        let platform = filter.platform.map(|p| p.as_str());
        let status = filter.status.map(|s| s.as_str());
        let rows = client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM work_units \
                     WHERE ($1::text IS NULL OR platform = $1) \
                       AND ($2::text IS NULL OR {EFFECTIVE_STATUS} = $2) \
                     ORDER BY platform, priority, entity_id, shard_index"
                ),
                &[&platform, &status],
            )
            .await?;
        rows_to_units(&rows)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Pool Status
// ============================================================================

/// Connection pool status
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Current pool size
    pub size: usize,

    /// Available connections
    pub available: usize,

    /// Waiting requests
    pub waiting: usize,

    /// Maximum pool size
    pub max_size: usize,
}

impl PoolStatus {
    /// Calculate utilization (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.size.saturating_sub(self.available) as f64 / self.max_size as f64
    }
}
