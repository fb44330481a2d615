use super::storage_trait::SnapshotStore;
use super::types::{ExplanationUpdate, FlowSnapshot, StatusCounts};
use crate::config::StorageConfig;
use crate::flow::FlowStatus;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const SNAPSHOT_COLUMNS: &str = "id, trace_id, root_service, root_endpoint, graph_json, \
    total_duration_ms, status, node_count, edge_count, has_bottleneck, bottleneck_service, \
    explanation, created_at";

/// PostgreSQL snapshot store
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let pg_config = &config.postgres;

        let connection_string = pg_config
            .connection_string
            .as_ref()
            .ok_or_else(|| anyhow!("PostgreSQL connection string is required"))?;

        let pool = PgPoolOptions::new()
            .max_connections(pg_config.max_connections)
            .min_connections(pg_config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                pg_config.connection_timeout_seconds as u64,
            ))
            .connect(connection_string)
            .await?;

        if pg_config.auto_migrate {
            tracing::info!("Running PostgreSQL migrations...");

            let migration_001 = include_str!("../../../migrations/postgres/001_flow_snapshots.sql");
            sqlx::raw_sql(migration_001).execute(&pool).await?;
            tracing::info!("Migration 001 (flow snapshots) completed");
        }

        Ok(Self { pool })
    }

    fn snapshot_from_row(row: &PgRow) -> Result<FlowSnapshot> {
        let status: String = row.try_get("status")?;
        let total_duration_ms: i64 = row.try_get("total_duration_ms")?;
        let node_count: i32 = row.try_get("node_count")?;
        let edge_count: i32 = row.try_get("edge_count")?;

        Ok(FlowSnapshot {
            id: row.try_get("id")?,
            trace_id: row.try_get("trace_id")?,
            root_service: row.try_get("root_service")?,
            root_endpoint: row.try_get("root_endpoint")?,
            graph_json: row.try_get("graph_json")?,
            total_duration_ms: total_duration_ms.max(0) as u64,
            status: FlowStatus::parse(&status)
                .ok_or_else(|| anyhow!("Unknown flow status in snapshot: {}", status))?,
            node_count: node_count.max(0) as usize,
            edge_count: edge_count.max(0) as usize,
            has_bottleneck: row.try_get("has_bottleneck")?,
            bottleneck_service: row.try_get("bottleneck_service")?,
            explanation: row.try_get("explanation")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn snapshots_from_rows(rows: Vec<PgRow>) -> Result<Vec<FlowSnapshot>> {
        rows.iter().map(Self::snapshot_from_row).collect()
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn save(&self, snapshot: FlowSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flow_snapshots
                (id, trace_id, root_service, root_endpoint, graph_json, total_duration_ms,
                 status, node_count, edge_count, has_bottleneck, bottleneck_service,
                 explanation, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (trace_id) DO UPDATE SET
                root_service = EXCLUDED.root_service,
                root_endpoint = EXCLUDED.root_endpoint,
                graph_json = EXCLUDED.graph_json,
                total_duration_ms = EXCLUDED.total_duration_ms,
                status = EXCLUDED.status,
                node_count = EXCLUDED.node_count,
                edge_count = EXCLUDED.edge_count,
                has_bottleneck = EXCLUDED.has_bottleneck,
                bottleneck_service = EXCLUDED.bottleneck_service,
                explanation = COALESCE(EXCLUDED.explanation, flow_snapshots.explanation)
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.trace_id)
        .bind(&snapshot.root_service)
        .bind(&snapshot.root_endpoint)
        .bind(&snapshot.graph_json)
        .bind(snapshot.total_duration_ms as i64)
        .bind(snapshot.status.as_str())
        .bind(snapshot.node_count as i32)
        .bind(snapshot.edge_count as i32)
        .bind(snapshot.has_bottleneck)
        .bind(&snapshot.bottleneck_service)
        .bind(&snapshot.explanation)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_explanation(&self, trace_id: &str, update: ExplanationUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE flow_snapshots
            SET explanation = $2, bottleneck_service = $3, has_bottleneck = $4
            WHERE trace_id = $1
            "#,
        )
        .bind(trace_id)
        .bind(&update.explanation)
        .bind(&update.bottleneck_service)
        .bind(update.has_bottleneck)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM flow_snapshots WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE TABLE flow_snapshots")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Option<FlowSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM flow_snapshots WHERE trace_id = $1",
            SNAPSHOT_COLUMNS
        ))
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::snapshot_from_row).transpose()
    }

    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<FlowSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM flow_snapshots WHERE created_at >= $1 \
             ORDER BY created_at DESC, trace_id ASC",
            SNAPSHOT_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Self::snapshots_from_rows(rows)
    }

    async fn find_by_service_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM flow_snapshots WHERE root_service = $1 AND created_at >= $2 \
             ORDER BY created_at DESC, trace_id ASC",
            SNAPSHOT_COLUMNS
        ))
        .bind(service)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Self::snapshots_from_rows(rows)
    }

    async fn find_with_bottlenecks(&self, limit: usize) -> Result<Vec<FlowSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM flow_snapshots WHERE has_bottleneck \
             ORDER BY created_at DESC, trace_id ASC LIMIT $1",
            SNAPSHOT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Self::snapshots_from_rows(rows)
    }

    async fn status_counts(&self, since: DateTime<Utc>) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM flow_snapshots
            WHERE created_at >= $1
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match FlowStatus::parse(&status) {
                Some(status) => counts.add(status, count.max(0) as u64),
                None => tracing::warn!("Ignoring unknown flow status in snapshots: {}", status),
            }
        }
        Ok(counts)
    }
}
