use super::types::{ExplanationUpdate, FlowSnapshot, StatusCounts};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable store of flow snapshots keyed by trace id.
///
/// Saves are upserts: concurrent writers for the same trace id resolve as
/// last-writer-wins without corrupting a single record.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    // Writes ----------------------------------------------------------------

    /// Insert or replace the snapshot for `snapshot.trace_id`. An existing
    /// record keeps its id, creation time and explanation.
    async fn save(&self, snapshot: FlowSnapshot) -> Result<()>;

    /// Returns false when no snapshot exists for the trace.
    async fn record_explanation(&self, trace_id: &str, update: ExplanationUpdate) -> Result<bool>;

    /// Delete snapshots created before `cutoff`, returning how many went.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn clear(&self) -> Result<()>;

    // Queries ---------------------------------------------------------------

    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Option<FlowSnapshot>>;

    /// Snapshots created at or after `since`, newest first.
    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<FlowSnapshot>>;

    /// Snapshots rooted at `service` created at or after `since`, newest first.
    async fn find_by_service_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowSnapshot>>;

    /// Snapshots flagged with a bottleneck, newest first.
    async fn find_with_bottlenecks(&self, limit: usize) -> Result<Vec<FlowSnapshot>>;

    async fn status_counts(&self, since: DateTime<Utc>) -> Result<StatusCounts>;
}
