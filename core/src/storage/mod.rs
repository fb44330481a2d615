mod memory;
mod postgres;
mod storage_trait;
mod types;

pub use memory::MemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;
pub use storage_trait::SnapshotStore;
pub use types::*;

use crate::config::StorageConfig;
use anyhow::Result;
use std::sync::Arc;

/// Create a snapshot store based on the configuration
pub async fn create_snapshot_store(config: &StorageConfig) -> Result<Arc<dyn SnapshotStore>> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!("Snapshot store: in-memory (snapshots will not persist across restarts)");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
        "postgres" => {
            tracing::info!("Snapshot store: PostgreSQL (persistent)");
            let store = PostgresSnapshotStore::new(config).await?;
            tracing::info!("Database connection established");
            Ok(Arc::new(store))
        }
        other => {
            anyhow::bail!("Unknown storage backend: {}", other)
        }
    }
}
