use super::storage_trait::SnapshotStore;
use super::types::{ExplanationUpdate, FlowSnapshot, StatusCounts};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// In-memory snapshot store. Data does not survive a restart.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<String, FlowSnapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn newest_first(&self, predicate: impl Fn(&FlowSnapshot) -> bool) -> Vec<FlowSnapshot> {
        let mut matching: Vec<FlowSnapshot> = self
            .snapshots
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });
        matching
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, mut snapshot: FlowSnapshot) -> Result<()> {
        if let Some(existing) = self.snapshots.get(&snapshot.trace_id) {
            snapshot.id = existing.id;
            snapshot.created_at = existing.created_at;
            if snapshot.explanation.is_none() {
                snapshot.explanation = existing.explanation.clone();
            }
        }
        self.snapshots.insert(snapshot.trace_id.clone(), snapshot);
        Ok(())
    }

    async fn record_explanation(&self, trace_id: &str, update: ExplanationUpdate) -> Result<bool> {
        match self.snapshots.get_mut(trace_id) {
            Some(mut snapshot) => {
                snapshot.explanation = Some(update.explanation);
                snapshot.bottleneck_service = update.bottleneck_service;
                snapshot.has_bottleneck = update.has_bottleneck;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0u64;
        self.snapshots.retain(|_, snapshot| {
            let keep = snapshot.created_at >= cutoff;
            if !keep {
                deleted += 1;
            }
            keep
        });
        Ok(deleted)
    }

    async fn clear(&self) -> Result<()> {
        self.snapshots.clear();
        Ok(())
    }

    async fn find_by_trace_id(&self, trace_id: &str) -> Result<Option<FlowSnapshot>> {
        Ok(self.snapshots.get(trace_id).map(|entry| entry.value().clone()))
    }

    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<FlowSnapshot>> {
        Ok(self.newest_first(|s| s.created_at >= since))
    }

    async fn find_by_service_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowSnapshot>> {
        Ok(self.newest_first(|s| s.root_service == service && s.created_at >= since))
    }

    async fn find_with_bottlenecks(&self, limit: usize) -> Result<Vec<FlowSnapshot>> {
        let mut flagged = self.newest_first(|s| s.has_bottleneck);
        flagged.truncate(limit);
        Ok(flagged)
    }

    async fn status_counts(&self, since: DateTime<Utc>) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.snapshots.iter() {
            if entry.created_at >= since {
                counts.add(entry.status, 1);
            }
        }
        Ok(counts)
    }
}
