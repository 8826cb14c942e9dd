//! Store capability interface.
//!
//! The pipeline only talks to these traits. Each backing engine implements
//! them once: `postgres` for production, `memory` for the test suite.
//!
//! Write methods take a single batch; sizing batches against the engine's
//! parameter bound is the caller's job (see [`batch_rows`]).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::models::{
    Cell, CellAssignment, CellFeatureRow, CellLabel, ExecutionLogEntry, FeatureStats, Holiday,
    HourlyCount, Incident, IncidentLocation, IncidentStats, Neighborhood, NeighborhoodCell,
    QualityReport, SourceRecord, WeatherObservation,
};

mod entities;
#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use entities::Entity;

// ---

/// Outcome of an idempotent schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied,
    AlreadyApplied,
}

/// Read-only access to the legacy report database.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Every report joined with neighborhood and crime attributes, ordered
    /// by report id. The free-form date text is not filtered here; the
    /// normalizer parses it and applies the processing window.
    async fn fetch_reports(&self) -> Result<Vec<SourceRecord>, StoreError>;

    async fn neighborhoods(&self) -> Result<Vec<Neighborhood>, StoreError>;
}

/// Read/write access to the knowledge base.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of knowledge base schemas present (4 when fully migrated).
    async fn schema_health(&self) -> Result<i64, StoreError>;

    /// Apply the schema unless its marker is already recorded. All or nothing.
    async fn migrate(&self) -> Result<MigrationOutcome, StoreError>;

    /// Upsert the status projection of one execution.
    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    /// Upsert on `id`. Never touches `cell_id` of existing rows.
    async fn upsert_incidents(&self, batch: &[Incident]) -> Result<u64, StoreError>;

    /// Insert cells; existing ids are left untouched. Returns rows inserted.
    async fn insert_cells(&self, batch: &[Cell]) -> Result<u64, StoreError>;

    /// All cells at a resolution, in sequence order.
    async fn cells(&self, resolution: i32) -> Result<Vec<Cell>, StoreError>;

    /// Keyset page of incidents without a cell, ordered by id.
    async fn unassigned_incidents(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IncidentLocation>, StoreError>;

    /// Set the cell of incidents that still have none. Returns rows updated.
    async fn assign_cells(
        &self,
        resolution: i32,
        batch: &[CellAssignment],
    ) -> Result<u64, StoreError>;

    async fn upsert_cell_labels(&self, batch: &[CellLabel]) -> Result<u64, StoreError>;

    async fn upsert_neighborhood_cells(
        &self,
        batch: &[NeighborhoodCell],
    ) -> Result<u64, StoreError>;

    /// Incident counts grouped by `(cell, hour bucket)` for incidents
    /// assigned at `resolution` with `from <= occurred_at < to`.
    async fn hourly_counts(
        &self,
        resolution: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyCount>, StoreError>;

    /// Holidays with `from <= date <= to`.
    async fn holidays(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Holiday>, StoreError>;

    /// Weather observations with `from <= ts < to`.
    async fn weather(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError>;

    /// Upsert on `(cell_id, time_bucket)`, replacing every value.
    async fn upsert_features(&self, batch: &[CellFeatureRow]) -> Result<u64, StoreError>;

    async fn incident_stats(&self) -> Result<IncidentStats, StoreError>;

    async fn cell_count(&self, resolution: i32) -> Result<i64, StoreError>;

    /// Distinct cells at `resolution` holding at least one incident.
    async fn cells_with_incidents(&self, resolution: i32) -> Result<i64, StoreError>;

    async fn feature_stats(&self) -> Result<FeatureStats, StoreError>;

    /// Upsert on `report_date`.
    async fn upsert_quality_report(&self, report: &QualityReport) -> Result<(), StoreError>;

    /// Row counts keyed by `schema.table`.
    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StoreError>;

    async fn latest_execution(&self) -> Result<Option<ExecutionLogEntry>, StoreError>;

    async fn latest_quality_report(&self) -> Result<Option<QualityReport>, StoreError>;

    /// Maximum bind parameters per statement, if the engine has one.
    fn max_bind_params(&self) -> Option<usize> {
        None
    }
}

/// A typed record with a batch write on the target store.
#[async_trait]
pub trait BatchWrite: Entity + Sync + Sized {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError>;
}

#[async_trait]
impl BatchWrite for Incident {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError> {
        store.upsert_incidents(batch).await
    }
}

#[async_trait]
impl BatchWrite for Cell {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError> {
        store.insert_cells(batch).await
    }
}

#[async_trait]
impl BatchWrite for CellLabel {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError> {
        store.upsert_cell_labels(batch).await
    }
}

#[async_trait]
impl BatchWrite for NeighborhoodCell {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError> {
        store.upsert_neighborhood_cells(batch).await
    }
}

#[async_trait]
impl BatchWrite for CellFeatureRow {
    async fn write(store: &dyn TargetStore, batch: &[Self]) -> Result<u64, StoreError> {
        store.upsert_features(batch).await
    }
}

/// Rows per write batch for entity `E`: the requested size, shrunk so that
/// `rows * columns` stays within the store's parameter bound.
pub fn batch_rows<E: Entity>(store: &dyn TargetStore, requested: usize) -> usize {
    // ---
    let requested = requested.max(1);
    match store.max_bind_params() {
        Some(limit) => requested.min((limit / E::COLUMNS.len()).max(1)),
        None => requested,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::memory::MemoryStore;
    use super::*;

    #[test]
    fn test_batch_rows_respects_parameter_bound() {
        // ---
        let store = MemoryStore::default().with_max_bind_params(100);
        // 9 incident columns -> at most 11 rows
        assert_eq!(batch_rows::<Incident>(&store, 500), 11);
        assert_eq!(batch_rows::<Incident>(&store, 5), 5);
        assert_eq!(batch_rows::<Incident>(&store, 0), 1);

        let unbounded = MemoryStore::default();
        assert_eq!(batch_rows::<CellFeatureRow>(&unbounded, 500), 500);
    }
}
