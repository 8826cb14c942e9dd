//! In-memory store used by the test suite.
//!
//! Implements both store traits over plain collections with the same
//! observable semantics as the PostgreSQL backend: upsert keys, the
//! `cell_id IS NULL` assignment guard, text range filtering on report
//! dates and hour truncation in UTC. Failure injection hooks let tests
//! exercise batch, migration and connectivity failures.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{MigrationOutcome, SourceStore, TargetStore};
use crate::error::StoreError;
use crate::features::hour_bucket;
use crate::models::{
    Cell, CellAssignment, CellFeatureRow, CellLabel, ExecutionLogEntry, FeatureStats, Holiday,
    HourlyCount, Incident, IncidentLocation, IncidentStats, Neighborhood, NeighborhoodCell,
    QualityReport, SourceRecord, WeatherObservation,
};
use crate::schema::{KB_SCHEMAS, KB_TABLES};

// ---

#[derive(Default)]
struct State {
    // source side
    records: Vec<SourceRecord>,
    neighborhoods: Vec<Neighborhood>,

    // target side
    migrated: bool,
    incidents: BTreeMap<String, Incident>,
    cells: BTreeMap<String, Cell>,
    labels: BTreeMap<String, CellLabel>,
    neighborhood_cells: BTreeMap<(i64, i32), NeighborhoodCell>,
    holidays: Vec<Holiday>,
    weather: Vec<WeatherObservation>,
    features: BTreeMap<(String, DateTime<Utc>), CellFeatureRow>,
    quality: BTreeMap<NaiveDate, QualityReport>,
    executions: Vec<ExecutionLogEntry>,
    execution_writes: usize,

    // failure injection
    rejected_incidents: HashSet<String>,
    rejected_feature_buckets: HashSet<DateTime<Utc>>,
    failing_migration: bool,
    unreachable: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    max_bind_params: Option<usize>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock poisoned")
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.state().unreachable {
            return Err(StoreError::Connectivity(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub fn with_max_bind_params(mut self, limit: usize) -> Self {
        self.max_bind_params = Some(limit);
        self
    }

    pub fn with_record(self, record: SourceRecord) -> Self {
        // ---
        {
            let mut state = self.state();
            if !state.neighborhoods.iter().any(|n| n.id == record.neighborhood.id) {
                state.neighborhoods.push(record.neighborhood.clone());
            }
            state.records.push(record);
        }
        self
    }

    pub fn with_neighborhood(self, neighborhood: Neighborhood) -> Self {
        self.state().neighborhoods.push(neighborhood);
        self
    }

    pub fn with_holiday(self, date: NaiveDate, name: &str) -> Self {
        self.state().holidays.push(Holiday {
            date,
            name: name.to_string(),
            kind: "nacional".to_string(),
        });
        self
    }

    pub fn with_weather(self, observation: WeatherObservation) -> Self {
        self.state().weather.push(observation);
        self
    }

    /// Curated incident placed directly in the target, bypassing the normalizer.
    pub fn with_incident(self, incident: Incident) -> Self {
        self.state()
            .incidents
            .insert(incident.id.clone(), incident);
        self
    }

    pub fn reject_incident_batches_with(self, incident_id: &str) -> Self {
        self.state()
            .rejected_incidents
            .insert(incident_id.to_string());
        self
    }

    pub fn reject_feature_batches_with(self, bucket: DateTime<Utc>) -> Self {
        self.state().rejected_feature_buckets.insert(bucket);
        self
    }

    pub fn with_failing_migration(self) -> Self {
        self.state().failing_migration = true;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    // --- inspection

    pub fn incidents(&self) -> Vec<Incident> {
        self.state().incidents.values().cloned().collect()
    }

    pub fn stored_cells(&self) -> Vec<Cell> {
        self.state().cells.values().cloned().collect()
    }

    pub fn feature_rows(&self) -> Vec<CellFeatureRow> {
        self.state().features.values().cloned().collect()
    }

    pub fn feature_row(&self, cell_id: &str, bucket: DateTime<Utc>) -> Option<CellFeatureRow> {
        self.state()
            .features
            .get(&(cell_id.to_string(), bucket))
            .cloned()
    }

    pub fn cell_labels(&self) -> Vec<CellLabel> {
        self.state().labels.values().cloned().collect()
    }

    pub fn neighborhood_cells(&self) -> Vec<NeighborhoodCell> {
        self.state().neighborhood_cells.values().cloned().collect()
    }

    pub fn quality_reports(&self) -> Vec<QualityReport> {
        self.state().quality.values().cloned().collect()
    }

    pub fn executions(&self) -> Vec<ExecutionLogEntry> {
        self.state().executions.clone()
    }

    /// Number of execution log upserts received.
    pub fn execution_writes(&self) -> usize {
        self.state().execution_writes
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn fetch_reports(&self) -> Result<Vec<SourceRecord>, StoreError> {
        // ---
        self.check_reachable()?;
        let mut records = self.state().records.clone();
        records.sort_by_key(|r| r.report.report_id);
        Ok(records)
    }

    async fn neighborhoods(&self) -> Result<Vec<Neighborhood>, StoreError> {
        self.check_reachable()?;
        Ok(self.state().neighborhoods.clone())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn schema_health(&self) -> Result<i64, StoreError> {
        self.check_reachable()?;
        Ok(if self.state().migrated {
            KB_SCHEMAS.len() as i64
        } else {
            0
        })
    }

    async fn migrate(&self) -> Result<MigrationOutcome, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        if state.failing_migration {
            return Err(StoreError::Rejected("migration statement failed".into()));
        }
        if state.migrated {
            return Ok(MigrationOutcome::AlreadyApplied);
        }
        state.migrated = true;
        Ok(MigrationOutcome::Applied)
    }

    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        state.execution_writes += 1;
        match state
            .executions
            .iter_mut()
            .find(|e| e.execution_id == entry.execution_id)
        {
            Some(existing) => {
                let started_at = existing.started_at;
                *existing = entry.clone();
                existing.started_at = started_at;
            }
            None => state.executions.push(entry.clone()),
        }
        Ok(())
    }

    async fn upsert_incidents(&self, batch: &[Incident]) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        if let Some(bad) = batch
            .iter()
            .find(|i| state.rejected_incidents.contains(&i.id))
        {
            return Err(StoreError::Rejected(format!("incident {} rejected", bad.id)));
        }

        for incident in batch {
            match state.incidents.get_mut(&incident.id) {
                Some(existing) => {
                    existing.occurred_at = incident.occurred_at;
                    existing.category = incident.category;
                    existing.severity = incident.severity;
                    existing.neighborhood = incident.neighborhood.clone();
                    existing.confidence = incident.confidence;
                    existing.source = incident.source.clone();
                }
                None => {
                    state.incidents.insert(incident.id.clone(), incident.clone());
                }
            }
        }
        Ok(batch.len() as u64)
    }

    async fn insert_cells(&self, batch: &[Cell]) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        let mut inserted = 0;
        for cell in batch {
            if !state.cells.contains_key(&cell.cell_id) {
                state.cells.insert(cell.cell_id.clone(), cell.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn cells(&self, resolution: i32) -> Result<Vec<Cell>, StoreError> {
        // ---
        self.check_reachable()?;
        let mut cells: Vec<Cell> = self
            .state()
            .cells
            .values()
            .filter(|c| c.resolution == resolution)
            .cloned()
            .collect();
        cells.sort_by_key(|c| c.sequence);
        Ok(cells)
    }

    async fn unassigned_incidents(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IncidentLocation>, StoreError> {
        // ---
        self.check_reachable()?;
        Ok(self
            .state()
            .incidents
            .values()
            .filter(|i| i.cell_id.is_none())
            .filter(|i| after_id.map_or(true, |after| i.id.as_str() > after))
            .take(limit)
            .map(|i| IncidentLocation {
                id: i.id.clone(),
                latitude: i.latitude,
                longitude: i.longitude,
            })
            .collect())
    }

    async fn assign_cells(
        &self,
        resolution: i32,
        batch: &[CellAssignment],
    ) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        let mut updated = 0;
        for assignment in batch {
            if let Some(incident) = state.incidents.get_mut(&assignment.incident_id) {
                if incident.cell_id.is_none() {
                    incident.cell_id = Some(assignment.cell_id.clone());
                    incident.cell_resolution = Some(resolution);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn upsert_cell_labels(&self, batch: &[CellLabel]) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        for label in batch {
            state.labels.insert(label.cell_id.clone(), label.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn upsert_neighborhood_cells(
        &self,
        batch: &[NeighborhoodCell],
    ) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        for row in batch {
            state
                .neighborhood_cells
                .insert((row.neighborhood_id, row.resolution), row.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn hourly_counts(
        &self,
        resolution: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyCount>, StoreError> {
        // ---
        self.check_reachable()?;
        let mut counts: BTreeMap<(String, DateTime<Utc>), i64> = BTreeMap::new();
        for incident in self.state().incidents.values() {
            if incident.cell_resolution != Some(resolution) {
                continue;
            }
            let Some(cell_id) = &incident.cell_id else {
                continue;
            };
            if incident.occurred_at < from || incident.occurred_at >= to {
                continue;
            }
            *counts
                .entry((cell_id.clone(), hour_bucket(incident.occurred_at)))
                .or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((cell_id, bucket), count)| HourlyCount {
                cell_id,
                bucket,
                count,
            })
            .collect())
    }

    async fn holidays(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Holiday>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .state()
            .holidays
            .iter()
            .filter(|h| h.date >= from && h.date <= to)
            .cloned()
            .collect())
    }

    async fn weather(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .state()
            .weather
            .iter()
            .filter(|w| w.ts >= from && w.ts < to)
            .cloned()
            .collect())
    }

    async fn upsert_features(&self, batch: &[CellFeatureRow]) -> Result<u64, StoreError> {
        // ---
        self.check_reachable()?;
        let mut state = self.state();
        if batch
            .iter()
            .any(|r| state.rejected_feature_buckets.contains(&r.time_bucket))
        {
            return Err(StoreError::Rejected("feature batch rejected".into()));
        }
        for row in batch {
            state
                .features
                .insert((row.cell_id.clone(), row.time_bucket), row.clone());
        }
        Ok(batch.len() as u64)
    }

    async fn incident_stats(&self) -> Result<IncidentStats, StoreError> {
        // ---
        self.check_reachable()?;
        let state = self.state();
        let mut hours = BTreeSet::new();
        let mut keys = BTreeSet::new();
        for incident in state.incidents.values() {
            let bucket = hour_bucket(incident.occurred_at);
            hours.insert(bucket);
            keys.insert((incident.cell_id.clone(), bucket, incident.category));
        }

        Ok(IncidentStats {
            total: state.incidents.len() as i64,
            first_occurred_at: state.incidents.values().map(|i| i.occurred_at).min(),
            last_occurred_at: state.incidents.values().map(|i| i.occurred_at).max(),
            distinct_hours: hours.len() as i64,
            distinct_keys: keys.len() as i64,
        })
    }

    async fn cell_count(&self, resolution: i32) -> Result<i64, StoreError> {
        self.check_reachable()?;
        Ok(self
            .state()
            .cells
            .values()
            .filter(|c| c.resolution == resolution)
            .count() as i64)
    }

    async fn cells_with_incidents(&self, resolution: i32) -> Result<i64, StoreError> {
        // ---
        self.check_reachable()?;
        let state = self.state();
        let occupied: BTreeSet<&String> = state
            .incidents
            .values()
            .filter_map(|i| i.cell_id.as_ref())
            .filter(|id| {
                state
                    .cells
                    .get(*id)
                    .is_some_and(|c| c.resolution == resolution)
            })
            .collect();
        Ok(occupied.len() as i64)
    }

    async fn feature_stats(&self) -> Result<FeatureStats, StoreError> {
        // ---
        self.check_reachable()?;
        let state = self.state();
        Ok(FeatureStats {
            total_rows: state.features.len() as i64,
            incomplete_rows: state
                .features
                .values()
                .filter(|r| r.has_missing_optional())
                .count() as i64,
        })
    }

    async fn upsert_quality_report(&self, report: &QualityReport) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.state()
            .quality
            .insert(report.report_date, report.clone());
        Ok(())
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        // ---
        self.check_reachable()?;
        let state = self.state();
        let sizes = [
            state.incidents.len(),
            state.cells.len(),
            state.labels.len(),
            state.neighborhood_cells.len(),
            state.holidays.len(),
            state.weather.len(),
            state.features.len(),
            state.quality.len(),
            state.executions.len(),
        ];
        Ok(KB_TABLES
            .iter()
            .zip(sizes)
            .map(|(table, n)| (table.to_string(), n as i64))
            .collect())
    }

    async fn latest_execution(&self) -> Result<Option<ExecutionLogEntry>, StoreError> {
        // ---
        self.check_reachable()?;
        let state = self.state();
        Ok(state
            .executions
            .iter()
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn latest_quality_report(&self) -> Result<Option<QualityReport>, StoreError> {
        self.check_reachable()?;
        Ok(self.state().quality.values().last().cloned())
    }

    fn max_bind_params(&self) -> Option<usize> {
        self.max_bind_params
    }
}
