//! PostgreSQL backend (sqlx).
//!
//! Cell containment is plain bounding-box arithmetic done by the assignment
//! engine, so the target database needs no PostGIS extension. Batch writes
//! go through [`upsert`], which renders one multi-row `INSERT .. ON CONFLICT`
//! per batch from the record's [`Entity`] declaration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use super::{Entity, MigrationOutcome, SourceStore, TargetStore};
use crate::error::StoreError;
use crate::models::{
    Cell, CellAssignment, CellFeatureRow, CellLabel, CrimeType, ExecutionLogEntry,
    FeatureStats, Holiday, HourlyCount, Incident, IncidentLocation, IncidentStats, Neighborhood,
    NeighborhoodCell, Phase, PhaseStatus, QualityMetrics, QualityReport, RawReport, SourceRecord,
    WeatherObservation,
};
use crate::schema;

// ---

/// PostgreSQL's limit on bind parameters per statement.
const PG_MAX_BIND_PARAMS: usize = 65_535;

/// Binds one record's values in `Entity::COLUMNS` order.
trait PgRow: Entity {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);
}

/// Only fills incidents that have no cell yet.
const ASSIGN_CELLS_SQL: &str = r#"
    UPDATE curated.incidents AS i
    SET cell_id = a.cell_id, cell_resolution = $3
    FROM UNNEST($1::TEXT[], $2::TEXT[]) AS a(id, cell_id)
    WHERE i.id = a.id AND i.cell_id IS NULL
"#;

/// Run one batch upsert for `E`. Returns rows affected.
async fn upsert<E: PgRow>(pool: &PgPool, batch: &[E]) -> Result<u64, StoreError> {
    // ---
    if batch.is_empty() {
        return Ok(0);
    }
    let mut qb = upsert_query(batch);
    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Render the multi-row `INSERT .. ON CONFLICT` for a non-empty batch.
fn upsert_query<E: PgRow>(batch: &[E]) -> QueryBuilder<'static, Postgres> {
    // ---
    let mut qb: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        E::TABLE,
        E::COLUMNS.join(", ")
    ));
    qb.push_values(batch, |mut row, record| record.bind_row(&mut row));
    qb.push(format!(" ON CONFLICT ({}) ", E::KEY.join(", ")));

    if E::UPDATE.is_empty() {
        qb.push("DO NOTHING");
    } else {
        let assignments: Vec<String> = E::UPDATE
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        qb.push("DO UPDATE SET ");
        qb.push(assignments.join(", "));
    }
    qb
}

impl PgRow for Incident {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id.clone())
            .push_bind(self.occurred_at)
            .push_bind(self.category.as_str())
            .push_bind(self.severity)
            .push_bind(self.latitude)
            .push_bind(self.longitude)
            .push_bind(self.neighborhood.clone())
            .push_bind(self.confidence)
            .push_bind(self.source.clone());
    }
}

impl PgRow for Cell {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.cell_id.clone())
            .push_bind(self.resolution)
            .push_bind(self.city.clone())
            .push_bind(self.sequence)
            .push_bind(self.min_lat)
            .push_bind(self.min_lon)
            .push_bind(self.max_lat)
            .push_bind(self.max_lon)
            .push_bind(self.center_lat)
            .push_bind(self.center_lon);
    }
}

impl PgRow for CellLabel {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.cell_id.clone())
            .push_bind(self.neighborhood_id)
            .push_bind(self.neighborhood_name.clone())
            .push_bind(self.distance_deg);
    }
}

impl PgRow for NeighborhoodCell {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.neighborhood_id)
            .push_bind(self.resolution)
            .push_bind(self.cell_id.clone());
    }
}

impl PgRow for CellFeatureRow {
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.cell_id.clone())
            .push_bind(self.time_bucket)
            .push_bind(self.y_count)
            .push_bind(self.lag_1h)
            .push_bind(self.lag_24h)
            .push_bind(self.lag_7d)
            .push_bind(self.roll_3h_sum)
            .push_bind(self.roll_24h_sum)
            .push_bind(self.roll_7d_sum)
            .push_bind(self.day_of_week)
            .push_bind(self.hour_of_day)
            .push_bind(self.is_weekend)
            .push_bind(self.is_business_hours)
            .push_bind(self.is_holiday)
            .push_bind(self.day_before_holiday)
            .push_bind(self.day_after_holiday)
            .push_bind(self.weather_rain_mm)
            .push_bind(self.weather_temp_c);
    }
}

// ---

/// Legacy report database.
#[derive(Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        PgSourceStore { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    report_id: i64,
    neighborhood_id: i64,
    crime_id: i64,
    report_date: String,
    created_at: DateTime<Utc>,
    neighborhood_name: String,
    latitude: String,
    longitude: String,
    neighborhood_weight: i32,
    crime_name: String,
    crime_weight: i32,
}

impl From<SourceRow> for SourceRecord {
    fn from(row: SourceRow) -> Self {
        // ---
        SourceRecord {
            report: RawReport {
                report_id: row.report_id,
                neighborhood_id: row.neighborhood_id,
                crime_id: row.crime_id,
                report_date: row.report_date,
                created_at: row.created_at,
            },
            neighborhood: Neighborhood {
                id: row.neighborhood_id,
                name: row.neighborhood_name,
                latitude: row.latitude,
                longitude: row.longitude,
                weight: row.neighborhood_weight,
            },
            crime: CrimeType {
                id: row.crime_id,
                name: row.crime_name,
                weight: row.crime_weight,
            },
        }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_reports(&self) -> Result<Vec<SourceRecord>, StoreError> {
        // ---
        let rows: Vec<SourceRow> = sqlx::query_as(
            r#"
            SELECT
                r.report_id::BIGINT            AS report_id,
                r.neighborhood_id::BIGINT      AS neighborhood_id,
                r.crime_id::BIGINT             AS crime_id,
                r.report_date::TEXT            AS report_date,
                r.created_at::TIMESTAMPTZ      AS created_at,
                n.name::TEXT                   AS neighborhood_name,
                n.latitude::TEXT               AS latitude,
                n.longitude::TEXT              AS longitude,
                n.neighborhood_weight::INTEGER AS neighborhood_weight,
                c.crime_name::TEXT             AS crime_name,
                c.crime_weight::INTEGER        AS crime_weight
            FROM reports r
            JOIN neighborhoods n ON r.neighborhood_id = n.neighborhood_id
            JOIN crimes c ON r.crime_id = c.crime_id
            ORDER BY r.report_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SourceRecord::from).collect())
    }

    async fn neighborhoods(&self) -> Result<Vec<Neighborhood>, StoreError> {
        // ---
        let rows: Vec<(i64, String, String, String, i32)> = sqlx::query_as(
            r#"
            SELECT neighborhood_id::BIGINT, name::TEXT, latitude::TEXT, longitude::TEXT,
                   neighborhood_weight::INTEGER
            FROM neighborhoods
            ORDER BY neighborhood_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, latitude, longitude, weight)| Neighborhood {
                id,
                name,
                latitude,
                longitude,
                weight,
            })
            .collect())
    }
}

// ---

/// Knowledge base database.
#[derive(Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        PgTargetStore { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CellRow {
    cell_id: String,
    cell_resolution: i32,
    city: String,
    sequence: i32,
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    center_lat: f64,
    center_lon: f64,
}

impl From<CellRow> for Cell {
    fn from(row: CellRow) -> Self {
        Cell {
            cell_id: row.cell_id,
            resolution: row.cell_resolution,
            city: row.city,
            sequence: row.sequence,
            min_lat: row.min_lat,
            min_lon: row.min_lon,
            max_lat: row.max_lat,
            max_lon: row.max_lon,
            center_lat: row.center_lat,
            center_lon: row.center_lon,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    execution_id: Uuid,
    phase: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    records_processed: i64,
    error_message: Option<String>,
}

impl TryFrom<ExecutionRow> for ExecutionLogEntry {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        // ---
        let phase = Phase::parse(&row.phase)
            .ok_or_else(|| StoreError::Rejected(format!("unknown phase {:?}", row.phase)))?;
        let status = PhaseStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Rejected(format!("unknown status {:?}", row.status)))?;

        Ok(ExecutionLogEntry {
            execution_id: row.execution_id,
            phase,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            records_processed: row.records_processed,
            error_message: row.error_message,
        })
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn schema_health(&self) -> Result<i64, StoreError> {
        Ok(schema::count_schemas(&self.pool).await?)
    }

    async fn migrate(&self) -> Result<MigrationOutcome, StoreError> {
        Ok(schema::migrate(&self.pool).await?)
    }

    async fn record_execution(&self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO analytics.pipeline_logs (
                execution_id, phase, status, started_at, finished_at,
                records_processed, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (execution_id) DO UPDATE SET
                phase = EXCLUDED.phase,
                status = EXCLUDED.status,
                finished_at = EXCLUDED.finished_at,
                records_processed = EXCLUDED.records_processed,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(entry.execution_id)
        .bind(entry.phase.as_str())
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .bind(entry.records_processed)
        .bind(entry.error_message.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_incidents(&self, batch: &[Incident]) -> Result<u64, StoreError> {
        upsert(&self.pool, batch).await
    }

    async fn insert_cells(&self, batch: &[Cell]) -> Result<u64, StoreError> {
        upsert(&self.pool, batch).await
    }

    async fn cells(&self, resolution: i32) -> Result<Vec<Cell>, StoreError> {
        // ---
        let rows: Vec<CellRow> = sqlx::query_as(
            r#"
            SELECT cell_id, cell_resolution, city, sequence,
                   min_lat, min_lon, max_lat, max_lon, center_lat, center_lon
            FROM curated.cells
            WHERE cell_resolution = $1
            ORDER BY sequence
            "#,
        )
        .bind(resolution)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Cell::from).collect())
    }

    async fn unassigned_incidents(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IncidentLocation>, StoreError> {
        // ---
        let rows: Vec<(String, f64, f64)> = sqlx::query_as(
            r#"
            SELECT id, latitude, longitude
            FROM curated.incidents
            WHERE cell_id IS NULL AND ($1::TEXT IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, latitude, longitude)| IncidentLocation {
                id,
                latitude,
                longitude,
            })
            .collect())
    }

    async fn assign_cells(
        &self,
        resolution: i32,
        batch: &[CellAssignment],
    ) -> Result<u64, StoreError> {
        // ---
        if batch.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = batch.iter().map(|a| a.incident_id.clone()).collect();
        let cells: Vec<String> = batch.iter().map(|a| a.cell_id.clone()).collect();

        let result = sqlx::query(ASSIGN_CELLS_SQL)
            .bind(ids)
            .bind(cells)
            .bind(resolution)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn upsert_cell_labels(&self, batch: &[CellLabel]) -> Result<u64, StoreError> {
        upsert(&self.pool, batch).await
    }

    async fn upsert_neighborhood_cells(
        &self,
        batch: &[NeighborhoodCell],
    ) -> Result<u64, StoreError> {
        upsert(&self.pool, batch).await
    }

    async fn hourly_counts(
        &self,
        resolution: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyCount>, StoreError> {
        // ---
        let rows: Vec<(String, NaiveDateTime, i64)> = sqlx::query_as(
            r#"
            SELECT cell_id,
                   date_trunc('hour', occurred_at AT TIME ZONE 'UTC') AS bucket,
                   COUNT(*)::BIGINT AS n
            FROM curated.incidents
            WHERE cell_resolution = $1
              AND cell_id IS NOT NULL
              AND occurred_at >= $2 AND occurred_at < $3
            GROUP BY cell_id, bucket
            "#,
        )
        .bind(resolution)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(cell_id, bucket, count)| HourlyCount {
                cell_id,
                bucket: bucket.and_utc(),
                count,
            })
            .collect())
    }

    async fn holidays(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Holiday>, StoreError> {
        // ---
        let rows: Vec<(NaiveDate, String, String)> = sqlx::query_as(
            "SELECT date, name, kind FROM external.holidays WHERE date BETWEEN $1 AND $2 ORDER BY date",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(date, name, kind)| Holiday { date, name, kind })
            .collect())
    }

    async fn weather(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WeatherObservation>, StoreError> {
        // ---
        let rows: Vec<(DateTime<Utc>, Option<f64>, Option<f64>)> = sqlx::query_as(
            "SELECT ts, rain_mm, temp_c FROM external.weather WHERE ts >= $1 AND ts < $2 ORDER BY ts",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ts, rain_mm, temp_c)| WeatherObservation {
                ts,
                rain_mm,
                temp_c,
            })
            .collect())
    }

    async fn upsert_features(&self, batch: &[CellFeatureRow]) -> Result<u64, StoreError> {
        upsert(&self.pool, batch).await
    }

    async fn incident_stats(&self) -> Result<IncidentStats, StoreError> {
        // ---
        let row: (i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT,
                MIN(occurred_at),
                MAX(occurred_at),
                COUNT(DISTINCT date_trunc('hour', occurred_at AT TIME ZONE 'UTC'))::BIGINT,
                COUNT(DISTINCT (cell_id, date_trunc('hour', occurred_at AT TIME ZONE 'UTC'), category))::BIGINT
            FROM curated.incidents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(IncidentStats {
            total: row.0,
            first_occurred_at: row.1,
            last_occurred_at: row.2,
            distinct_hours: row.3,
            distinct_keys: row.4,
        })
    }

    async fn cell_count(&self, resolution: i32) -> Result<i64, StoreError> {
        // ---
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM curated.cells WHERE cell_resolution = $1")
                .bind(resolution)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn cells_with_incidents(&self, resolution: i32) -> Result<i64, StoreError> {
        // ---
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT i.cell_id)
            FROM curated.incidents i
            JOIN curated.cells c ON c.cell_id = i.cell_id
            WHERE c.cell_resolution = $1
            "#,
        )
        .bind(resolution)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn feature_stats(&self) -> Result<FeatureStats, StoreError> {
        // ---
        let (total_rows, incomplete_rows): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::BIGINT,
                COUNT(*) FILTER (WHERE weather_rain_mm IS NULL OR weather_temp_c IS NULL)::BIGINT
            FROM features.cell_hourly
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(FeatureStats {
            total_rows,
            incomplete_rows,
        })
    }

    async fn upsert_quality_report(&self, report: &QualityReport) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO analytics.quality_reports (report_date, metrics)
            VALUES ($1, $2)
            ON CONFLICT (report_date) DO UPDATE SET
                metrics = EXCLUDED.metrics,
                updated_at = NOW()
            "#,
        )
        .bind(report.report_date)
        .bind(Json(&report.metrics))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn table_counts(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        // ---
        let mut counts = BTreeMap::new();
        for table in schema::KB_TABLES {
            // Table names come from a fixed list, never from input.
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts.insert(table.to_string(), count);
        }
        Ok(counts)
    }

    async fn latest_execution(&self) -> Result<Option<ExecutionLogEntry>, StoreError> {
        // ---
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT execution_id, phase, status, started_at, finished_at,
                   records_processed, error_message
            FROM analytics.pipeline_logs
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionLogEntry::try_from).transpose()
    }

    async fn latest_quality_report(&self) -> Result<Option<QualityReport>, StoreError> {
        // ---
        let row: Option<(NaiveDate, Json<QualityMetrics>)> = sqlx::query_as(
            "SELECT report_date, metrics FROM analytics.quality_reports ORDER BY report_date DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(report_date, Json(metrics))| QualityReport {
            report_date,
            metrics,
        }))
    }

    fn max_bind_params(&self) -> Option<usize> {
        Some(PG_MAX_BIND_PARAMS)
    }
}
