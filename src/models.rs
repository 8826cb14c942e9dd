//! Typed records for the knowledge base pipeline.
//!
//! Source-side records (`RawReport`, `Neighborhood`, `CrimeType`) mirror the
//! legacy schema and are never written by the pipeline. Everything else is
//! pipeline-owned and persisted in the target store.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Source tag stamped on every curated incident.
pub const INCIDENT_SOURCE: &str = "legacy_reports";

/// A report row exactly as the legacy system stores it.
#[derive(Debug, Clone)]
pub struct RawReport {
    // ---
    pub report_id: i64,
    pub neighborhood_id: i64,
    pub crime_id: i64,
    /// Free-form date text; see `normalize::parse_report_date`.
    pub report_date: String,
    pub created_at: DateTime<Utc>,
}

/// Legacy neighborhood. Coordinates are stored as decimal strings.
#[derive(Debug, Clone)]
pub struct Neighborhood {
    // ---
    pub id: i64,
    pub name: String,
    pub latitude: String,
    pub longitude: String,
    pub weight: i32,
}

/// Legacy crime type with its severity weight.
#[derive(Debug, Clone)]
pub struct CrimeType {
    // ---
    pub id: i64,
    pub name: String,
    pub weight: i32,
}

/// A report joined with its neighborhood and crime attributes.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    // ---
    pub report: RawReport,
    pub neighborhood: Neighborhood,
    pub crime: CrimeType,
}

/// Incident category used by the downstream models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Hediondo,
    Comum,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Hediondo => "Hediondo",
            Category::Comum => "Comum",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, classified and geocoded crime event.
///
/// `cell_id` and `cell_resolution` stay `None` until the assignment phase
/// finds the containing cell; no other phase touches them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    // ---
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub category: Category,
    pub severity: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub neighborhood: String,
    pub confidence: f64,
    pub source: String,
    pub cell_id: Option<String>,
    pub cell_resolution: Option<i32>,
}

impl Incident {
    /// Curated incident id for a legacy report.
    pub fn id_for_report(report_id: i64) -> String {
        format!("rpt_{report_id}")
    }
}

/// Coordinates of an incident still waiting for a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentLocation {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellAssignment {
    pub incident_id: String,
    pub cell_id: String,
}

/// One square cell of the analysis grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    // ---
    pub cell_id: String,
    /// Edge length in meters.
    pub resolution: i32,
    pub city: String,
    /// Position in the generation order, starting at 1.
    pub sequence: i32,
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub center_lat: f64,
    pub center_lon: f64,
}

impl Cell {
    /// Half-open containment: `min <= x < max` on both axes, so a point on a
    /// shared edge belongs to exactly one cell.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.min_lat <= lat && lat < self.max_lat && self.min_lon <= lon && lon < self.max_lon
    }
}

/// Human-readable label: the neighborhood closest to a cell's center.
#[derive(Debug, Clone, PartialEq)]
pub struct CellLabel {
    pub cell_id: String,
    pub neighborhood_id: i64,
    pub neighborhood_name: String,
    pub distance_deg: f64,
}

/// The cell containing a neighborhood's reference coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodCell {
    pub neighborhood_id: i64,
    pub resolution: i32,
    pub cell_id: String,
}

/// Grouped aggregate row: incidents of one cell inside one hour bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyCount {
    pub cell_id: String,
    pub bucket: DateTime<Utc>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Holiday {
    pub date: NaiveDate,
    pub name: String,
    pub kind: String,
}

/// Hourly weather observation. Either reading may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherObservation {
    pub ts: DateTime<Utc>,
    pub rain_mm: Option<f64>,
    pub temp_c: Option<f64>,
}

/// Features of one cell for one hour bucket. Keyed by `(cell_id, time_bucket)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellFeatureRow {
    // ---
    pub cell_id: String,
    pub time_bucket: DateTime<Utc>,

    // Target
    pub y_count: i32,

    // Strictly preceding windows
    pub lag_1h: i32,
    pub lag_24h: i32,
    pub lag_7d: i32,

    // Trailing windows including the bucket itself
    pub roll_3h_sum: i32,
    pub roll_24h_sum: i32,
    pub roll_7d_sum: i32,

    // Calendar
    /// 0 = Sunday.
    pub day_of_week: i16,
    pub hour_of_day: i16,
    pub is_weekend: bool,
    pub is_business_hours: bool,
    pub is_holiday: bool,
    pub day_before_holiday: bool,
    pub day_after_holiday: bool,

    // Exogenous, null when no observation exists
    pub weather_rain_mm: Option<f64>,
    pub weather_temp_c: Option<f64>,
}

impl CellFeatureRow {
    pub fn has_missing_optional(&self) -> bool {
        self.weather_rain_mm.is_none() || self.weather_temp_c.is_none()
    }
}

/// Data quality metrics. Ratios are always within `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub spatial_coverage: f64,
    pub temporal_coverage: f64,
    pub duplication_rate: f64,
    pub feature_completeness: f64,
    pub total_incidents: i64,
}

/// One quality report per calendar day; later runs on the same day overwrite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub report_date: NaiveDate,
    pub metrics: QualityMetrics,
}

/// Aggregates over the curated incident table used by the quality validator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentStats {
    pub total: i64,
    pub first_occurred_at: Option<DateTime<Utc>>,
    pub last_occurred_at: Option<DateTime<Utc>>,
    pub distinct_hours: i64,
    /// Distinct `(cell_id, hour bucket, category)` keys.
    pub distinct_keys: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureStats {
    pub total_rows: i64,
    pub incomplete_rows: i64,
}

/// Pipeline phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Migrate,
    Normalize,
    Grid,
    AssignCells,
    Features,
    Validate,
    Complete,
}

impl Phase {
    pub const SEQUENCE: [Phase; 7] = [
        Phase::Migrate,
        Phase::Normalize,
        Phase::Grid,
        Phase::AssignCells,
        Phase::Features,
        Phase::Validate,
        Phase::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Migrate => "migrate",
            Phase::Normalize => "normalize",
            Phase::Grid => "grid",
            Phase::AssignCells => "assign_cells",
            Phase::Features => "features",
            Phase::Validate => "validate",
            Phase::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Phase::SEQUENCE.into_iter().find(|p| p.as_str() == value)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Success,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Running => "running",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(PhaseStatus::Running),
            "success" => Some(PhaseStatus::Success),
            "failed" => Some(PhaseStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Success | PhaseStatus::Failed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status projection of one execution, upserted on every phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLogEntry {
    // ---
    pub execution_id: Uuid,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub error_message: Option<String>,
}
