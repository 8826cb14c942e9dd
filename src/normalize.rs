//! Incident normalizer: legacy report rows to curated incidents.
//!
//! Every rejection is a [`ValidationError`]; callers skip the record, count
//! the reason and keep going. Nothing here touches a store.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::PipelineError;
use crate::grid::BoundingBox;
use crate::models::{Category, Incident, Phase, SourceRecord, INCIDENT_SOURCE};
use crate::pipeline::{PipelineContext, PipelineEvent};
use crate::store::{SourceStore, TargetStore};

// ---

/// Crime name fragments that classify an incident as `Hediondo`.
/// Matched against the lower-cased, accent-folded crime name.
const SEVERE_KEYWORDS: [&str; 5] = ["homicidio", "latrocinio", "estupro", "sequestro", "trafico"];

/// Date-time layouts tried in order after the date-only layout.
const DATE_TIME_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Why a source record was not curated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid latitude {value:?}")]
    InvalidLatitude { value: String },

    #[error("invalid longitude {value:?}")]
    InvalidLongitude { value: String },

    #[error("coordinates ({lat}, {lon}) outside the study area")]
    OutOfBounds { lat: f64, lon: f64 },

    #[error("unrecognized report date {value:?}")]
    InvalidDate { value: String },
}

impl ValidationError {
    /// Stable label used to aggregate skip counters.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidLatitude { .. } => "invalid_latitude",
            ValidationError::InvalidLongitude { .. } => "invalid_longitude",
            ValidationError::OutOfBounds { .. } => "out_of_bounds",
            ValidationError::InvalidDate { .. } => "invalid_date",
        }
    }
}

/// Maps joined source records into incidents for one run.
///
/// `now` is the run clock; it anchors the record-age decay of the
/// confidence score so that a run is reproducible.
#[derive(Debug, Clone)]
pub struct Normalizer {
    bounds: BoundingBox,
    now: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(bounds: BoundingBox, now: DateTime<Utc>) -> Self {
        Normalizer { bounds, now }
    }

    pub fn normalize(&self, record: &SourceRecord) -> Result<Incident, ValidationError> {
        // ---
        let neighborhood = &record.neighborhood;

        let lat = parse_coordinate(&neighborhood.latitude).ok_or_else(|| {
            ValidationError::InvalidLatitude {
                value: neighborhood.latitude.clone(),
            }
        })?;
        let lon = parse_coordinate(&neighborhood.longitude).ok_or_else(|| {
            ValidationError::InvalidLongitude {
                value: neighborhood.longitude.clone(),
            }
        })?;

        if !self.bounds.contains(lat, lon) {
            return Err(ValidationError::OutOfBounds { lat, lon });
        }

        let occurred_at = parse_report_date(&record.report.report_date).ok_or_else(|| {
            ValidationError::InvalidDate {
                value: record.report.report_date.clone(),
            }
        })?;

        Ok(Incident {
            id: Incident::id_for_report(record.report.report_id),
            occurred_at,
            category: classify_crime(&record.crime.name),
            severity: record.crime.weight,
            latitude: lat,
            longitude: lon,
            neighborhood: neighborhood.name.clone(),
            confidence: confidence_score(
                neighborhood.weight,
                record.crime.weight,
                record.report.created_at,
                self.now,
            ),
            source: INCIDENT_SOURCE.to_string(),
            cell_id: None,
            cell_resolution: None,
        })
    }
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a legacy report date. Formats are tried in order (date-only,
/// `date time`, `dateTtime`, RFC 3339); the first match wins. Naive values
/// are taken as UTC.
pub fn parse_report_date(value: &str) -> Option<DateTime<Utc>> {
    // ---
    let value = value.trim();

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `Hediondo` when the crime name mentions a severe crime, else `Comum`.
pub fn classify_crime(name: &str) -> Category {
    // ---
    let folded = fold_accents(&name.to_lowercase());
    if SEVERE_KEYWORDS.iter().any(|k| folded.contains(k)) {
        Category::Hediondo
    } else {
        Category::Comum
    }
}

/// Strip diacritics: decompose, then drop combining marks. Precomposed and
/// decomposed spellings fold to the same text.
fn fold_accents(value: &str) -> String {
    value.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Heuristic confidence in `[0.1, 1.0]`.
///
/// Base 0.5, plus `neighborhood_weight / 100` for positive weights, decayed
/// by 0.7 past 365 days of age or 0.85 past 180 days, plus 0.1 when the
/// crime carries a positive weight.
pub fn confidence_score(
    neighborhood_weight: i32,
    crime_weight: i32,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    // ---
    let mut confidence = 0.5;

    if neighborhood_weight > 0 {
        confidence += f64::from(neighborhood_weight) / 100.0;
    }

    let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
    if age_days > 365.0 {
        confidence *= 0.7;
    } else if age_days > 180.0 {
        confidence *= 0.85;
    }

    if crime_weight > 0 {
        confidence += 0.1;
    }

    confidence.clamp(0.1, 1.0)
}

/// Outcome of the normalize phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeStats {
    pub read: u64,
    pub written: u64,
    pub failed: u64,
    /// Reports dated outside the processing window. Not part of `read`.
    pub outside_window: u64,
    /// Skipped records per validation reason.
    pub skipped: BTreeMap<&'static str, u64>,
}

impl NormalizeStats {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }
}

/// Curate every source report dated within `[start, end]` into the target.
///
/// The window applies to the parsed report date, so a report whose date
/// text matches no layout always reaches validation and is counted as
/// `invalid_date`.
pub async fn run(
    ctx: &PipelineContext,
    source: &dyn SourceStore,
    target: &dyn TargetStore,
    bounds: BoundingBox,
    start: NaiveDate,
    end: NaiveDate,
    batch_size: usize,
) -> Result<NormalizeStats, PipelineError> {
    // ---
    let records = ctx.call(Phase::Normalize, source.fetch_reports()).await?;

    let normalizer = Normalizer::new(bounds, ctx.now);
    let mut stats = NormalizeStats::default();

    let mut incidents = Vec::with_capacity(records.len());
    for record in &records {
        if let Some(at) = parse_report_date(&record.report.report_date) {
            let day = at.date_naive();
            if day < start || day > end {
                stats.outside_window += 1;
                continue;
            }
        }
        stats.read += 1;

        match normalizer.normalize(record) {
            Ok(incident) => incidents.push(incident),
            Err(err) => {
                *stats.skipped.entry(err.reason()).or_default() += 1;
                ctx.emit(PipelineEvent::RecordSkipped {
                    report_id: record.report.report_id,
                    reason: err.reason(),
                    detail: err.to_string(),
                });
            }
        }
    }

    if !stats.skipped.is_empty() {
        tracing::warn!(
            "Skipped {} of {} reports: {:?}",
            stats.skipped_total(),
            stats.read,
            stats.skipped
        );
    }

    let tally = ctx
        .write_batches(Phase::Normalize, target, &incidents, batch_size)
        .await?;
    stats.written = tally.written;
    stats.failed = tally.failed;

    Ok(stats)
}
