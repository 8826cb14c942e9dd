//! Quality validator.
//!
//! Metrics are computed from store aggregates and persisted once per
//! calendar day before any threshold is enforced, so a failing run still
//! leaves its report behind. Runs without incidents report zeroed metrics
//! and always pass.
//!
//! Temporal coverage divides the distinct incident hours by the whole hours
//! between the first and last incident, truncated. A span under one hour is
//! zero-width and yields 0; the ratio is capped at 1.

use crate::error::{PipelineError, QualityThresholdError, ThresholdBreach};
use crate::models::{FeatureStats, IncidentStats, Phase, QualityMetrics, QualityReport};
use crate::pipeline::PipelineContext;
use crate::store::TargetStore;

// ---

const PHASE: Phase = Phase::Validate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub min_spatial_coverage: f64,
    pub max_duplication_rate: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            min_spatial_coverage: 0.10,
            max_duplication_rate: 0.50,
        }
    }
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
}

/// Derive the report metrics. Every ratio lies in `[0, 1]`.
pub fn compute_metrics(
    incidents: &IncidentStats,
    total_cells: i64,
    occupied_cells: i64,
    features: &FeatureStats,
) -> QualityMetrics {
    // ---
    if incidents.total == 0 {
        return QualityMetrics::default();
    }

    let temporal_coverage = match (incidents.first_occurred_at, incidents.last_occurred_at) {
        (Some(first), Some(last)) if incidents.total >= 2 => {
            ratio(incidents.distinct_hours, (last - first).num_hours())
        }
        _ => 0.0,
    };

    let feature_completeness = if features.total_rows > 0 {
        1.0 - ratio(features.incomplete_rows, features.total_rows)
    } else {
        0.0
    };

    QualityMetrics {
        spatial_coverage: ratio(occupied_cells, total_cells),
        temporal_coverage,
        duplication_rate: 1.0 - ratio(incidents.distinct_keys, incidents.total),
        feature_completeness,
        total_incidents: incidents.total,
    }
}

/// Breaches of `thresholds`. Empty datasets never breach.
pub fn enforce(
    metrics: &QualityMetrics,
    thresholds: &QualityThresholds,
) -> Result<(), QualityThresholdError> {
    // ---
    if metrics.total_incidents == 0 {
        return Ok(());
    }

    let mut breaches = Vec::new();
    if metrics.spatial_coverage < thresholds.min_spatial_coverage {
        breaches.push(ThresholdBreach {
            metric: "spatial_coverage",
            value: metrics.spatial_coverage,
            threshold: thresholds.min_spatial_coverage,
        });
    }
    if metrics.duplication_rate > thresholds.max_duplication_rate {
        breaches.push(ThresholdBreach {
            metric: "duplication_rate",
            value: metrics.duplication_rate,
            threshold: thresholds.max_duplication_rate,
        });
    }

    if breaches.is_empty() {
        Ok(())
    } else {
        Err(QualityThresholdError { breaches })
    }
}

/// Compute and persist today's quality report.
pub async fn validate(
    ctx: &PipelineContext,
    target: &dyn TargetStore,
    resolution: i32,
) -> Result<QualityMetrics, PipelineError> {
    // ---
    let incidents = ctx.call(PHASE, target.incident_stats()).await?;
    let total_cells = ctx.call(PHASE, target.cell_count(resolution)).await?;
    let occupied = ctx
        .call(PHASE, target.cells_with_incidents(resolution))
        .await?;
    let features = ctx.call(PHASE, target.feature_stats()).await?;

    let metrics = compute_metrics(&incidents, total_cells, occupied, &features);
    let report = QualityReport {
        report_date: ctx.now.date_naive(),
        metrics: metrics.clone(),
    };
    ctx.call(PHASE, target.upsert_quality_report(&report)).await?;

    tracing::info!(
        "Quality: spatial={:.4} temporal={:.4} duplication={:.4} completeness={:.4} incidents={}",
        metrics.spatial_coverage,
        metrics.temporal_coverage,
        metrics.duplication_rate,
        metrics.feature_completeness,
        metrics.total_incidents
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, minute, 0).unwrap()
    }

    fn create_test_stats(
        total: i64,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        hours: i64,
        keys: i64,
    ) -> IncidentStats {
        IncidentStats {
            total,
            first_occurred_at: Some(first),
            last_occurred_at: Some(last),
            distinct_hours: hours,
            distinct_keys: keys,
        }
    }

    #[test]
    fn test_empty_dataset_is_zero_and_passes() {
        // ---
        let features = FeatureStats {
            total_rows: 100,
            incomplete_rows: 0,
        };
        let metrics = compute_metrics(&IncidentStats::default(), 2520, 0, &features);
        assert_eq!(metrics, QualityMetrics::default());
        assert!(enforce(&metrics, &QualityThresholds::default()).is_ok());
    }

    #[test]
    fn test_metrics_values() {
        // ---
        // 4 incidents over 10:00..14:00, seen in 3 distinct hours
        let stats = create_test_stats(4, at(10, 10, 0), at(10, 14, 0), 3, 3);
        let features = FeatureStats {
            total_rows: 10,
            incomplete_rows: 4,
        };
        let metrics = compute_metrics(&stats, 100, 20, &features);

        assert!((metrics.spatial_coverage - 0.2).abs() < 1e-12);
        assert!((metrics.temporal_coverage - 0.75).abs() < 1e-12);
        assert!((metrics.duplication_rate - 0.25).abs() < 1e-12);
        assert!((metrics.feature_completeness - 0.6).abs() < 1e-12);
        assert_eq!(metrics.total_incidents, 4);
    }

    #[test]
    fn test_single_incident_has_no_temporal_coverage() {
        // ---
        let stats = create_test_stats(1, at(10, 14, 0), at(10, 14, 0), 1, 1);
        let metrics = compute_metrics(&stats, 10, 1, &FeatureStats::default());
        assert_eq!(metrics.temporal_coverage, 0.0);
        assert_eq!(metrics.duplication_rate, 0.0);
        assert_eq!(metrics.feature_completeness, 0.0);
    }

    #[test]
    fn test_ratios_stay_in_unit_interval() {
        // ---
        let stats = create_test_stats(5, at(10, 14, 0), at(10, 14, 50), 1, 5);
        let metrics = compute_metrics(&stats, 0, 3, &FeatureStats::default());
        for value in [
            metrics.spatial_coverage,
            metrics.temporal_coverage,
            metrics.duplication_rate,
            metrics.feature_completeness,
        ] {
            assert!((0.0..=1.0).contains(&value));
        }
        assert_eq!(metrics.spatial_coverage, 0.0);
    }

    #[test]
    fn test_sub_hour_span_has_no_temporal_coverage() {
        // ---
        let stats = create_test_stats(2, at(10, 14, 0), at(10, 14, 50), 1, 2);
        let metrics = compute_metrics(&stats, 10, 1, &FeatureStats::default());
        assert_eq!(metrics.temporal_coverage, 0.0);

        // 14:00 and 15:30 span one whole hour but touch two buckets.
        let stats = create_test_stats(2, at(10, 14, 0), at(10, 15, 30), 2, 2);
        let metrics = compute_metrics(&stats, 10, 1, &FeatureStats::default());
        assert_eq!(metrics.temporal_coverage, 1.0);

        let stats = create_test_stats(2, at(10, 14, 0), at(11, 14, 0), 2, 2);
        let metrics = compute_metrics(&stats, 10, 1, &FeatureStats::default());
        assert!((metrics.temporal_coverage - 2.0 / 24.0).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_breaches_are_listed() {
        // ---
        let metrics = QualityMetrics {
            spatial_coverage: 0.05,
            temporal_coverage: 1.0,
            duplication_rate: 0.6,
            feature_completeness: 1.0,
            total_incidents: 10,
        };
        let err = enforce(&metrics, &QualityThresholds::default()).unwrap_err();
        let names: Vec<&str> = err.breaches.iter().map(|b| b.metric).collect();
        assert_eq!(names, vec!["spatial_coverage", "duplication_rate"]);

        let relaxed = QualityThresholds {
            min_spatial_coverage: 0.0,
            max_duplication_rate: 1.0,
        };
        assert!(enforce(&metrics, &relaxed).is_ok());
    }
}
