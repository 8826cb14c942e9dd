//! Temporal feature generator.
//!
//! One grouped aggregate (`TargetStore::hourly_counts`) covers the whole
//! processing range plus the longest look-back window. Per cell, the sparse
//! hourly counts become a cumulative series, so every window count is two
//! binary searches. Rows are then emitted for every `(cell, hour)` in the
//! range, day by day, and written in bounded batches.
//!
//! Window conventions for a bucket `b`:
//! - `y_count`: `[b, b + 1h)`
//! - `lag_Δ`: `[b - Δ, b)`
//! - `roll_N`: `[b - N, b + 1h)`, i.e. `lag_N + y_count`

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;

use crate::error::PipelineError;
use crate::models::{
    Cell, CellFeatureRow, Holiday, HourlyCount, Phase, WeatherObservation,
};
use crate::pipeline::PipelineContext;
use crate::store::TargetStore;

// ---

const PHASE: Phase = Phase::Features;

/// Longest look-back any feature needs.
const MAX_LOOKBACK_HOURS: i64 = 7 * 24;

const BUSINESS_HOURS: std::ops::RangeInclusive<u32> = 8..=18;

/// Truncate to the start of the UTC hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(3600) * 3600;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

/// Hour buckets `b` with `hour_bucket(start) <= b < end`.
pub fn buckets_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    // ---
    let mut buckets = Vec::new();
    let mut bucket = hour_bucket(start);
    while bucket < end {
        buckets.push(bucket);
        bucket += Duration::hours(1);
    }
    buckets
}

/// Sparse hourly counts of one cell with prefix sums.
#[derive(Debug, Default)]
struct CellSeries {
    buckets: Vec<DateTime<Utc>>,
    // cumulative[i] = sum of counts for buckets[..i]
    cumulative: Vec<i64>,
}

impl CellSeries {
    fn from_counts(mut counts: Vec<(DateTime<Utc>, i64)>) -> Self {
        // ---
        counts.sort_by_key(|(bucket, _)| *bucket);
        let mut series = CellSeries {
            buckets: Vec::with_capacity(counts.len()),
            cumulative: Vec::with_capacity(counts.len() + 1),
        };
        series.cumulative.push(0);
        let mut total = 0;
        for (bucket, count) in counts {
            total += count;
            series.buckets.push(bucket);
            series.cumulative.push(total);
        }
        series
    }

    /// Incidents in `[from, to)`.
    fn count(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        // ---
        if to <= from {
            return 0;
        }
        let lo = self.buckets.partition_point(|b| *b < from);
        let hi = self.buckets.partition_point(|b| *b < to);
        self.cumulative[hi] - self.cumulative[lo]
    }
}

/// Holiday membership by calendar date.
#[derive(Debug, Default)]
pub struct HolidayCalendar {
    dates: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(holidays: &[Holiday]) -> Self {
        HolidayCalendar {
            dates: holidays.iter().map(|h| h.date).collect(),
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn is_day_before(&self, date: NaiveDate) -> bool {
        date.succ_opt().is_some_and(|next| self.is_holiday(next))
    }

    pub fn is_day_after(&self, date: NaiveDate) -> bool {
        date.pred_opt().is_some_and(|prev| self.is_holiday(prev))
    }
}

/// Computes feature rows from pre-aggregated hourly counts.
pub struct FeatureBuilder {
    series: HashMap<String, CellSeries>,
    calendar: HolidayCalendar,
    weather: HashMap<DateTime<Utc>, (Option<f64>, Option<f64>)>,
}

impl FeatureBuilder {
    pub fn new(
        counts: Vec<HourlyCount>,
        holidays: &[Holiday],
        weather: &[WeatherObservation],
    ) -> Self {
        // ---
        let mut grouped: HashMap<String, Vec<(DateTime<Utc>, i64)>> = HashMap::new();
        for row in counts {
            grouped
                .entry(row.cell_id)
                .or_default()
                .push((hour_bucket(row.bucket), row.count));
        }

        let mut by_hour = HashMap::new();
        for observation in weather {
            // First observation of an hour wins.
            by_hour
                .entry(hour_bucket(observation.ts))
                .or_insert((observation.rain_mm, observation.temp_c));
        }

        FeatureBuilder {
            series: grouped
                .into_iter()
                .map(|(cell, counts)| (cell, CellSeries::from_counts(counts)))
                .collect(),
            calendar: HolidayCalendar::new(holidays),
            weather: by_hour,
        }
    }

    pub fn row(&self, cell_id: &str, bucket: DateTime<Utc>) -> CellFeatureRow {
        // ---
        let next = bucket + Duration::hours(1);
        let window = |hours: i64| -> i32 {
            let count = self
                .series
                .get(cell_id)
                .map_or(0, |s| s.count(bucket - Duration::hours(hours), bucket));
            saturate(count)
        };
        let rolling = |hours: i64| -> i32 {
            let count = self
                .series
                .get(cell_id)
                .map_or(0, |s| s.count(bucket - Duration::hours(hours), next));
            saturate(count)
        };
        let y_count = self
            .series
            .get(cell_id)
            .map_or(0, |s| s.count(bucket, next));

        let date = bucket.date_naive();
        let dow = bucket.weekday().num_days_from_sunday();
        let hour = bucket.hour();
        let (rain, temp) = self.weather.get(&bucket).copied().unwrap_or((None, None));

        CellFeatureRow {
            cell_id: cell_id.to_string(),
            time_bucket: bucket,
            y_count: saturate(y_count),
            lag_1h: window(1),
            lag_24h: window(24),
            lag_7d: window(MAX_LOOKBACK_HOURS),
            roll_3h_sum: rolling(3),
            roll_24h_sum: rolling(24),
            roll_7d_sum: rolling(MAX_LOOKBACK_HOURS),
            day_of_week: dow as i16,
            hour_of_day: hour as i16,
            is_weekend: dow == 0 || dow == 6,
            is_business_hours: BUSINESS_HOURS.contains(&hour),
            is_holiday: self.calendar.is_holiday(date),
            day_before_holiday: self.calendar.is_day_before(date),
            day_after_holiday: self.calendar.is_day_after(date),
            weather_rain_mm: rain,
            weather_temp_c: temp,
        }
    }
}

fn saturate(count: i64) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Outcome of the features phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureRunStats {
    pub cells: u64,
    pub buckets: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
}

/// Recompute and upsert every feature row for `cells` over `[start, end)`.
pub async fn generate(
    ctx: &PipelineContext,
    target: &dyn TargetStore,
    cells: &[Cell],
    resolution: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    batch_size: usize,
) -> Result<FeatureRunStats, PipelineError> {
    // ---
    let buckets = buckets_in_range(start, end);
    let mut stats = FeatureRunStats {
        cells: cells.len() as u64,
        buckets: buckets.len() as u64,
        ..Default::default()
    };
    let (Some(first), Some(last)) = (buckets.first().copied(), buckets.last().copied()) else {
        return Ok(stats);
    };
    let range_end = last + Duration::hours(1);

    let counts = ctx
        .call(
            PHASE,
            target.hourly_counts(resolution, first - Duration::hours(MAX_LOOKBACK_HOURS), range_end),
        )
        .await?;
    let holidays = ctx
        .call(
            PHASE,
            target.holidays(
                first.date_naive() - Duration::days(1),
                last.date_naive() + Duration::days(1),
            ),
        )
        .await?;
    let weather = ctx.call(PHASE, target.weather(first, range_end)).await?;

    tracing::debug!(
        "Feature inputs: {} hourly groups, {} holidays, {} weather observations",
        counts.len(),
        holidays.len(),
        weather.len()
    );
    let builder = FeatureBuilder::new(counts, &holidays, &weather);

    // Day partitions; the (cell, bucket) keys of two days never overlap.
    for day in buckets.chunk_by(|a, b| a.date_naive() == b.date_naive()) {
        // ---
        let started = Instant::now();
        let rows: Vec<CellFeatureRow> = day
            .iter()
            .flat_map(|bucket| cells.iter().map(|cell| builder.row(&cell.cell_id, *bucket)))
            .collect();

        let tally = ctx.write_batches(PHASE, target, &rows, batch_size).await?;
        stats.rows_written += tally.written;
        stats.rows_failed += tally.failed;

        tracing::debug!(
            "Features for {}: {} rows in {:?}",
            day[0].date_naive(),
            rows.len(),
            started.elapsed()
        );
    }

    Ok(stats)
}
