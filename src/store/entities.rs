//! Entity schemas for the generic batch writers.
//!
//! Each persisted record declares its table, column order, conflict key and
//! the columns replaced on conflict. Backends build their upsert statements
//! from these declarations instead of hand-writing one per table.

use crate::models::{Cell, CellFeatureRow, CellLabel, Incident, NeighborhoodCell};

// ---

pub trait Entity {
    const TABLE: &'static str;
    /// Insert column order; row binders must follow it.
    const COLUMNS: &'static [&'static str];
    const KEY: &'static [&'static str];
    /// Columns overwritten on conflict. Empty means conflicts are ignored.
    const UPDATE: &'static [&'static str];
}

impl Entity for Incident {
    const TABLE: &'static str = "curated.incidents";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "occurred_at",
        "category",
        "severity",
        "latitude",
        "longitude",
        "neighborhood",
        "confidence",
        "source",
    ];
    const KEY: &'static [&'static str] = &["id"];
    // Coordinates and the cell assignment are immutable once curated.
    const UPDATE: &'static [&'static str] = &[
        "occurred_at",
        "category",
        "severity",
        "neighborhood",
        "confidence",
        "source",
    ];
}

impl Entity for Cell {
    const TABLE: &'static str = "curated.cells";
    const COLUMNS: &'static [&'static str] = &[
        "cell_id",
        "cell_resolution",
        "city",
        "sequence",
        "min_lat",
        "min_lon",
        "max_lat",
        "max_lon",
        "center_lat",
        "center_lon",
    ];
    const KEY: &'static [&'static str] = &["cell_id"];
    const UPDATE: &'static [&'static str] = &[];
}

impl Entity for CellLabel {
    const TABLE: &'static str = "curated.cell_neighborhoods";
    const COLUMNS: &'static [&'static str] = &[
        "cell_id",
        "neighborhood_id",
        "neighborhood_name",
        "distance_deg",
    ];
    const KEY: &'static [&'static str] = &["cell_id"];
    const UPDATE: &'static [&'static str] =
        &["neighborhood_id", "neighborhood_name", "distance_deg"];
}

impl Entity for NeighborhoodCell {
    const TABLE: &'static str = "curated.neighborhood_cells";
    const COLUMNS: &'static [&'static str] = &["neighborhood_id", "cell_resolution", "cell_id"];
    const KEY: &'static [&'static str] = &["neighborhood_id", "cell_resolution"];
    const UPDATE: &'static [&'static str] = &["cell_id"];
}

impl Entity for CellFeatureRow {
    const TABLE: &'static str = "features.cell_hourly";
    const COLUMNS: &'static [&'static str] = &[
        "cell_id",
        "ts",
        "y_count",
        "lag_1h",
        "lag_24h",
        "lag_7d",
        "roll_3h_sum",
        "roll_24h_sum",
        "roll_7d_sum",
        "dow",
        "hour",
        "is_weekend",
        "is_business_hours",
        "holiday",
        "day_before_holiday",
        "day_after_holiday",
        "weather_rain_mm",
        "weather_temp_c",
    ];
    const KEY: &'static [&'static str] = &["cell_id", "ts"];
    const UPDATE: &'static [&'static str] = &[
        "y_count",
        "lag_1h",
        "lag_24h",
        "lag_7d",
        "roll_3h_sum",
        "roll_24h_sum",
        "roll_7d_sum",
        "dow",
        "hour",
        "is_weekend",
        "is_business_hours",
        "holiday",
        "day_before_holiday",
        "day_after_holiday",
        "weather_rain_mm",
        "weather_temp_c",
    ];
}
