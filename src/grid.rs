//! Fixed-resolution spatial grid over the study area.
//!
//! Cells are squares of `resolution` meters using the planar approximation
//! 1° ≈ 111,000 m on both axes. Generation order is fixed: longitude columns
//! outer (west to east), latitude rows inner (south to north), sequence
//! numbers starting at 1. Cell ids are therefore stable across runs for a
//! given area and resolution: `"<CODE>-<resolution>-<sequence>"`.
//!
//! Cell bounds are computed as `origin + index * size`, never by
//! accumulation, so neighbouring cells share bit-identical edges and the
//! half-open `[min, max)` rule assigns every interior point to exactly one
//! cell.

use serde::Serialize;

use crate::error::PipelineError;
use crate::models::{Cell, Phase};
use crate::pipeline::PipelineContext;
use crate::store::TargetStore;

// ---

pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Ratios within this distance of an integer count as that integer, so that
/// float noise in the box span does not add a sliver column.
const SPAN_EPSILON: f64 = 1e-9;

/// Inclusive geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// The city the pipeline indexes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudyArea {
    pub city: &'static str,
    /// Prefix of every cell id.
    pub code: &'static str,
    pub bounds: BoundingBox,
}

impl StudyArea {
    pub const CAMPINAS: StudyArea = StudyArea {
        city: "Campinas",
        code: "CAMP",
        bounds: BoundingBox {
            min_lat: -23.1,
            max_lat: -22.7,
            min_lon: -47.3,
            max_lon: -46.8,
        },
    };
}

/// Grid definition for one area at one resolution.
#[derive(Debug, Clone)]
pub struct Grid {
    area: StudyArea,
    resolution: i32,
    cell_deg: f64,
    columns: usize,
    rows: usize,
}

impl Grid {
    pub fn new(area: StudyArea, resolution: i32) -> Self {
        // ---
        let resolution = resolution.max(1);
        let cell_deg = f64::from(resolution) / METERS_PER_DEGREE;
        let bounds = area.bounds;

        Grid {
            area,
            resolution,
            cell_deg,
            columns: span_cells(bounds.max_lon - bounds.min_lon, cell_deg),
            rows: span_cells(bounds.max_lat - bounds.min_lat, cell_deg),
        }
    }

    pub fn resolution(&self) -> i32 {
        self.resolution
    }

    /// `(longitude columns, latitude rows)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.columns, self.rows)
    }

    pub fn cell_count(&self) -> usize {
        self.columns * self.rows
    }

    pub fn cell_id(&self, sequence: usize) -> String {
        format!("{}-{}-{}", self.area.code, self.resolution, sequence)
    }

    /// Every cell in generation order.
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.columns).flat_map(move |col| (0..self.rows).map(move |row| self.cell_at(col, row)))
    }

    /// Cell containing the coordinate under the `[min, max)` rule.
    pub fn locate(&self, lat: f64, lon: f64) -> Option<Cell> {
        // ---
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let col = ((lon - self.area.bounds.min_lon) / self.cell_deg).floor() as i64;
        let row = ((lat - self.area.bounds.min_lat) / self.cell_deg).floor() as i64;

        // The division can round across an edge; the stored bounds decide.
        for dc in [0, -1, 1] {
            for dr in [0, -1, 1] {
                let (c, r) = (col + dc, row + dr);
                if c < 0 || r < 0 || c >= self.columns as i64 || r >= self.rows as i64 {
                    continue;
                }
                let cell = self.cell_at(c as usize, r as usize);
                if cell.contains(lat, lon) {
                    return Some(cell);
                }
            }
        }

        // The area's outer edge is inclusive: it belongs to the last column/row.
        if self.columns > 0 && self.rows > 0 && self.area.bounds.contains(lat, lon) {
            let c = col.clamp(0, self.columns as i64 - 1) as usize;
            let r = row.clamp(0, self.rows as i64 - 1) as usize;
            return Some(self.cell_at(c, r));
        }
        None
    }

    fn cell_at(&self, col: usize, row: usize) -> Cell {
        // ---
        let bounds = &self.area.bounds;
        let min_lon = bounds.min_lon + col as f64 * self.cell_deg;
        let max_lon = bounds.min_lon + (col + 1) as f64 * self.cell_deg;
        let min_lat = bounds.min_lat + row as f64 * self.cell_deg;
        let max_lat = bounds.min_lat + (row + 1) as f64 * self.cell_deg;
        let sequence = col * self.rows + row + 1;

        Cell {
            cell_id: self.cell_id(sequence),
            resolution: self.resolution,
            city: self.area.city.to_string(),
            sequence: sequence as i32,
            min_lat,
            min_lon,
            max_lat,
            max_lon,
            center_lat: (min_lat + max_lat) / 2.0,
            center_lon: (min_lon + max_lon) / 2.0,
        }
    }
}

/// Outcome of the grid phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GridStats {
    pub cells: u64,
    /// Cells that did not exist before this run.
    pub inserted: u64,
    pub failed: u64,
}

/// Persist the cell catalog. Existing cells are left untouched, so a second
/// run inserts nothing.
pub async fn generate(
    ctx: &PipelineContext,
    target: &dyn TargetStore,
    grid: &Grid,
    batch_size: usize,
) -> Result<GridStats, PipelineError> {
    // ---
    let cells: Vec<Cell> = grid.cells().collect();
    let (columns, rows) = grid.dimensions();
    tracing::info!(
        "Grid {}m: {} columns x {} rows = {} cells",
        grid.resolution(),
        columns,
        rows,
        cells.len()
    );

    let tally = ctx
        .write_batches(Phase::Grid, target, &cells, batch_size)
        .await?;

    Ok(GridStats {
        cells: cells.len() as u64,
        inserted: tally.written,
        failed: tally.failed,
    })
}

fn span_cells(span_deg: f64, cell_deg: f64) -> usize {
    let ratio = span_deg / cell_deg;
    ((ratio - SPAN_EPSILON).ceil().max(0.0)) as usize
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_campinas_dimensions() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        assert_eq!(grid.dimensions(), (56, 45));
        assert_eq!(grid.cell_count(), 2520);

        let grid = Grid::new(StudyArea::CAMPINAS, 500);
        assert_eq!(grid.dimensions(), (111, 89));
    }

    #[test]
    fn test_generation_is_stable_and_unique() {
        // ---
        let first: Vec<Cell> = Grid::new(StudyArea::CAMPINAS, 1000).cells().collect();
        let second: Vec<Cell> = Grid::new(StudyArea::CAMPINAS, 1000).cells().collect();
        assert_eq!(first, second);

        let ids: HashSet<&str> = first.iter().map(|c| c.cell_id.as_str()).collect();
        assert_eq!(ids.len(), first.len());
        assert_eq!(first[0].cell_id, "CAMP-1000-1");
        assert_eq!(first.last().map(|c| c.sequence), Some(2520));
    }

    #[test]
    fn test_latitude_is_inner_axis() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        let cells: Vec<Cell> = grid.cells().take(2).collect();
        assert_eq!(cells[0].min_lon, cells[1].min_lon);
        assert_eq!(cells[0].max_lat, cells[1].min_lat);
    }

    #[test]
    fn test_locate_known_point() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        let cell = grid.locate(-22.90, -47.05).expect("inside the grid");
        assert_eq!(cell.cell_id, "CAMP-1000-1238");
        assert!(cell.contains(-22.90, -47.05));
    }

    #[test]
    fn test_every_center_locates_to_its_cell() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        for cell in grid.cells() {
            let found = grid.locate(cell.center_lat, cell.center_lon).unwrap();
            assert_eq!(found.cell_id, cell.cell_id);
        }
    }

    #[test]
    fn test_shared_edge_goes_to_upper_cell() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        let cells: Vec<Cell> = grid.cells().take(2).collect();
        let edge_lat = cells[0].max_lat;
        let found = grid.locate(edge_lat, cells[0].center_lon).unwrap();
        assert_eq!(found.cell_id, cells[1].cell_id);
    }

    #[test]
    fn test_outer_corner_has_a_cell() {
        // ---
        for resolution in [500, 1000] {
            let grid = Grid::new(StudyArea::CAMPINAS, resolution);
            let corner = grid.locate(-22.7, -46.8).expect("corner is inside the area");
            assert!(corner.sequence as usize <= grid.cell_count());
            let origin = grid.locate(-23.1, -47.3).expect("origin is inside the area");
            assert_eq!(origin.sequence, 1);
        }
    }

    #[test]
    fn test_outside_points_have_no_cell() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        assert!(grid.locate(-10.0, -10.0).is_none());
        assert!(grid.locate(-23.2, -47.0).is_none());
        assert!(grid.locate(f64::NAN, -47.0).is_none());
    }

    #[tokio::test]
    async fn test_generate_is_idempotent() {
        // ---
        use crate::store::memory::MemoryStore;
        use chrono::Utc;
        use tokio_util::sync::CancellationToken;

        let store = MemoryStore::default().with_max_bind_params(1000);
        let ctx = PipelineContext::new(Utc::now(), CancellationToken::new());
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);

        let first = generate(&ctx, &store, &grid, 500).await.unwrap();
        assert_eq!(first.cells, 2520);
        assert_eq!(first.inserted, 2520);
        let before = store.stored_cells();

        let second = generate(&ctx, &store, &grid, 500).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.failed, 0);
        assert_eq!(store.stored_cells(), before);
    }

    #[test]
    fn test_bounding_box_is_inclusive() {
        // ---
        let bounds = StudyArea::CAMPINAS.bounds;
        assert!(bounds.contains(-23.1, -47.3));
        assert!(bounds.contains(-22.7, -46.8));
        assert!(!bounds.contains(-10.0, -10.0));
    }
}
