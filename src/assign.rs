//! Cell assignment engine.
//!
//! Walks unassigned incidents with keyset pagination and sets the cell whose
//! stored bounds contain the coordinate under the `[min, max)` rule. The
//! update only touches rows whose `cell_id` is still null, so re-running the
//! phase only picks up newly curated incidents. Incidents matching no cell
//! stay unassigned and surface as a lower spatial coverage.
//!
//! Labels are produced in both directions: each neighborhood gets the cell
//! containing its reference point, and each cell gets its nearest
//! neighborhood by Euclidean distance in degrees (first nearest wins).

use std::collections::HashMap;

use serde::Serialize;

use crate::error::PipelineError;
use crate::grid::Grid;
use crate::models::{Cell, CellAssignment, CellLabel, Neighborhood, NeighborhoodCell, Phase};
use crate::pipeline::{PipelineContext, PipelineEvent};
use crate::store::{SourceStore, TargetStore};

// ---

const PHASE: Phase = Phase::AssignCells;

/// Outcome of the assignment phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignStats {
    pub assigned: u64,
    /// Incidents with no containing cell in the catalog.
    pub unmatched: u64,
    pub failed: u64,
    pub neighborhoods_mapped: u64,
    pub cells_labelled: u64,
}

/// Neighborhood with a parsed reference point.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Landmark {
    /// `None` when the stored coordinates do not parse.
    pub fn from_neighborhood(n: &Neighborhood) -> Option<Self> {
        // ---
        let lat = n.latitude.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
        let lon = n.longitude.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
        Some(Landmark {
            id: n.id,
            name: n.name.clone(),
            lat,
            lon,
        })
    }
}

/// Cell in `catalog` containing the point, if any.
pub fn containing_cell<'a>(
    grid: &Grid,
    catalog: &'a HashMap<String, Cell>,
    lat: f64,
    lon: f64,
) -> Option<&'a Cell> {
    // ---
    let candidate = grid.locate(lat, lon)?;
    catalog.get(&candidate.cell_id)
}

/// Nearest landmark to the point and its distance in degrees.
///
/// Planar distance in degree space; ties keep the earliest landmark.
pub fn nearest_landmark(landmarks: &[Landmark], lat: f64, lon: f64) -> Option<(&Landmark, f64)> {
    // ---
    let mut best: Option<(&Landmark, f64)> = None;
    for landmark in landmarks {
        let distance = ((landmark.lat - lat).powi(2) + (landmark.lon - lon).powi(2)).sqrt();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((landmark, distance));
        }
    }
    best
}

pub async fn run(
    ctx: &PipelineContext,
    source: &dyn SourceStore,
    target: &dyn TargetStore,
    grid: &Grid,
    batch_size: usize,
) -> Result<AssignStats, PipelineError> {
    // ---
    let resolution = grid.resolution();
    let cells = ctx.call(PHASE, target.cells(resolution)).await?;
    let catalog: HashMap<String, Cell> = cells
        .iter()
        .map(|c| (c.cell_id.clone(), c.clone()))
        .collect();

    let mut stats = AssignStats::default();
    assign_incidents(ctx, target, grid, &catalog, batch_size, &mut stats).await?;

    let neighborhoods = ctx.call(PHASE, source.neighborhoods()).await?;
    let landmarks: Vec<Landmark> = neighborhoods
        .iter()
        .filter_map(Landmark::from_neighborhood)
        .collect();
    if landmarks.len() < neighborhoods.len() {
        tracing::warn!(
            "{} neighborhoods have unparseable coordinates",
            neighborhoods.len() - landmarks.len()
        );
    }

    let neighborhood_cells: Vec<NeighborhoodCell> = landmarks
        .iter()
        .filter_map(|l| {
            containing_cell(grid, &catalog, l.lat, l.lon).map(|cell| NeighborhoodCell {
                neighborhood_id: l.id,
                resolution,
                cell_id: cell.cell_id.clone(),
            })
        })
        .collect();
    let tally = ctx
        .write_batches(PHASE, target, &neighborhood_cells, batch_size)
        .await?;
    stats.neighborhoods_mapped = tally.written;
    stats.failed += tally.failed;

    // `cells` is in sequence order, which fixes the label output order.
    let labels: Vec<CellLabel> = cells
        .iter()
        .filter_map(|cell| {
            nearest_landmark(&landmarks, cell.center_lat, cell.center_lon).map(
                |(landmark, distance)| CellLabel {
                    cell_id: cell.cell_id.clone(),
                    neighborhood_id: landmark.id,
                    neighborhood_name: landmark.name.clone(),
                    distance_deg: distance,
                },
            )
        })
        .collect();
    let tally = ctx
        .write_batches(PHASE, target, &labels, batch_size)
        .await?;
    stats.cells_labelled = tally.written;
    stats.failed += tally.failed;

    Ok(stats)
}

async fn assign_incidents(
    ctx: &PipelineContext,
    target: &dyn TargetStore,
    grid: &Grid,
    catalog: &HashMap<String, Cell>,
    batch_size: usize,
    stats: &mut AssignStats,
) -> Result<(), PipelineError> {
    // ---
    let page_size = batch_size.max(1);
    let mut after: Option<String> = None;

    loop {
        let page = ctx
            .call(
                PHASE,
                target.unassigned_incidents(after.as_deref(), page_size),
            )
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());

        let mut batch = Vec::with_capacity(page.len());
        for incident in &page {
            match containing_cell(grid, catalog, incident.latitude, incident.longitude) {
                Some(cell) if cell.contains(incident.latitude, incident.longitude) => {
                    batch.push(CellAssignment {
                        incident_id: incident.id.clone(),
                        cell_id: cell.cell_id.clone(),
                    })
                }
                _ => stats.unmatched += 1,
            }
        }

        if !batch.is_empty() {
            match ctx
                .attempt(PHASE, target.assign_cells(grid.resolution(), &batch))
                .await?
            {
                Ok(updated) => stats.assigned += updated,
                Err(source) if source.is_connectivity() => {
                    return Err(PipelineError::from_store(PHASE, source));
                }
                Err(source) => {
                    ctx.emit(PipelineEvent::BatchFailed {
                        phase: PHASE,
                        table: "curated.incidents",
                        rows: batch.len(),
                        error: source.to_string(),
                    });
                    stats.failed += batch.len() as u64;
                }
            }
        }

        if page.len() < page_size {
            break;
        }
    }

    if stats.unmatched > 0 {
        tracing::warn!("{} incidents matched no cell", stats.unmatched);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::grid::StudyArea;
    use crate::models::{Category, Incident};
    use crate::store::memory::MemoryStore;
    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    fn create_test_landmark(id: i64, lat: f64, lon: f64) -> Landmark {
        Landmark {
            id,
            name: format!("N{id}"),
            lat,
            lon,
        }
    }

    fn create_test_incident(id: &str, lat: f64, lon: f64) -> Incident {
        Incident {
            id: id.to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 1, 10, 14, 0, 0).unwrap(),
            category: Category::Comum,
            severity: 1,
            latitude: lat,
            longitude: lon,
            neighborhood: "Centro".to_string(),
            confidence: 0.5,
            source: "legacy_reports".to_string(),
            cell_id: None,
            cell_resolution: None,
        }
    }

    #[test]
    fn test_nearest_landmark_first_wins_on_tie() {
        // ---
        let landmarks = vec![
            create_test_landmark(1, 0.0, 1.0),
            create_test_landmark(2, 0.0, -1.0),
            create_test_landmark(3, 5.0, 5.0),
        ];
        let (nearest, distance) = nearest_landmark(&landmarks, 0.0, 0.0).unwrap();
        assert_eq!(nearest.id, 1);
        assert!((distance - 1.0).abs() < 1e-12);

        let (nearest, _) = nearest_landmark(&landmarks, 4.0, 4.0).unwrap();
        assert_eq!(nearest.id, 3);
        assert!(nearest_landmark(&[], 0.0, 0.0).is_none());
    }

    #[test]
    fn test_landmark_requires_numeric_coordinates() {
        // ---
        let mut n = Neighborhood {
            id: 1,
            name: "Centro".to_string(),
            latitude: " -22.90 ".to_string(),
            longitude: "-47.05".to_string(),
            weight: 0,
        };
        assert!(Landmark::from_neighborhood(&n).is_some());
        n.longitude = "".to_string();
        assert!(Landmark::from_neighborhood(&n).is_none());
    }

    #[tokio::test]
    async fn test_assignment_respects_containment_and_is_rerunnable() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        let store = MemoryStore::default()
            .with_incident(create_test_incident("rpt_1", -22.90, -47.05))
            .with_incident(create_test_incident("rpt_2", -23.05, -47.25))
            .with_incident(create_test_incident("rpt_3", -10.0, -10.0));
        let ctx = PipelineContext::new(Utc::now(), CancellationToken::new());
        crate::grid::generate(&ctx, &store, &grid, 500).await.unwrap();

        // page size 1 forces several keyset pages
        let stats = run(&ctx, &store, &store, &grid, 1).await.unwrap();
        assert_eq!(stats.assigned, 2);
        assert_eq!(stats.unmatched, 1);

        let cells: HashMap<String, Cell> = store
            .stored_cells()
            .into_iter()
            .map(|c| (c.cell_id.clone(), c))
            .collect();
        let first = store.incidents();
        for incident in &first {
            if let Some(cell_id) = &incident.cell_id {
                assert!(cells[cell_id].contains(incident.latitude, incident.longitude));
                assert_eq!(incident.cell_resolution, Some(1000));
            }
        }
        assert_eq!(first[0].cell_id.as_deref(), Some("CAMP-1000-1238"));
        assert!(first[2].cell_id.is_none());

        let again = run(&ctx, &store, &store, &grid, 1).await.unwrap();
        assert_eq!(again.assigned, 0);
        assert_eq!(store.incidents(), first);
    }

    #[tokio::test]
    async fn test_labels_in_both_directions() {
        // ---
        let grid = Grid::new(StudyArea::CAMPINAS, 1000);
        let store = MemoryStore::default()
            .with_neighborhood(Neighborhood {
                id: 10,
                name: "Centro".to_string(),
                latitude: "-22.90".to_string(),
                longitude: "-47.05".to_string(),
                weight: 0,
            })
            .with_neighborhood(Neighborhood {
                id: 11,
                name: "Fora".to_string(),
                latitude: "-10".to_string(),
                longitude: "-10".to_string(),
                weight: 0,
            });
        let ctx = PipelineContext::new(Utc::now(), CancellationToken::new());
        crate::grid::generate(&ctx, &store, &grid, 500).await.unwrap();

        let stats = run(&ctx, &store, &store, &grid, 500).await.unwrap();
        assert_eq!(stats.neighborhoods_mapped, 1);
        assert_eq!(stats.cells_labelled, 2520);

        let mapped = store.neighborhood_cells();
        assert_eq!(mapped[0].neighborhood_id, 10);
        assert_eq!(mapped[0].cell_id, "CAMP-1000-1238");

        // Every cell of the area is nearer to Centro than to (-10, -10).
        assert!(store.cell_labels().iter().all(|l| l.neighborhood_id == 10));
    }
}
