//! Pipeline orchestrator.
//!
//! Runs the phases strictly in order:
//! `migrate → normalize → grid → assign_cells → features → validate → complete`.
//! Phases hand nothing to each other in memory beyond the settings; each one
//! reads what the previous one persisted. The first phase-terminal error
//! aborts the run without rolling back earlier phases.
//!
//! The execution log row for the run is upserted at every transition. Log
//! writes are not raced against cancellation, so a timed-out run still
//! records its failure.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::assign::{self, AssignStats};
use crate::error::PipelineError;
use crate::features::{self, FeatureRunStats};
use crate::grid::{self, Grid, GridStats, StudyArea};
use crate::models::{ExecutionLogEntry, Phase, PhaseStatus, QualityMetrics};
use crate::normalize::{self, NormalizeStats};
use crate::quality::{self, QualityThresholds};
use crate::store::{SourceStore, TargetStore};

mod context;
mod events;

pub use context::PipelineContext;
#[cfg(test)]
pub use events::RecordingSink;
pub use events::PipelineEvent;

// ---

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub area: StudyArea,
    pub resolution: i32,
    pub days_back: u32,
    pub batch_size: usize,
    pub thresholds: QualityThresholds,
}

impl PipelineSettings {
    /// Processing window `[now - days_back, now)`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - chrono::Duration::days(i64::from(self.days_back)), now)
    }
}

/// Per-phase counters of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounts {
    pub normalize: NormalizeStats,
    pub grid: GridStats,
    pub assign: AssignStats,
    pub features: FeatureRunStats,
    pub quality: Option<QualityMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub execution_id: Uuid,
    pub status: &'static str,
    pub elapsed_ms: u64,
    pub cell_resolution: i32,
    pub days_back: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub counts: RunCounts,
}

/// A run that stopped at `phase`.
#[derive(Debug)]
pub struct RunFailure {
    pub execution_id: Uuid,
    pub phase: Phase,
    pub elapsed: Duration,
    pub error: PipelineError,
    pub counts: RunCounts,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} failed in {} after {:?}: {}",
            self.execution_id, self.phase, self.elapsed, self.error
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Upserts the status projection of one execution.
struct ExecutionLog<'a> {
    ctx: &'a PipelineContext,
    target: &'a dyn TargetStore,
    started_at: DateTime<Utc>,
}

impl ExecutionLog<'_> {
    async fn write(
        &self,
        phase: Phase,
        status: PhaseStatus,
        records_processed: i64,
        error_message: Option<String>,
    ) {
        // ---
        let entry = ExecutionLogEntry {
            execution_id: self.ctx.execution_id,
            phase,
            status,
            started_at: self.started_at,
            finished_at: status.is_terminal().then(Utc::now),
            records_processed,
            error_message,
        };
        if let Err(err) = self.target.record_execution(&entry).await {
            self.ctx.emit(PipelineEvent::LogWriteFailed {
                phase,
                error: err.to_string(),
            });
        }
    }

    async fn start(&self, phase: Phase) -> Instant {
        self.ctx.emit(PipelineEvent::PhaseStarted { phase });
        self.write(phase, PhaseStatus::Running, 0, None).await;
        Instant::now()
    }

    async fn finish(&self, phase: Phase, records: i64, started: Instant) {
        self.write(phase, PhaseStatus::Success, records, None).await;
        self.ctx.emit(PipelineEvent::PhaseFinished {
            phase,
            records,
            elapsed: started.elapsed(),
        });
    }

    async fn fail(&self, phase: Phase, error: &PipelineError) {
        self.write(phase, PhaseStatus::Failed, 0, Some(error.to_string()))
            .await;
        self.ctx.emit(PipelineEvent::PhaseFailed {
            phase,
            error: error.to_string(),
        });
    }
}

fn as_records(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

pub struct KnowledgeBaseGenerator {
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    settings: PipelineSettings,
}

impl KnowledgeBaseGenerator {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        settings: PipelineSettings,
    ) -> Self {
        KnowledgeBaseGenerator {
            source,
            target,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute one full run under `ctx`.
    pub async fn run(&self, ctx: &PipelineContext) -> Result<RunSummary, RunFailure> {
        let span = tracing::info_span!(
            "kb_run",
            execution_id = %ctx.execution_id,
            resolution = self.settings.resolution,
            days_back = self.settings.days_back,
        );
        self.run_logged(ctx).instrument(span).await
    }

    async fn run_logged(&self, ctx: &PipelineContext) -> Result<RunSummary, RunFailure> {
        // ---
        let started = Instant::now();
        let (start, end) = self.settings.window(ctx.now);
        tracing::info!("Knowledge base run over [{}, {})", start, end);

        let log = ExecutionLog {
            ctx,
            target: self.target.as_ref(),
            started_at: Utc::now(),
        };
        let mut counts = RunCounts::default();
        let mut current = Phase::Migrate;

        match self.execute(ctx, &log, &mut counts, &mut current).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!("Knowledge base generated in {:?}", elapsed);
                Ok(RunSummary {
                    execution_id: ctx.execution_id,
                    status: "success",
                    elapsed_ms: millis(elapsed),
                    cell_resolution: self.settings.resolution,
                    days_back: self.settings.days_back,
                    start,
                    end,
                    counts,
                })
            }
            Err(error) => {
                log.fail(current, &error).await;
                Err(RunFailure {
                    execution_id: ctx.execution_id,
                    phase: current,
                    elapsed: started.elapsed(),
                    error,
                    counts,
                })
            }
        }
    }

    async fn execute(
        &self,
        ctx: &PipelineContext,
        log: &ExecutionLog<'_>,
        counts: &mut RunCounts,
        current: &mut Phase,
    ) -> Result<(), PipelineError> {
        // ---
        let settings = &self.settings;
        let source = self.source.as_ref();
        let target = self.target.as_ref();
        let (start, end) = settings.window(ctx.now);
        let grid = Grid::new(settings.area, settings.resolution);

        *current = Phase::Migrate;
        let t = log.start(Phase::Migrate).await;
        let outcome = ctx.call(Phase::Migrate, target.migrate()).await?;
        tracing::info!("Schema migration: {:?}", outcome);
        log.finish(Phase::Migrate, 0, t).await;

        *current = Phase::Normalize;
        let t = log.start(Phase::Normalize).await;
        counts.normalize = normalize::run(
            ctx,
            source,
            target,
            settings.area.bounds,
            start.date_naive(),
            end.date_naive(),
            settings.batch_size,
        )
        .await?;
        log.finish(Phase::Normalize, as_records(counts.normalize.written), t)
            .await;

        *current = Phase::Grid;
        let t = log.start(Phase::Grid).await;
        counts.grid = grid::generate(ctx, target, &grid, settings.batch_size).await?;
        log.finish(Phase::Grid, as_records(counts.grid.cells), t).await;

        *current = Phase::AssignCells;
        let t = log.start(Phase::AssignCells).await;
        counts.assign = assign::run(ctx, source, target, &grid, settings.batch_size).await?;
        log.finish(Phase::AssignCells, as_records(counts.assign.assigned), t)
            .await;

        *current = Phase::Features;
        let t = log.start(Phase::Features).await;
        let cells = ctx
            .call(Phase::Features, target.cells(settings.resolution))
            .await?;
        counts.features = features::generate(
            ctx,
            target,
            &cells,
            settings.resolution,
            start,
            end,
            settings.batch_size,
        )
        .await?;
        log.finish(Phase::Features, as_records(counts.features.rows_written), t)
            .await;

        *current = Phase::Validate;
        let t = log.start(Phase::Validate).await;
        let metrics = quality::validate(ctx, target, settings.resolution).await?;
        counts.quality = Some(metrics.clone());
        quality::enforce(&metrics, &settings.thresholds)?;
        log.finish(Phase::Validate, metrics.total_incidents, t).await;

        *current = Phase::Complete;
        let total = as_records(
            counts.normalize.written
                + counts.assign.assigned
                + counts.features.rows_written,
        );
        log.write(Phase::Complete, PhaseStatus::Success, total, None)
            .await;
        Ok(())
    }
}
