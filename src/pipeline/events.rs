//! Structured pipeline events.
//!
//! Phases never log directly about their progress; they emit events and the
//! sink decides where they go. Production runs use [`TracingSink`].

use std::time::Duration;

use uuid::Uuid;

use crate::models::Phase;

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PhaseStarted {
        phase: Phase,
    },
    PhaseFinished {
        phase: Phase,
        records: i64,
        elapsed: Duration,
    },
    PhaseFailed {
        phase: Phase,
        error: String,
    },
    RecordSkipped {
        report_id: i64,
        reason: &'static str,
        detail: String,
    },
    BatchFailed {
        phase: Phase,
        table: &'static str,
        rows: usize,
        error: String,
    },
    /// The execution log could not be written; the run continues.
    LogWriteFailed {
        phase: Phase,
        error: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, execution_id: Uuid, event: PipelineEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, execution_id: Uuid, event: PipelineEvent) {
        // ---
        match event {
            PipelineEvent::PhaseStarted { phase } => {
                tracing::info!(%execution_id, %phase, "Phase started");
            }
            PipelineEvent::PhaseFinished {
                phase,
                records,
                elapsed,
            } => {
                tracing::info!(%execution_id, %phase, records, ?elapsed, "Phase finished");
            }
            PipelineEvent::PhaseFailed { phase, error } => {
                tracing::error!(%execution_id, %phase, %error, "Phase failed");
            }
            PipelineEvent::RecordSkipped {
                report_id,
                reason,
                detail,
            } => {
                tracing::debug!(%execution_id, report_id, reason, %detail, "Record skipped");
            }
            PipelineEvent::BatchFailed {
                phase,
                table,
                rows,
                error,
            } => {
                tracing::warn!(%execution_id, %phase, table, rows, %error, "Batch write failed");
            }
            PipelineEvent::LogWriteFailed { phase, error } => {
                tracing::warn!(%execution_id, %phase, %error, "Execution log write failed");
            }
        }
    }
}

/// Keeps every event for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
    on_phase_started: std::sync::Mutex<Option<(Phase, tokio_util::sync::CancellationToken)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Cancel `token` as soon as `phase` starts.
    pub fn cancel_when_started(&self, phase: Phase, token: tokio_util::sync::CancellationToken) {
        *self.on_phase_started.lock().unwrap() = Some((phase, token));
    }

    pub fn batch_failures(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::BatchFailed { .. }))
            .count()
    }

    pub fn started_phases(&self) -> Vec<Phase> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::PhaseStarted { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, _execution_id: Uuid, event: PipelineEvent) {
        // ---
        if let PipelineEvent::PhaseStarted { phase } = &event {
            if let Some((target, token)) = self.on_phase_started.lock().unwrap().as_ref() {
                if target == phase {
                    token.cancel();
                }
            }
        }
        self.events.lock().unwrap().push(event);
    }
}
