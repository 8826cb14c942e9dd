use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{EventSink, PipelineEvent, TracingSink};
use crate::error::{BatchWriteError, PipelineError, StoreError};
use crate::models::Phase;
use crate::store::{batch_rows, BatchWrite, TargetStore};

// ---

/// Per-run state handed to every phase.
///
/// Carries the execution id, the run clock, the cancellation signal raised
/// by the trigger's deadline and the structured event sink.
#[derive(Clone)]
pub struct PipelineContext {
    pub execution_id: Uuid,

    /// Run clock. Fixes the processing window and the confidence decay.
    pub now: DateTime<Utc>,

    pub cancel: CancellationToken,

    pub events: Arc<dyn EventSink>,
}

/// Rows written and rows lost to failed batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub written: u64,
    pub failed: u64,
}

impl PipelineContext {
    pub fn new(now: DateTime<Utc>, cancel: CancellationToken) -> Self {
        PipelineContext {
            execution_id: Uuid::new_v4(),
            now,
            cancel,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn emit(&self, event: PipelineEvent) {
        self.events.emit(self.execution_id, event);
    }

    /// Race a store operation against cancellation, keeping its error.
    pub async fn attempt<T, F>(&self, phase: Phase, op: F) -> Result<Result<T, StoreError>, PipelineError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        // ---
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled { phase }),
            result = op => Ok(result),
        }
    }

    /// Race a store operation against cancellation; any store error is
    /// terminal for `phase`.
    pub async fn call<T, F>(&self, phase: Phase, op: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        self.attempt(phase, op)
            .await?
            .map_err(|source| PipelineError::from_store(phase, source))
    }

    /// Write `rows` in batches sized to the store's parameter bound.
    ///
    /// A failed batch is reported and its rows counted as failed; the
    /// remaining batches still run. Connectivity loss and cancellation
    /// abort the phase.
    pub async fn write_batches<E: BatchWrite>(
        &self,
        phase: Phase,
        store: &dyn TargetStore,
        rows: &[E],
        requested: usize,
    ) -> Result<BatchTally, PipelineError> {
        // ---
        let mut tally = BatchTally::default();
        if rows.is_empty() {
            return Ok(tally);
        }
        let size = batch_rows::<E>(store, requested);

        for chunk in rows.chunks(size) {
            match self.attempt(phase, E::write(store, chunk)).await? {
                Ok(affected) => tally.written += affected,
                Err(source) if source.is_connectivity() => {
                    return Err(PipelineError::from_store(phase, source));
                }
                Err(source) => {
                    let err = BatchWriteError {
                        table: E::TABLE,
                        rows: chunk.len(),
                        source,
                    };
                    self.emit(PipelineEvent::BatchFailed {
                        phase,
                        table: err.table,
                        rows: err.rows,
                        error: err.to_string(),
                    });
                    tally.failed += chunk.len() as u64;
                }
            }
        }
        Ok(tally)
    }
}
