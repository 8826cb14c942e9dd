use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;

use crate::{Config, SourceStore, TargetStore};

mod health;
mod knowledge_base;

// ---

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn SourceStore>,
    pub target: Arc<dyn TargetStore>,
    pub config: Config,
    /// Held for the whole duration of a run; one run per process.
    pub run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(source: Arc<dyn SourceStore>, target: Arc<dyn TargetStore>, config: Config) -> Self {
        AppState {
            source,
            target,
            config,
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(knowledge_base::router())
        .merge(health::router())
        .with_state(state)
}
