use crate::catalog::MetricCatalog;
use crate::liveness::LivenessTracker;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct ExporterState {
    pub catalog: MetricCatalog,
    pub liveness: LivenessTracker,
}

pub type SharedState = Arc<Mutex<ExporterState>>;

pub fn shared() -> SharedState {
    Arc::new(Mutex::new(ExporterState::default()))
}
