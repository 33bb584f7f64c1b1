use std::sync::Arc;

use relay_executor::RunQueue;
use relay_ranker::Ranker;
use relay_store::{ArtifactStore, RunStore};

mod error;
mod http;

pub use error::ApiError;
pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RunStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub queue: Arc<RunQueue>,
    pub ranker: Arc<Ranker>,
    pub completion_configured: bool,
}
