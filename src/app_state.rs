use std::sync::Arc;

use crate::pipeline::Pipeline;
use crate::services::{
    queue::TaskQueue, releases::ReleaseService, status::StatusService, storage::BlobStore,
};
use crate::store::ReleaseStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReleaseStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub releases: Arc<ReleaseService>,
    pub status: Arc<StatusService>,
    /// `None` disables build administration.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: &Pipeline, admin_token: Option<String>) -> Self {
        Self {
            store: pipeline.store.clone(),
            blobs: pipeline.blobs.clone(),
            queue: pipeline.queue.clone(),
            releases: pipeline.releases.clone(),
            status: pipeline.status.clone(),
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}
