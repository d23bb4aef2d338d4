use std::path::PathBuf;
use std::sync::Arc;

use crate::services::{
    descriptor::JobStore,
    pipeline::Pipeline,
    runner::JobRunner,
    storage::ContentStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub content: Arc<ContentStore>,
    pub jobs: Arc<JobStore>,
    pub runner: Arc<JobRunner>,
}

impl AppState {
    /// Wire the stores and runner around one storage root.
    pub fn new(data_dir: impl Into<PathBuf>, pipeline: Pipeline) -> Self {
        let data_dir = data_dir.into();
        let jobs = Arc::new(JobStore::new(data_dir.clone()));
        Self {
            content: Arc::new(ContentStore::new(data_dir)),
            runner: Arc::new(JobRunner::new(jobs.clone(), Arc::new(pipeline))),
            jobs,
        }
    }
}
