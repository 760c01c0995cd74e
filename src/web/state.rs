use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::ConfigStore;
use crate::engine::{JobQueue, PipelineStats, StatsSnapshot};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub jobs: JobQueue,
    pub stats: Arc<PipelineStats>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>, jobs: JobQueue) -> Self {
        let stats = jobs.stats();
        Self {
            config,
            jobs,
            stats,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub jobs: StatsSnapshot,
    pub pending: usize,
    pub strategy: String,
    pub endpoints: usize,
}
