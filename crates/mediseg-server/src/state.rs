//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use mediseg_core::{InferenceCoordinator, Ingestor};

use crate::config::Settings;
use crate::tasks::TaskRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub coordinator: Arc<InferenceCoordinator>,
    pub ingestor: Arc<Ingestor>,
    pub tasks: Arc<TaskRegistry>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        coordinator: Arc<InferenceCoordinator>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let ingestor = Arc::new(Ingestor::new(
            settings.upload_dir.clone(),
            settings.max_file_size,
        ));
        Self {
            settings,
            coordinator,
            ingestor,
            tasks,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the service came up.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
