//! Background task registry
//!
//! The asynchronous form of the pipeline: a run is handed to the
//! registry, the caller gets a task id immediately, and clients poll
//! the record until it completes and download via the cache. Finished
//! records live until the client deletes them or the TTL sweeper
//! collects them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mediseg_core::{InferenceCoordinator, RunOptions};

/// Lifecycle of a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// One tracked background run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub study_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result_file: Option<String>,
    pub error: Option<String>,
    pub elapsed: Option<f64>,
}

impl TaskRecord {
    fn new(task_id: String, study_id: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            study_id,
            status: TaskStatus::Queued,
            progress: 0,
            message: "queued".to_string(),
            created_at: now,
            updated_at: now,
            result_file: None,
            error: None,
            elapsed: None,
        }
    }
}

/// Registry of background pipeline runs.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskRecord>>,
    ttl: Duration,
}

impl TaskRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Launch a pipeline run in the background and return its task id.
    pub async fn spawn_run(
        self: &Arc<Self>,
        coordinator: Arc<InferenceCoordinator>,
        study_id: String,
        options: RunOptions,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(
                task_id.clone(),
                TaskRecord::new(task_id.clone(), study_id.clone()),
            );
        }

        let registry = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move {
            registry
                .update(&id, |t| {
                    t.status = TaskStatus::Processing;
                    t.progress = 10;
                    t.message = "pipeline running".to_string();
                })
                .await;

            let started = std::time::Instant::now();
            let outcome = coordinator
                .run(&study_id, options, CancellationToken::new())
                .await;
            let elapsed = started.elapsed().as_secs_f64();

            match outcome {
                Ok(result) => {
                    registry
                        .update(&id, |t| {
                            t.status = TaskStatus::Completed;
                            t.progress = 100;
                            t.message = if result.cached {
                                "served from cache".to_string()
                            } else {
                                "pipeline complete".to_string()
                            };
                            t.result_file = result
                                .paths
                                .segmentation
                                .as_ref()
                                .map(|p| p.display().to_string());
                            t.elapsed = Some(elapsed);
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "background run failed");
                    registry
                        .update(&id, |t| {
                            t.status = TaskStatus::Failed;
                            t.message = "pipeline failed".to_string();
                            t.error = Some(e.to_string());
                            t.elapsed = Some(elapsed);
                        })
                        .await;
                }
            }
        });

        task_id
    }

    async fn update(&self, task_id: &str, apply: impl FnOnce(&mut TaskRecord)) {
        let mut tasks = self.tasks.lock().await;
        if let Some(record) = tasks.get_mut(task_id) {
            apply(record);
            record.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// All records, newest first.
    pub async fn list(&self) -> Vec<TaskRecord> {
        let tasks = self.tasks.lock().await;
        let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, task_id: &str) -> bool {
        self.tasks.lock().await.remove(task_id).is_some()
    }

    /// Drop finished records older than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24));
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, t| {
            !(matches!(t.status, TaskStatus::Completed | TaskStatus::Failed)
                && t.updated_at < cutoff)
        });
        before - tasks.len()
    }

    /// Periodic TTL sweeper, spawned once at startup.
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let interval = (registry.ttl / 4).max(Duration::from_secs(60));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = registry.sweep_expired().await;
                if removed > 0 {
                    tracing::info!(removed, "expired task records swept");
                }
            }
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
