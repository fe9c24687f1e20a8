//! MediSeg HTTP service
//!
//! Axum front-end over the `mediseg-core` inference engine: file
//! ingest, preprocessing, the full segmentation pipeline, the result
//! cache, model administration, health probes, and a background task
//! registry for long-running runs.

pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod tasks;

pub use config::Settings;
pub use state::AppState;
pub use tasks::{TaskRecord, TaskRegistry, TaskStatus};
