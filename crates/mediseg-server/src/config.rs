//! Environment-driven configuration
//!
//! Every tunable of the service is an environment variable with a
//! sensible default, so a bare `mediseg-server` starts a working local
//! instance and deployments only override what they need.

use std::path::PathBuf;
use std::time::Duration;

use mediseg_core::DevicePreference;

/// Default maximum upload size: 500 MB.
const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Default whole-pipeline timeout: 5 minutes.
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 300;

/// Default task record time-to-live: 24 hours.
const DEFAULT_TASK_TTL_SECS: u64 = 24 * 3600;

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Ingested studies
    pub upload_dir: PathBuf,
    /// Cached results, one folder per study
    pub results_dir: PathBuf,
    /// Preprocessed tensor blobs
    pub temp_dir: PathBuf,
    /// Rolled log files
    pub log_dir: PathBuf,
    /// Maximum accepted upload size in bytes
    pub max_file_size: u64,
    /// Serialized network weights
    pub model_path: PathBuf,
    /// Accelerator preference
    pub model_device: DevicePreference,
    /// Refuse to start when the model file is missing
    pub model_required: bool,
    /// Name of the graph input tensor
    pub model_input_name: String,
    /// Allowed CORS origins; empty list means any origin
    pub cors_origins: Vec<String>,
    /// Bound on one pipeline run
    pub inference_timeout: Duration,
    /// Predict invocations before a preventive model reload
    pub reload_threshold: u32,
    /// Maximum callers queued on the model
    pub max_queue_depth: usize,
    /// Time-to-live of finished task records
    pub task_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            upload_dir: PathBuf::from("uploads"),
            results_dir: PathBuf::from("results"),
            temp_dir: PathBuf::from("temp/preprocess"),
            log_dir: PathBuf::from("logs"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            model_path: PathBuf::from("models/segmentation.onnx"),
            model_device: DevicePreference::Auto,
            model_required: false,
            model_input_name: "input".to_string(),
            cors_origins: Vec::new(),
            inference_timeout: Duration::from_secs(DEFAULT_INFERENCE_TIMEOUT_SECS),
            reload_threshold: 5,
            max_queue_depth: 8,
            task_ttl: Duration::from_secs(DEFAULT_TASK_TTL_SECS),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable environment value, using default");
                None
            }
        },
        None => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

impl Settings {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            host: env_string("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT").unwrap_or(defaults.port),
            upload_dir: env_string("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            results_dir: env_string("RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            temp_dir: env_string("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            log_dir: env_string("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            max_file_size: env_parse("MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
            model_path: env_string("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            model_device: env_parse("MODEL_DEVICE").unwrap_or(defaults.model_device),
            model_required: env_bool("MODEL_REQUIRED").unwrap_or(defaults.model_required),
            model_input_name: env_string("MODEL_INPUT_NAME")
                .unwrap_or(defaults.model_input_name),
            cors_origins: env_string("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            inference_timeout: env_parse("INFERENCE_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.inference_timeout),
            reload_threshold: env_parse("RELOAD_THRESHOLD").unwrap_or(defaults.reload_threshold),
            max_queue_depth: env_parse("MAX_QUEUE_DEPTH").unwrap_or(defaults.max_queue_depth),
            task_ttl: env_parse("TASK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_ttl),
        }
    }

    /// Create the working directories the service relies on.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            &self.upload_dir,
            &self.results_dir,
            &self.temp_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Whether the configured model file exists on disk.
    pub fn model_available(&self) -> bool {
        self.model_path.is_file()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_service_contract() {
        let settings = Settings::default();
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.max_file_size, 500 * 1024 * 1024);
        assert_eq!(settings.inference_timeout, Duration::from_secs(300));
        assert_eq!(settings.reload_threshold, 5);
        assert!(!settings.model_required);
    }

    #[test]
    fn ensure_directories_creates_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings {
            upload_dir: root.path().join("uploads"),
            results_dir: root.path().join("results"),
            temp_dir: root.path().join("temp/preprocess"),
            log_dir: root.path().join("logs"),
            ..Settings::default()
        };
        settings.ensure_directories().unwrap();
        assert!(settings.upload_dir.is_dir());
        assert!(settings.temp_dir.is_dir());
    }
}
