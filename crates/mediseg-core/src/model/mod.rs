//! Model lifecycle management
//!
//! Owns the single predictor instance and its accelerator memory. Every
//! operation that touches the network goes through one exclusive lock,
//! so concurrent pipeline runs serialize here and queued callers are
//! served in FIFO order. After a configurable number of invocations the
//! predictor is torn down and rebuilt to reclaim drifting accelerator
//! memory.

pub mod predictor;

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ndarray::Array4;
use serde::Serialize;
use tokio::sync::Mutex;

pub use predictor::{
    AcceleratorMemory, Device, DevicePreference, Predictor, PredictorFactory, select_device,
};

#[cfg(feature = "onnx")]
pub use predictor::OnnxPredictorFactory;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Model error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// No predictor is loaded
    #[error("Model is not loaded")]
    NotLoaded,
    /// Model file is missing
    #[error("Model file not found: {0}")]
    NotFound(String),
    /// Predictor construction failed
    #[error("Model load failed: {0}")]
    LoadFailed(String),
    /// Input channel count does not match the network contract
    #[error("Input tensor has {got} channel(s), expected {expected}")]
    ShapeMismatch { got: usize, expected: usize },
    /// Forward pass failed after the automatic retry
    #[error("Inference failed: {0}")]
    InferenceFailed(String),
    /// Too many callers queued on the model
    #[error("Model queue is full ({waiting} waiting, depth {depth})")]
    Overloaded { waiting: usize, depth: usize },
}

/// Model result type
pub type Result<T> = std::result::Result<T, ModelError>;

// ============================================================================
// CONFIGURATION & INTROSPECTION
// ============================================================================

/// Model manager tunables.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Path of the serialized network, reported through `info`
    pub model_path: PathBuf,
    /// Expected input channel count
    pub input_channels: usize,
    /// Output class count (background included)
    pub num_classes: usize,
    /// Successful invocations before a preventive teardown + reload
    pub reload_threshold: u32,
    /// Maximum callers queued on the model before `Overloaded`
    pub max_queue_depth: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/segmentation.onnx"),
            input_channels: 4,
            num_classes: 5,
            reload_threshold: 5,
            max_queue_depth: 8,
        }
    }
}

/// Lifecycle state of the managed predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Running,
    Unloading,
    Reloading,
}

/// Introspection snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub state: ModelState,
    pub device: Device,
    pub model_path: String,
    pub input_channels: usize,
    pub num_classes: usize,
    pub invocation_count: u64,
    pub reload_threshold: u32,
    pub parameter_count: Option<u64>,
}

/// Memory snapshot for the memory-usage endpoint. Accelerator figures
/// are present only when the backend can report them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub device: Device,
    pub loaded: bool,
    pub invocation_count: u64,
    pub reload_threshold: u32,
    pub accelerator: Option<AcceleratorMemory>,
}

// ============================================================================
// MANAGER
// ============================================================================

struct Inner {
    predictor: Option<Box<dyn Predictor>>,
    /// Successful invocations since the last (re)load
    since_reload: u32,
}

/// Exclusive owner of the segmentation network.
pub struct ModelManager {
    config: ModelConfig,
    device: Device,
    factory: Box<dyn PredictorFactory>,
    inner: Mutex<Inner>,
    state: StdMutex<ModelState>,
    /// Callers currently holding or queued on the inner lock
    waiting: AtomicUsize,
    /// Successful invocations over the manager lifetime
    invocations: AtomicU64,
}

impl ModelManager {
    /// Create a manager around a predictor factory. The device decision
    /// happens here, once per process.
    pub fn new(
        config: ModelConfig,
        preference: DevicePreference,
        factory: Box<dyn PredictorFactory>,
    ) -> Self {
        let device = select_device(preference);
        tracing::info!(%device, model = %config.model_path.display(), "model manager created");
        Self {
            config,
            device,
            factory,
            inner: Mutex::new(Inner {
                predictor: None,
                since_reload: 0,
            }),
            state: StdMutex::new(ModelState::Unloaded),
            waiting: AtomicUsize::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ModelState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != state {
            tracing::debug!(from = ?*guard, to = ?state, "model state transition");
            *guard = state;
        }
    }

    /// Total successful invocations since construction.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Idempotent: brings the manager to `Ready`.
    pub async fn ensure_loaded(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.predictor.is_some() {
            self.set_state(ModelState::Ready);
            return Ok(());
        }
        self.load_locked(&mut inner)
    }

    fn load_locked(&self, inner: &mut Inner) -> Result<()> {
        self.set_state(ModelState::Loading);
        match self.factory.load(self.device) {
            Ok(predictor) => {
                inner.predictor = Some(predictor);
                inner.since_reload = 0;
                self.set_state(ModelState::Ready);
                tracing::info!(device = %self.device, "model loaded");
                Ok(())
            }
            Err(e) => {
                // nothing partial may survive a failed load
                inner.predictor = None;
                self.set_state(ModelState::Unloaded);
                tracing::error!(error = %e, "model load failed");
                Err(e)
            }
        }
    }

    fn unload_locked(&self, inner: &mut Inner) {
        self.set_state(ModelState::Unloading);
        inner.predictor = None;
        inner.since_reload = 0;
        self.set_state(ModelState::Unloaded);
    }

    /// Drop the predictor and release its memory.
    pub async fn unload(&self) {
        let mut inner = self.inner.lock().await;
        self.unload_locked(&mut inner);
        tracing::info!("model unloaded");
    }

    /// Like `unload`, but safe to call in any state and silent about
    /// problems. Used on error paths and at shutdown.
    pub async fn force_cleanup(&self) {
        let mut inner = self.inner.lock().await;
        inner.predictor = None;
        inner.since_reload = 0;
        self.set_state(ModelState::Unloaded);
    }

    /// Run a forward pass, loading or preventively reloading first when
    /// needed. Queued callers are admitted in FIFO order; the queue is
    /// bounded by `max_queue_depth`.
    pub async fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let depth = self.config.max_queue_depth;
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(waiting, depth, "model queue overflow");
            return Err(ModelError::Overloaded { waiting, depth });
        }

        // tokio's mutex queues waiters fairly, which gives the FIFO
        // completion order the pipeline promises
        let mut inner = self.inner.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let got = input.dim().0;
        if got != self.config.input_channels {
            return Err(ModelError::ShapeMismatch {
                got,
                expected: self.config.input_channels,
            });
        }

        if inner.predictor.is_some() && inner.since_reload >= self.config.reload_threshold {
            tracing::info!(
                invocations = inner.since_reload,
                threshold = self.config.reload_threshold,
                "preventive model reload"
            );
            self.set_state(ModelState::Reloading);
            self.unload_locked(&mut inner);
            self.load_locked(&mut inner)?;
        }
        if inner.predictor.is_none() {
            self.load_locked(&mut inner)?;
        }

        match self.run_locked(&mut inner, input) {
            Ok(output) => Ok(output),
            Err(first) => {
                // transient accelerator failures get one clean retry
                tracing::warn!(error = %first, "predict failed, retrying after cleanup");
                inner.predictor = None;
                inner.since_reload = 0;
                self.load_locked(&mut inner)?;
                match self.run_locked(&mut inner, input) {
                    Ok(output) => Ok(output),
                    Err(second) => {
                        inner.predictor = None;
                        self.set_state(ModelState::Unloaded);
                        Err(ModelError::InferenceFailed(second.to_string()))
                    }
                }
            }
        }
    }

    fn run_locked(&self, inner: &mut Inner, input: &Array4<f32>) -> Result<Array4<f32>> {
        let predictor = inner.predictor.as_mut().ok_or(ModelError::NotLoaded)?;
        self.set_state(ModelState::Running);
        let started = std::time::Instant::now();
        let result = tokio::task::block_in_place(|| predictor.predict(input));
        match result {
            Ok(output) => {
                self.set_state(ModelState::Ready);
                inner.since_reload += 1;
                self.invocations.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    invocation = self.invocations.load(Ordering::Relaxed),
                    "inference complete"
                );
                Ok(output)
            }
            Err(e) => {
                self.set_state(ModelState::Ready);
                Err(e)
            }
        }
    }

    /// Memory snapshot. Never waits behind a running predict: when the
    /// model is busy the snapshot carries counters only.
    pub fn memory_usage(&self) -> MemoryUsage {
        let (loaded, accelerator) = match self.inner.try_lock() {
            Ok(inner) => (
                inner.predictor.is_some(),
                inner.predictor.as_ref().and_then(|p| p.memory_usage()),
            ),
            Err(_) => (true, None),
        };
        MemoryUsage {
            device: self.device,
            loaded,
            invocation_count: self.invocation_count(),
            reload_threshold: self.config.reload_threshold,
            accelerator,
        }
    }

    /// Introspection snapshot.
    pub fn info(&self) -> ModelInfo {
        let parameter_count = self
            .inner
            .try_lock()
            .ok()
            .and_then(|inner| inner.predictor.as_ref().and_then(|p| p.parameter_count()));
        ModelInfo {
            state: self.state(),
            device: self.device,
            model_path: self.config.model_path.display().to_string(),
            input_channels: self.config.input_channels,
            num_classes: self.config.num_classes,
            invocation_count: self.invocation_count(),
            reload_threshold: self.config.reload_threshold,
            parameter_count,
        }
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        // best-effort cleanup without an executor
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.predictor = None;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    /// Deterministic stand-in network: class = voxel parity of channel 0.
    pub(crate) struct FakePredictor {
        channels: usize,
        classes: usize,
        fail_next: Arc<AtomicU32>,
    }

    impl Predictor for FakePredictor {
        fn input_channels(&self) -> usize {
            self.channels
        }

        fn num_classes(&self) -> usize {
            self.classes
        }

        fn parameter_count(&self) -> Option<u64> {
            Some(1_000)
        }

        fn predict(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(ModelError::InferenceFailed("injected failure".into()));
            }
            let (_, nx, ny, nz) = input.dim();
            let mut out = Array4::<f32>::zeros((self.classes, nx, ny, nz));
            for x in 0..nx {
                for y in 0..ny {
                    for z in 0..nz {
                        let class = if input[[0, x, y, z]] > 0.5 { 1 } else { 0 };
                        out[[class, x, y, z]] = 5.0;
                    }
                }
            }
            Ok(out)
        }
    }

    /// Factory that counts loads and can inject failures.
    pub(crate) struct FakeFactory {
        pub loads: Arc<AtomicU32>,
        pub fail_next_predicts: Arc<AtomicU32>,
        pub fail_loads: Arc<AtomicU32>,
    }

    impl FakeFactory {
        pub(crate) fn new() -> Self {
            Self {
                loads: Arc::new(AtomicU32::new(0)),
                fail_next_predicts: Arc::new(AtomicU32::new(0)),
                fail_loads: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl PredictorFactory for FakeFactory {
        fn load(&self, _device: Device) -> Result<Box<dyn Predictor>> {
            if self.fail_loads.load(Ordering::SeqCst) > 0 {
                self.fail_loads.fetch_sub(1, Ordering::SeqCst);
                return Err(ModelError::LoadFailed("injected load failure".into()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePredictor {
                channels: 4,
                classes: 5,
                fail_next: self.fail_next_predicts.clone(),
            }))
        }
    }

    fn manager_with(factory: FakeFactory, config: ModelConfig) -> ModelManager {
        ModelManager::new(config, DevicePreference::Cpu, Box::new(factory))
    }

    fn small_config() -> ModelConfig {
        ModelConfig {
            reload_threshold: 3,
            max_queue_depth: 2,
            ..ModelConfig::default()
        }
    }

    fn input() -> Array4<f32> {
        Array4::from_elem((4, 4, 4, 4), 1.0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ensure_loaded_is_idempotent() {
        let factory = FakeFactory::new();
        let loads = factory.loads.clone();
        let manager = manager_with(factory, small_config());

        assert_eq!(manager.state(), ModelState::Unloaded);
        manager.ensure_loaded().await.unwrap();
        manager.ensure_loaded().await.unwrap();
        assert_eq!(manager.state(), ModelState::Ready);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn predict_loads_lazily_and_counts() {
        let factory = FakeFactory::new();
        let manager = manager_with(factory, small_config());

        let output = manager.predict(&input()).await.unwrap();
        assert_eq!(output.dim(), (5, 4, 4, 4));
        assert_eq!(manager.invocation_count(), 1);
        assert_eq!(manager.state(), ModelState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channel_mismatch_is_rejected() {
        let factory = FakeFactory::new();
        let manager = manager_with(factory, small_config());

        let bad = Array4::<f32>::zeros((3, 4, 4, 4));
        let err = manager.predict(&bad).await.unwrap_err();
        assert!(matches!(
            err,
            ModelError::ShapeMismatch { got: 3, expected: 4 }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preventive_reload_after_threshold() {
        let factory = FakeFactory::new();
        let loads = factory.loads.clone();
        let manager = manager_with(factory, small_config());

        // threshold is 3: the 4th predict triggers a reload first
        for _ in 0..4 {
            manager.predict(&input()).await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(manager.invocation_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_failure_retries_once() {
        let factory = FakeFactory::new();
        let loads = factory.loads.clone();
        let failures = factory.fail_next_predicts.clone();
        let manager = manager_with(factory, small_config());

        failures.store(1, Ordering::SeqCst);
        let output = manager.predict(&input()).await.unwrap();
        assert_eq!(output.dim(), (5, 4, 4, 4));
        // initial load plus the cleanup reload
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_failure_surfaces_inference_failed() {
        let factory = FakeFactory::new();
        let failures = factory.fail_next_predicts.clone();
        let manager = manager_with(factory, small_config());

        failures.store(2, Ordering::SeqCst);
        let err = manager.predict(&input()).await.unwrap_err();
        assert!(matches!(err, ModelError::InferenceFailed(_)));
        assert_eq!(manager.state(), ModelState::Unloaded);

        // the next call recovers
        manager.predict(&input()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_load_keeps_unloaded_state() {
        let factory = FakeFactory::new();
        let fail_loads = factory.fail_loads.clone();
        let manager = manager_with(factory, small_config());

        fail_loads.store(1, Ordering::SeqCst);
        assert!(manager.ensure_loaded().await.is_err());
        assert_eq!(manager.state(), ModelState::Unloaded);

        manager.ensure_loaded().await.unwrap();
        assert_eq!(manager.state(), ModelState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unload_resets_and_next_predict_reloads() {
        let factory = FakeFactory::new();
        let loads = factory.loads.clone();
        let manager = manager_with(factory, small_config());

        manager.predict(&input()).await.unwrap();
        manager.unload().await;
        assert_eq!(manager.state(), ModelState::Unloaded);
        assert!(!manager.memory_usage().loaded);

        manager.predict(&input()).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn force_cleanup_is_idempotent() {
        let factory = FakeFactory::new();
        let manager = manager_with(factory, small_config());

        manager.force_cleanup().await;
        manager.force_cleanup().await;
        assert_eq!(manager.state(), ModelState::Unloaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queue_overflow_is_rejected() {
        let factory = FakeFactory::new();
        let manager = Arc::new(manager_with(factory, small_config()));

        // saturate the queue by holding the inner lock
        let guard = manager.inner.lock().await;
        let m1 = manager.clone();
        let h1 = tokio::spawn(async move { m1.predict(&input()).await });
        let m2 = manager.clone();
        let h2 = tokio::spawn(async move { m2.predict(&input()).await });
        // wait for both waiters to enqueue
        while manager.waiting.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let err = manager.predict(&input()).await.unwrap_err();
        assert!(matches!(err, ModelError::Overloaded { .. }));

        drop(guard);
        assert!(h1.await.unwrap().is_ok());
        assert!(h2.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn info_reports_counts_and_device() {
        let factory = FakeFactory::new();
        let manager = manager_with(factory, small_config());
        manager.predict(&input()).await.unwrap();

        let info = manager.info();
        assert_eq!(info.device, Device::Cpu);
        assert_eq!(info.invocation_count, 1);
        assert_eq!(info.state, ModelState::Ready);
        assert_eq!(info.parameter_count, Some(1_000));
    }
}
