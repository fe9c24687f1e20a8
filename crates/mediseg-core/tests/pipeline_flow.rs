//! End-to-end engine test: ingest an archive, resolve modalities, run
//! the full pipeline with a deterministic predictor, and exercise the
//! cache lifecycle.

use std::io::Write;
use std::sync::Arc;

use ndarray::{Array3, Array4};
use tokio_util::sync::CancellationToken;

use mediseg_core::model::{DevicePreference, Predictor, PredictorFactory};
use mediseg_core::pipeline::{PipelineConfig, RunOptions};
use mediseg_core::preprocess::PreprocessConfig;
use mediseg_core::{
    Artifact, InferenceCoordinator, IngestOutcome, Ingestor, ModelConfig, ModelManager,
    ResultCache, modality, volume,
};

// ============================================================================
// DETERMINISTIC PREDICTOR
// ============================================================================

/// Marks every voxel whose channel-0 intensity clears a threshold as
/// class 3, in a blob large enough to survive postprocessing.
struct ThresholdPredictor;

impl Predictor for ThresholdPredictor {
    fn input_channels(&self) -> usize {
        4
    }

    fn num_classes(&self) -> usize {
        5
    }

    fn predict(
        &mut self,
        input: &Array4<f32>,
    ) -> mediseg_core::model::Result<Array4<f32>> {
        let (_, nx, ny, nz) = input.dim();
        let mut out = Array4::<f32>::zeros((5, nx, ny, nz));
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    let class = if input[[0, x, y, z]] > 0.2 { 3 } else { 0 };
                    out[[class, x, y, z]] = 8.0;
                }
            }
        }
        Ok(out)
    }
}

struct ThresholdFactory;

impl PredictorFactory for ThresholdFactory {
    fn load(
        &self,
        _device: mediseg_core::Device,
    ) -> mediseg_core::model::Result<Box<dyn Predictor>> {
        Ok(Box::new(ThresholdPredictor))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

fn study_volume() -> Array3<f32> {
    Array3::from_shape_fn((20, 20, 20), |(x, y, z)| {
        if (4..16).contains(&x) && (4..16).contains(&y) && (4..16).contains(&z) {
            1500.0
        } else {
            0.0
        }
    })
}

fn study_archive() -> Vec<u8> {
    let tmp = tempfile::tempdir().unwrap();
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(&mut buf);
    for name in ["t1n.nii.gz", "t1c.nii.gz", "t2w.nii.gz", "t2f.nii.gz"] {
        let path = tmp.path().join(name);
        volume::write_volume(&study_volume(), &path, None).unwrap();
        zip.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&std::fs::read(&path).unwrap()).unwrap();
    }
    zip.finish().unwrap();
    buf.into_inner()
}

fn coordinator(root: &std::path::Path) -> InferenceCoordinator {
    let config = PipelineConfig {
        upload_dir: root.join("uploads"),
        temp_dir: root.join("temp/preprocess"),
        preprocess: PreprocessConfig {
            img_size: [24, 24, 24],
            ..PreprocessConfig::default()
        },
        ..PipelineConfig::default()
    };
    let model = Arc::new(ModelManager::new(
        ModelConfig {
            reload_threshold: 2,
            ..ModelConfig::default()
        },
        DevicePreference::Cpu,
        Box::new(ThresholdFactory),
    ));
    let cache = Arc::new(ResultCache::new(root.join("results")));
    InferenceCoordinator::new(config, model, cache)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archive_to_segmentation_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path());

    // upload the study archive
    let ingestor = Ingestor::new(&coordinator.config().upload_dir, 100 << 20);
    let outcome = ingestor.ingest("BraTS-900.zip", &study_archive()).unwrap();
    let folder = match outcome {
        IngestOutcome::Archive {
            folder, validation, ..
        } => {
            assert!(validation.inference_eligible);
            folder
        }
        other => panic!("expected archive outcome, got {:?}", other),
    };
    assert_eq!(folder, "BraTS-900");

    // eligible studies listing sees it
    let eligible = modality::find_eligible(&coordinator.config().upload_dir);
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].name, "BraTS-900");

    // full pipeline
    let result = coordinator
        .run("BraTS-900", RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.ok && !result.cached);

    let stats = result.seg_stats.unwrap();
    assert!(
        stats.classes_present.contains(&3),
        "the bright core must segment as class 3: {:?}",
        stats
    );
    assert!(stats.total_segmented_voxels > 0);

    // the persisted segmentation honors the value and shape contract
    let seg_path = coordinator
        .stream_path("BraTS-900", Artifact::Segmentation)
        .unwrap();
    let seg = volume::read_volume(&seg_path).unwrap();
    assert_eq!(seg.data.shape(), &[24, 24, 24]);
    assert!(seg.data.iter().all(|&v| (0.0..=4.0).contains(&v)));

    // cache hit on the second run
    let again = coordinator
        .run("BraTS-900", RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(again.cached);

    // eviction empties the entry
    let report = coordinator.cache().evict("BraTS-900").await.unwrap();
    assert!(report.freed_bytes > 0);
    assert!(!coordinator.cache_probe("BraTS-900").has_segmentation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn preventive_reload_does_not_disturb_results() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path());

    let ingestor = Ingestor::new(&coordinator.config().upload_dir, 100 << 20);
    ingestor.ingest("s.zip", &study_archive()).unwrap();

    // reload threshold is 2: four forced runs cross it twice
    let mut voxels = Vec::new();
    for _ in 0..4 {
        let result = coordinator
            .run(
                "s",
                RunOptions {
                    force_reprocess: true,
                    ..RunOptions::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        voxels.push(result.seg_stats.unwrap().total_segmented_voxels);
    }
    assert_eq!(coordinator.model().invocation_count(), 4);
    assert!(voxels.windows(2).all(|w| w[0] == w[1]), "{:?}", voxels);
}
