//! End-to-end separation tests
//!
//! Tiny randomly initialised checkpoints are written to disk, loaded
//! through `ModelLoader` and run through the full `Separator` path:
//! - Output shape and finiteness, for v4 and v3 checkpoints
//! - Determinism across runs and worker counts
//! - Loader rejection of broken checkpoints
//! - Progress reporting and cancellation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sf_ml::separation::{SeparationConfig, Separator, SourceSeparator, StemType};
use sf_ml::{HDemucsConfig, HTDemucsConfig, MlError, ModelLoader, NativeConfig, WeightStore};

const SAMPLE_RATE: u32 = 8000;

fn write_tiny(dir: &Path, name: &str, seed: u64) -> PathBuf {
    let config = HTDemucsConfig::tiny();
    let path = dir.join(format!("{name}.safetensors"));
    config.random_weights(seed).save(&path).unwrap();
    std::fs::write(dir.join(format!("{name}.json")), serde_json::to_string(&config).unwrap()).unwrap();
    path
}

/// Interleaved stereo: two detuned tones plus a click train
fn test_mix(frames: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let t = i as f32 / SAMPLE_RATE as f32;
        let tone = 0.3 * (2.0 * std::f32::consts::PI * 330.0 * t).sin();
        let low = 0.2 * (2.0 * std::f32::consts::PI * 82.0 * t).sin();
        let click = if i % 400 == 0 { 0.5 } else { 0.0 };
        out.push(tone + low + click);
        out.push(0.8 * tone + low);
    }
    out
}

#[test]
fn test_separate_tiny_model() {
    let dir = tempfile::tempdir().unwrap();
    let model = ModelLoader::load(write_tiny(dir.path(), "tiny", 11)).unwrap();
    let separator = Separator::new(model, SeparationConfig::default().with_shifts(0)).unwrap();

    // longer than one 0.5s segment so the overlap-add path runs
    let frames = 10_000;
    let stems = separator.separate(&test_mix(frames), 2, SAMPLE_RATE).unwrap();

    assert_eq!(stems.len(), 4);
    for stem_type in StemType::standard_4() {
        let stem = stems.get(stem_type).unwrap();
        assert_eq!(stem.channels, 2);
        assert_eq!(stem.audio.len(), frames * 2);
        assert!(stem.audio.iter().all(|v| v.is_finite()), "{stem_type:?}");
    }
    assert!(stems.stats.segments_processed >= 3);
}

#[test]
fn test_separate_tiny_v3_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = HDemucsConfig::tiny();
    let path = dir.path().join("tiny_v3.safetensors");
    config.random_weights(12).save(&path).unwrap();
    std::fs::write(
        dir.path().join("tiny_v3.json"),
        serde_json::to_string(&NativeConfig::HDemucs(config)).unwrap(),
    )
    .unwrap();

    let model = ModelLoader::load(&path).unwrap();
    let separator = Separator::new(model, SeparationConfig::default().with_shifts(0)).unwrap();
    let frames = 9_000;
    let stems = separator.separate(&test_mix(frames), 2, SAMPLE_RATE).unwrap();

    assert_eq!(stems.len(), 4);
    for stem_type in StemType::standard_4() {
        let stem = stems.get(stem_type).unwrap();
        assert_eq!(stem.audio.len(), frames * 2);
        assert!(stem.audio.iter().all(|v| v.is_finite()), "{stem_type:?}");
    }
}

#[test]
fn test_separation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tiny(dir.path(), "tiny", 5);
    let audio = test_mix(6000);

    let run = |workers: usize| {
        let model = ModelLoader::load(&path).unwrap();
        let config = SeparationConfig::default().with_shifts(2).with_seed(42).with_workers(workers);
        Separator::new(model, config).unwrap().separate(&audio, 2, SAMPLE_RATE).unwrap()
    };

    let a = run(1);
    let b = run(4);
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.stem_type, y.stem_type);
        for (p, q) in x.audio.iter().zip(&y.audio) {
            assert!((p - q).abs() < 1e-5);
        }
    }
}

#[test]
fn test_rejects_mis_shaped_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = HTDemucsConfig::tiny();
    let store = config.random_weights(1);

    // replace one tensor with a wrong shape
    let mut tensors = Vec::new();
    for name in store.names() {
        let mut shape = store.shape(name).unwrap().to_vec();
        let mut data = store.tensor(name, &shape).unwrap().into_raw_vec_and_offset().0;
        if name == "tencoder.0.conv.bias" {
            shape[0] += 1;
            data.push(0.0);
        }
        tensors.push((name.to_string(), shape, data));
    }
    let path = dir.path().join("broken.safetensors");
    WeightStore::from_tensors(tensors).unwrap().save(&path).unwrap();
    std::fs::write(dir.path().join("broken.json"), serde_json::to_string(&config).unwrap()).unwrap();

    assert!(matches!(ModelLoader::load(&path), Err(MlError::ShapeMismatch { .. })));
}

#[test]
fn test_progress_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tiny(dir.path(), "tiny", 3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let separator = Separator::new(ModelLoader::load(&path).unwrap(), SeparationConfig::fast().with_workers(1))
        .unwrap()
        .with_progress(Arc::new(move |p: f32| sink.lock().unwrap().push(p)));
    separator.separate(&test_mix(9000), 2, SAMPLE_RATE).unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(1.0));

    let cancel = Arc::new(AtomicBool::new(true));
    let cancelled = Separator::new(ModelLoader::load(&path).unwrap(), SeparationConfig::fast())
        .unwrap()
        .with_cancel_flag(Arc::clone(&cancel));
    assert!(matches!(
        cancelled.separate(&test_mix(9000), 2, SAMPLE_RATE),
        Err(MlError::Cancelled)
    ));
    assert!(cancel.load(Ordering::Relaxed));
}
