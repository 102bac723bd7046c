//! Checkpoint export, encoder import for linear evaluation, and resume.
//!
//! Layout of a checkpoint directory:
//!
//! ```text
//! <dir>/encoder.mpk   online tower weights (NamedMpkFileRecorder, full precision)
//! <dir>/pair.mpk      online tower, predictor and target tower
//! <dir>/meta.json     CheckpointMeta, including the queue state when there is one
//! ```
//!
//! Both loaders fail fast on the first missing required field, reject
//! metadata that disagrees with the caller's config, and compare the loaded
//! tensor shapes against a freshly built module. They never return a
//! partially initialized tower.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, QueueError};
use crate::model::encoder::EncoderArch;
use crate::model::mlp::MlpNorm;
use crate::model::momentum::{MomentumPair, MomentumPairConfig};
use crate::model::params::ParameterSet;
use crate::model::tower::{Tower, TowerConfig};
use crate::training::queue::{NegativeQueue, QueueState};

const WEIGHTS_STEM: &str = "encoder";
const WEIGHTS_FILE: &str = "encoder.mpk";
const PAIR_STEM: &str = "pair";
const PAIR_FILE: &str = "pair.mpk";
const META_FILE: &str = "meta.json";

/// Fields that must be present in `meta.json`, checked in this order.
const REQUIRED_FIELDS: [&str; 4] = ["embedding_dim", "encoder", "projection_layers", "step"];

/// Metadata saved alongside the encoder weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub embedding_dim: usize,
    pub encoder: EncoderArch,
    pub projection_layers: usize,
    #[serde(default)]
    pub mlp_hidden_dim: Option<usize>,
    #[serde(default)]
    pub mlp_norm: Option<MlpNorm>,
    #[serde(default)]
    pub prediction_layers: Option<usize>,
    /// Whether `pair.mpk` holds a separate EMA target.
    #[serde(default)]
    pub lagging: Option<bool>,
    pub step: usize,
    #[serde(default)]
    pub queue: Option<QueueState>,
}

/// An imported online tower with its metadata.
#[derive(Debug)]
pub struct ImportedEncoder<B: Backend> {
    pub tower: Tower<B>,
    pub meta: CheckpointMeta,
}

impl<B: Backend> ImportedEncoder<B> {
    /// Rebuild the saved negative queue, if one was exported.
    pub fn queue(&self, device: &B::Device) -> Result<Option<NegativeQueue<B>>, CheckpointError> {
        match &self.meta.queue {
            Some(state) => Ok(Some(NegativeQueue::from_state(state.clone(), device)?)),
            None => Ok(None),
        }
    }
}

/// Everything needed to continue training from a checkpoint.
#[derive(Debug)]
pub struct ResumedTraining<B: Backend> {
    /// Online tower, predictor and EMA target as they were saved.
    pub pair: MomentumPair<B>,
    /// The negative queue, if the run used one.
    pub queue: Option<NegativeQueue<B>>,
    /// Steps completed; pass to `ContrastiveLearner::set_step`.
    pub step: usize,
}

/// Write `pair` and its metadata to `dir`.
///
/// # Arguments
/// - `tower_config`: the config both towers of `pair` were built from
/// - `step`: momentum updates applied so far
/// - `queue`: the negative queue to persist for resuming, if any
///
/// # Returns
/// Path of the online-tower weights file, the input to [`import_encoder`].
pub fn export_checkpoint<B: Backend>(
    dir: &Path,
    pair: &MomentumPair<B>,
    tower_config: &TowerConfig,
    step: usize,
    queue: Option<&NegativeQueue<B>>,
) -> Result<PathBuf, CheckpointError> {
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

    let stem = dir.join(WEIGHTS_STEM);
    pair.online()
        .clone()
        .save_file(stem.clone(), &recorder)
        .map_err(|e| CheckpointError::Recorder {
            path: stem,
            message: e.to_string(),
        })?;

    let pair_stem = dir.join(PAIR_STEM);
    pair.clone()
        .save_file(pair_stem.clone(), &recorder)
        .map_err(|e| CheckpointError::Recorder {
            path: pair_stem,
            message: e.to_string(),
        })?;

    let queue = match queue {
        Some(q) => Some(
            q.state()
                .map_err(|e| QueueError::InvalidState(e.to_string()))?,
        ),
        None => None,
    };
    let meta = CheckpointMeta {
        embedding_dim: tower_config.embedding_dim,
        encoder: tower_config.encoder.clone(),
        projection_layers: tower_config.projection_layers,
        mlp_hidden_dim: Some(tower_config.mlp_hidden_dim),
        mlp_norm: Some(tower_config.mlp_norm),
        prediction_layers: Some(pair.prediction_layers()),
        lagging: Some(pair.target().is_some()),
        step,
        queue,
    };
    serde_json::to_writer(std::fs::File::create(dir.join(META_FILE))?, &meta)?;

    tracing::info!(dir = %dir.display(), step, "Checkpoint saved (encoder + pair + meta)");
    Ok(dir.join(WEIGHTS_FILE))
}

/// Load the encoder tower saved by [`export_checkpoint`] for downstream
/// evaluation.
///
/// # Errors
/// - [`CheckpointError::MissingField`] naming the first absent metadata
///   field, or `"encoder weights"` when `encoder.mpk` is absent
/// - [`CheckpointError::DimensionMismatch`] / [`CheckpointError::EncoderMismatch`]
///   when the metadata disagrees with `expected`
/// - [`CheckpointError::StructureMismatch`] when the stored tensors do not
///   have the shapes `expected` builds
pub fn import_encoder<B: Backend>(
    dir: &Path,
    expected: &TowerConfig,
    device: &B::Device,
) -> Result<ImportedEncoder<B>, CheckpointError> {
    let meta = read_meta(dir)?;
    check_tower(&meta, expected)?;

    let fresh = expected.init::<B>(device);
    let tower = load_checked(dir, WEIGHTS_STEM, WEIGHTS_FILE, "encoder weights", fresh, device)?;

    tracing::info!(dir = %dir.display(), step = meta.step, "Encoder imported");
    Ok(ImportedEncoder { tower, meta })
}

/// Restore the full momentum pair and queue saved by [`export_checkpoint`].
///
/// Applies the same metadata and shape checks as [`import_encoder`], plus the
/// predictor depth and whether the run kept a separate target. The restored
/// target is gradient-free, as after [`MomentumPairConfig::init`].
pub fn resume_checkpoint<B: Backend>(
    dir: &Path,
    expected: &MomentumPairConfig,
    device: &B::Device,
) -> Result<ResumedTraining<B>, CheckpointError> {
    let meta = read_meta(dir)?;
    check_tower(&meta, &expected.tower)?;
    if let Some(found) = meta.prediction_layers {
        if found != expected.prediction_layers {
            return Err(CheckpointError::EncoderMismatch {
                expected: format!("{} prediction layers", expected.prediction_layers),
                found: format!("{found} prediction layers"),
            });
        }
    }
    if let Some(found) = meta.lagging {
        if found != expected.use_lagging_model {
            return Err(CheckpointError::EncoderMismatch {
                expected: format!("use_lagging_model = {}", expected.use_lagging_model),
                found: format!("use_lagging_model = {found}"),
            });
        }
    }

    let fresh = expected.init::<B>(device)?;
    let pair = load_checked(dir, PAIR_STEM, PAIR_FILE, "pair weights", fresh, device)?.freeze_target();
    let queue = match &meta.queue {
        Some(state) => Some(NegativeQueue::from_state(state.clone(), device)?),
        None => None,
    };

    tracing::info!(dir = %dir.display(), step = meta.step, "Training state restored");
    Ok(ResumedTraining {
        pair,
        queue,
        step: meta.step,
    })
}

fn read_meta(dir: &Path) -> Result<CheckpointMeta, CheckpointError> {
    let meta_path = dir.join(META_FILE);
    let raw: serde_json::Value = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
    for field in REQUIRED_FIELDS {
        if raw.get(field).map_or(true, |v| v.is_null()) {
            return Err(CheckpointError::MissingField {
                path: meta_path,
                field,
            });
        }
    }
    Ok(serde_json::from_value(raw)?)
}

fn check_tower(meta: &CheckpointMeta, expected: &TowerConfig) -> Result<(), CheckpointError> {
    if meta.embedding_dim != expected.embedding_dim {
        return Err(CheckpointError::DimensionMismatch {
            expected: expected.embedding_dim,
            found: meta.embedding_dim,
        });
    }
    // Hidden width and normalization only shape projectors with a hidden layer.
    let hidden_differs = expected.projection_layers > 1
        && (meta.mlp_hidden_dim.is_some_and(|h| h != expected.mlp_hidden_dim)
            || meta.mlp_norm.is_some_and(|n| n != expected.mlp_norm));
    if meta.encoder != expected.encoder
        || meta.projection_layers != expected.projection_layers
        || hidden_differs
    {
        return Err(CheckpointError::EncoderMismatch {
            expected: describe(
                &expected.encoder,
                expected.projection_layers,
                Some(expected.mlp_hidden_dim),
                Some(expected.mlp_norm),
            ),
            found: describe(
                &meta.encoder,
                meta.projection_layers,
                meta.mlp_hidden_dim,
                meta.mlp_norm,
            ),
        });
    }
    Ok(())
}

fn describe(
    encoder: &EncoderArch,
    projection_layers: usize,
    hidden: Option<usize>,
    norm: Option<MlpNorm>,
) -> String {
    let mut out = format!("{encoder} + {projection_layers} projection layers");
    if let Some(hidden) = hidden {
        out.push_str(&format!(", hidden {hidden}"));
    }
    if let Some(norm) = norm {
        out.push_str(&format!(", norm {norm:?}"));
    }
    out
}

/// Load `<dir>/<stem>.mpk` into `fresh` and verify the result has the shapes
/// `fresh` was built with.
fn load_checked<B: Backend, M: Module<B>>(
    dir: &Path,
    stem: &str,
    file: &str,
    field: &'static str,
    fresh: M,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(CheckpointError::MissingField { path, field });
    }
    let built = ParameterSet::capture(&fresh);
    let loaded = fresh
        .load_file(
            dir.join(stem),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| CheckpointError::Recorder {
            path: path.clone(),
            message: e.to_string(),
        })?;
    if let Some(diff) = built.mismatch(&ParameterSet::capture(&loaded)) {
        return Err(CheckpointError::StructureMismatch(format!(
            "{}: {diff}",
            path.display()
        )));
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::queue::QueueInit;
    use burn::backend::ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn tower_config() -> TowerConfig {
        TowerConfig::new(
            EncoderArch::Linear {
                input_dim: 6,
                output_dim: 5,
            },
            4,
        )
        .with_mlp_hidden_dim(8)
    }

    fn flat<B: Backend>(set: &ParameterSet<B>) -> Vec<f32> {
        set.tensors()
            .iter()
            .flat_map(|t| t.clone().into_data().to_vec::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_export_import_round_trip() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let pair = MomentumPairConfig::new(tower_config())
            .init::<TestBackend>(&device)
            .unwrap();
        let mut queue =
            NegativeQueue::<TestBackend>::new(4, 4, 2, QueueInit::Zeros, &device).unwrap();
        queue
            .enqueue(Tensor::ones([2, 4], &device))
            .unwrap();

        let weights =
            export_checkpoint(tmp.path(), &pair, &tower_config(), 17, Some(&queue)).unwrap();
        assert!(weights.is_file());

        let imported = import_encoder::<TestBackend>(tmp.path(), &tower_config(), &device).unwrap();
        assert_eq!(imported.meta.step, 17);
        assert_eq!(
            flat(&ParameterSet::capture(&imported.tower)),
            flat(&ParameterSet::capture(pair.online()))
        );
        let restored = imported.queue(&device).unwrap().unwrap();
        assert_eq!(restored.cursor(), 2);
    }

    #[test]
    fn test_missing_field_is_named() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(META_FILE),
            r#"{"encoder": {"type": "Linear", "input_dim": 6, "output_dim": 5}, "step": 3}"#,
        )
        .unwrap();
        let err = import_encoder::<TestBackend>(tmp.path(), &tower_config(), &Default::default())
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingField { field: "embedding_dim", .. }));
        assert!(err.to_string().contains("embedding_dim"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let pair = MomentumPairConfig::new(tower_config())
            .init::<TestBackend>(&device)
            .unwrap();
        export_checkpoint(tmp.path(), &pair, &tower_config(), 0, None).unwrap();

        let wider = TowerConfig {
            embedding_dim: 8,
            ..tower_config()
        };
        let err = import_encoder::<TestBackend>(tmp.path(), &wider, &device).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::DimensionMismatch {
                expected: 8,
                found: 4
            }
        ));
    }

    #[test]
    fn test_missing_weights_file() {
        let tmp = TempDir::new().unwrap();
        let meta = CheckpointMeta {
            embedding_dim: 4,
            encoder: tower_config().encoder,
            projection_layers: 2,
            mlp_hidden_dim: None,
            mlp_norm: None,
            prediction_layers: None,
            lagging: None,
            step: 0,
            queue: None,
        };
        std::fs::write(
            tmp.path().join(META_FILE),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();
        let err = import_encoder::<TestBackend>(tmp.path(), &tower_config(), &Default::default())
            .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingField { field: "encoder weights", .. }));
    }

    #[test]
    fn test_missing_meta_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = import_encoder::<TestBackend>(tmp.path(), &tower_config(), &Default::default())
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)));
    }

    #[test]
    fn test_hidden_width_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let pair = MomentumPairConfig::new(tower_config())
            .init::<TestBackend>(&device)
            .unwrap();
        export_checkpoint(tmp.path(), &pair, &tower_config(), 0, None).unwrap();

        let wider = tower_config().with_mlp_hidden_dim(16);
        let err = import_encoder::<TestBackend>(tmp.path(), &wider, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::EncoderMismatch { .. }));
        assert!(err.to_string().contains("hidden 8"));

        let normed = tower_config().with_mlp_norm(MlpNorm::LayerNorm);
        let err = import_encoder::<TestBackend>(tmp.path(), &normed, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::EncoderMismatch { .. }));
    }

    #[test]
    fn test_weight_shapes_checked_without_hidden_metadata() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let pair = MomentumPairConfig::new(tower_config())
            .init::<TestBackend>(&device)
            .unwrap();
        export_checkpoint(tmp.path(), &pair, &tower_config(), 0, None).unwrap();

        // Metadata written before the hidden width was recorded.
        let meta_path = tmp.path().join(META_FILE);
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&meta_path).unwrap()).unwrap();
        raw.as_object_mut().unwrap().remove("mlp_hidden_dim");
        std::fs::write(&meta_path, raw.to_string()).unwrap();

        let wider = tower_config().with_mlp_hidden_dim(16);
        let err = import_encoder::<TestBackend>(tmp.path(), &wider, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::StructureMismatch(_)), "{err}");
    }

    #[test]
    fn test_resume_restores_target_and_predictor() {
        use burn::backend::Autodiff;
        use burn::tensor::Distribution;
        type TrainBackend = Autodiff<NdArray<f32>>;

        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let tower = tower_config().with_mlp_norm(MlpNorm::BatchNorm);
        let config = MomentumPairConfig::new(tower.clone())
            .with_prediction_layers(2)
            .with_momentum(0.5);
        let pair = config.init::<TrainBackend>(&device).unwrap();

        // A training forward moves the online running statistics; one EMA
        // step leaves the target halfway behind them.
        let x = Tensor::<TrainBackend, 2>::random([8, 6], Distribution::Normal(2.0, 1.0), &device);
        let _ = pair.forward_online(x);
        let pair = pair.update_momentum(0, 10);
        let target = flat(&ParameterSet::capture(pair.target().unwrap()));
        let online = flat(&ParameterSet::capture(pair.online()));
        assert_ne!(target, online);

        let mut queue =
            NegativeQueue::<TrainBackend>::new(4, 4, 2, QueueInit::Zeros, &device).unwrap();
        queue.enqueue(Tensor::ones([2, 4], &device)).unwrap();
        export_checkpoint(tmp.path(), &pair, &tower, 9, Some(&queue)).unwrap();

        let resumed = resume_checkpoint::<TrainBackend>(tmp.path(), &config, &device).unwrap();
        assert_eq!(resumed.step, 9);
        assert_eq!(resumed.queue.unwrap().cursor(), 2);
        assert_eq!(resumed.pair.prediction_layers(), 2);
        assert_eq!(flat(&ParameterSet::capture(resumed.pair.target().unwrap())), target);
        assert_eq!(flat(&ParameterSet::capture(resumed.pair.online())), online);
        assert_eq!(
            flat(&ParameterSet::capture(&resumed.pair)),
            flat(&ParameterSet::capture(&pair))
        );
    }

    #[test]
    fn test_resume_rejects_other_predictor_depth() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let config = MomentumPairConfig::new(tower_config());
        let pair = config.init::<TestBackend>(&device).unwrap();
        export_checkpoint(tmp.path(), &pair, &tower_config(), 0, None).unwrap();

        let err = resume_checkpoint::<TestBackend>(
            tmp.path(),
            &config.clone().with_prediction_layers(2),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::EncoderMismatch { .. }));
    }
}
