//! Online/target tower pair coupled by an exponential moving average.
//!
//! ```text
//! view_q → online tower → [predictor] → l2_normalize → query
//! view_k → target tower              → l2_normalize → key   (no gradient)
//!
//! after each optimizer step:  target ← m·target + (1−m)·online
//! ```
//!
//! The target is initialized as a copy of the online tower but owns its own
//! parameter ids and is marked `no_grad`, so it never receives gradients and
//! optimizers leave it untouched. [`MomentumPair::update_momentum`] is its
//! only mutation path.

use burn::prelude::*;

use crate::error::{CheckpointError, ConfigError};
use crate::model::mlp::{Mlp, MlpConfig};
use crate::model::params::{ema_update, NamedParam, NamedParameters, ParameterSet};
use crate::model::tower::{l2_normalize, Tower, TowerConfig};

/// Momentum coefficient at `step` of `total_steps`.
///
/// Constant `base` when unscheduled. Scheduled, it follows
/// `1 − (1 − base)·(cos(π·s/S) + 1)/2`, rising monotonically from `base` to
/// exactly 1.0 at `s = S`. Steps past the end clamp to the terminal value.
pub fn momentum_at(base: f64, step: usize, total_steps: usize, scheduled: bool) -> f64 {
    if !scheduled {
        return base;
    }
    if total_steps == 0 || step >= total_steps {
        return 1.0;
    }
    let progress = step as f64 / total_steps as f64;
    1.0 - (1.0 - base) * ((std::f64::consts::PI * progress).cos() + 1.0) / 2.0
}

/// Configuration for a [`MomentumPair`].
#[derive(Config, Debug)]
pub struct MomentumPairConfig {
    pub tower: TowerConfig,
    /// Linear layers in the online-only predictor (BYOL uses 2; 0 disables it).
    #[config(default = 0)]
    pub prediction_layers: usize,
    /// Base EMA coefficient `m₀` in [0, 1).
    #[config(default = 0.999)]
    pub momentum: f64,
    /// Cosine-anneal the coefficient from `m₀` to 1.
    #[config(default = false)]
    pub use_momentum_schedule: bool,
    /// Keep a separate EMA target. When false the key branch reuses the
    /// online tower with gradients stopped.
    #[config(default = true)]
    pub use_lagging_model: bool,
}

impl MomentumPairConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tower.validate()?;
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::MomentumOutOfRange(self.momentum));
        }
        Ok(())
    }

    /// Build the pair: fresh online tower, target copied from it.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<MomentumPair<B>, ConfigError> {
        self.validate()?;

        let online = self.tower.init::<B>(device);
        let predictor = (self.prediction_layers > 0).then(|| {
            MlpConfig::new(self.tower.embedding_dim, self.tower.embedding_dim)
                .with_num_layers(self.prediction_layers)
                .with_d_hidden(self.tower.mlp_hidden_dim)
                .with_norm(self.tower.mlp_norm)
                .init(device)
        });
        let target = self.use_lagging_model.then(|| {
            let fresh = self.tower.init::<B>(device);
            ema_update(fresh, &ParameterSet::capture(&online), 0.0).no_grad()
        });

        tracing::info!(
            encoder = %self.tower.encoder,
            embedding_dim = self.tower.embedding_dim,
            projection_layers = self.tower.projection_layers,
            prediction_layers = self.prediction_layers,
            momentum = self.momentum,
            scheduled = self.use_momentum_schedule,
            lagging = self.use_lagging_model,
            "Momentum pair initialized"
        );

        Ok(MomentumPair {
            online,
            predictor,
            target,
            base_momentum: self.momentum,
            use_momentum_schedule: self.use_momentum_schedule,
        })
    }
}

#[derive(Module, Debug)]
pub struct MomentumPair<B: Backend> {
    online: Tower<B>,
    predictor: Option<Mlp<B>>,
    target: Option<Tower<B>>,
    base_momentum: f64,
    use_momentum_schedule: bool,
}

impl<B: Backend> MomentumPair<B> {
    /// Query embedding: online tower, predictor if any, unit-normalized.
    pub fn forward_online(&self, view: Tensor<B, 2>) -> Tensor<B, 2> {
        let z = self.online.forward(view);
        let z = match &self.predictor {
            Some(predictor) => predictor.forward(z),
            None => z,
        };
        l2_normalize(z)
    }

    /// Key embedding: target tower (or stop-gradient online tower), unit-normalized.
    pub fn forward_target(&self, view: Tensor<B, 2>) -> Tensor<B, 2> {
        let tower = self.target.as_ref().unwrap_or(&self.online);
        l2_normalize(tower.forward(view.detach()).detach())
    }

    /// Coefficient this pair would apply at `step`.
    pub fn momentum(&self, step: usize, total_steps: usize) -> f64 {
        momentum_at(
            self.base_momentum,
            step,
            total_steps,
            self.use_momentum_schedule,
        )
    }

    /// Blend the online parameters into the target. Call once per step,
    /// after the optimizer has updated the online tower.
    pub fn update_momentum(mut self, step: usize, total_steps: usize) -> Self {
        let m = self.momentum(step, total_steps);
        if let Some(target) = self.target.take() {
            let online = ParameterSet::capture(&self.online);
            self.target = Some(ema_update(target, &online, m));
            tracing::trace!(step, momentum = m, "Target tower updated");
        }
        self
    }

    /// The gradient-trained tower (exported for linear evaluation).
    pub fn online(&self) -> &Tower<B> {
        &self.online
    }

    /// The EMA tower, absent when `use_lagging_model` is off.
    pub fn target(&self) -> Option<&Tower<B>> {
        self.target.as_ref()
    }

    pub fn has_predictor(&self) -> bool {
        self.predictor.is_some()
    }

    /// Replace the online tower, e.g. with weights from a checkpoint.
    /// The target is re-synchronized to it.
    ///
    /// # Errors
    /// [`CheckpointError::StructureMismatch`] if `online` was not built from
    /// the same [`TowerConfig`] as this pair; the pair is dropped unchanged.
    pub fn with_online(mut self, online: Tower<B>) -> Result<Self, CheckpointError> {
        let incoming = ParameterSet::capture(&online);
        if let Some(diff) = ParameterSet::capture(&self.online).mismatch(&incoming) {
            return Err(CheckpointError::StructureMismatch(diff));
        }
        if let Some(target) = self.target.take() {
            self.target = Some(ema_update(target, &incoming, 0.0));
        }
        self.online = online;
        Ok(self)
    }

    /// Linear layers in the predictor, 0 without one.
    pub fn prediction_layers(&self) -> usize {
        self.predictor.as_ref().map_or(0, |p| p.num_layers())
    }

    /// Re-mark the target as gradient-free after its weights were replaced
    /// from a record.
    pub(crate) fn freeze_target(mut self) -> Self {
        self.target = self.target.map(|t| t.no_grad());
        self
    }
}

impl<B: Backend> NamedParameters for MomentumPair<B> {
    /// Trainable parameters only; the target is never listed.
    fn named_params(&self, prefix: &str) -> Vec<NamedParam> {
        let mut out = self
            .online
            .named_params(&crate::model::params::join(prefix, "online"));
        if let Some(predictor) = &self.predictor {
            out.extend(predictor.named_params(&crate::model::params::join(prefix, "predictor")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::encoder::EncoderArch;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn small_config() -> MomentumPairConfig {
        MomentumPairConfig::new(
            TowerConfig::new(
                EncoderArch::Linear {
                    input_dim: 8,
                    output_dim: 6,
                },
                4,
            )
            .with_mlp_hidden_dim(8),
        )
    }

    fn flat(set: &ParameterSet<TestBackend>) -> Vec<f32> {
        set.tensors()
            .iter()
            .flat_map(|t| t.clone().into_data().to_vec::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_momentum_constant_when_unscheduled() {
        for step in [0, 10, 500, 1000, 5000] {
            assert_eq!(momentum_at(0.99, step, 1000, false), 0.99);
        }
    }

    #[test]
    fn test_momentum_schedule_monotone_to_one() {
        let total = 200;
        let mut prev = momentum_at(0.99, 0, total, true);
        assert!((prev - 0.99).abs() < 1e-12);
        for step in 1..=total {
            let m = momentum_at(0.99, step, total, true);
            assert!(m >= prev, "step {step}: {m} < {prev}");
            prev = m;
        }
        assert_eq!(momentum_at(0.99, total, total, true), 1.0);
        assert!(momentum_at(0.99, total - 1, total, true) < 1.0);
    }

    #[test]
    fn test_momentum_schedule_midpoint() {
        // cos(π/2) = 0 → 1 − (1 − m₀)/2
        let m = momentum_at(0.9, 50, 100, true);
        assert!((m - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_momentum_clamps_past_end() {
        assert_eq!(momentum_at(0.99, 250, 200, true), 1.0);
    }

    #[test]
    fn test_invalid_momentum_rejected() {
        let err = small_config().with_momentum(1.0).init::<TestBackend>(&Default::default());
        assert!(matches!(err, Err(ConfigError::MomentumOutOfRange(m)) if m == 1.0));
        let err = small_config().with_momentum(-0.1).init::<TestBackend>(&Default::default());
        assert!(matches!(err, Err(ConfigError::MomentumOutOfRange(_))));
    }

    #[test]
    fn test_target_starts_as_copy() {
        let device = Default::default();
        let pair = small_config().init::<TestBackend>(&device).unwrap();
        let target = pair.target().unwrap();
        assert_eq!(
            flat(&ParameterSet::capture(pair.online())),
            flat(&ParameterSet::capture(target))
        );

        let x = Tensor::<TestBackend, 2>::random([3, 8], Distribution::Normal(0.0, 1.0), &device);
        let q: Vec<f32> = pair.forward_online(x.clone()).into_data().to_vec().unwrap();
        let k: Vec<f32> = pair.forward_target(x).into_data().to_vec().unwrap();
        for (a, b) in q.iter().zip(&k) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_embeddings_unit_norm() {
        let device = Default::default();
        let pair = small_config()
            .with_prediction_layers(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 2>::random([5, 8], Distribution::Normal(0.0, 1.0), &device);
        for emb in [pair.forward_online(x.clone()), pair.forward_target(x)] {
            assert_eq!(emb.dims(), [5, 4]);
            let norms: Vec<f32> = emb.powf_scalar(2.0).sum_dim(1).sqrt().into_data().to_vec().unwrap();
            for n in norms {
                assert!((n - 1.0).abs() < 1e-5, "norm {n}");
            }
        }
    }

    #[test]
    fn test_update_momentum_matches_formula() {
        let device = Default::default();
        let mut pair = small_config()
            .with_momentum(0.75)
            .init::<TestBackend>(&device)
            .unwrap();
        // Stand in for an optimizer step: online drifts away from target.
        pair.online = small_config().tower.init::<TestBackend>(&device);
        let target_before = flat(&ParameterSet::capture(pair.target().unwrap()));
        let online_before = flat(&ParameterSet::capture(pair.online()));

        let pair = pair.update_momentum(0, 100);
        let target_after = flat(&ParameterSet::capture(pair.target().unwrap()));

        for ((t, o), a) in target_before.iter().zip(&online_before).zip(&target_after) {
            let expected = 0.75 * t + 0.25 * o;
            assert!((a - expected).abs() < 1e-5, "expected {expected}, got {a}");
        }
    }

    #[test]
    fn test_target_receives_no_gradient() {
        use burn::optim::GradientsParams;

        let device = Default::default();
        let pair = small_config().init::<TestAutodiffBackend>(&device).unwrap();
        let x = Tensor::<TestAutodiffBackend, 2>::random(
            [4, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let q = pair.forward_online(x.clone());
        let k = pair.forward_target(x);
        let loss = (q * k).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &pair);

        let online_w = pair.online().backbone.layers[0].weight.id;
        let target_w = pair.target().unwrap().backbone.layers[0].weight.id;
        assert!(grads.get::<NdArray<f32>, 2>(online_w).is_some());
        assert!(grads.get::<NdArray<f32>, 2>(target_w).is_none());
    }

    #[test]
    fn test_non_lagging_pair_has_no_target() {
        let device = Default::default();
        let pair = small_config()
            .with_use_lagging_model(false)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(pair.target().is_none());
        let x = Tensor::<TestBackend, 2>::random([2, 8], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(pair.forward_target(x).dims(), [2, 4]);
    }

    #[test]
    fn test_with_online_rejects_other_structure() {
        let device = Default::default();
        let pair = small_config().init::<TestBackend>(&device).unwrap();
        let wider = TowerConfig {
            mlp_hidden_dim: 16,
            ..small_config().tower
        }
        .init::<TestBackend>(&device);

        let err = pair.with_online(wider).unwrap_err();
        assert!(matches!(err, CheckpointError::StructureMismatch(_)));
        assert!(err.to_string().contains("[6, 8] vs [6, 16]"));
    }

    #[test]
    fn test_with_online_resyncs_target() {
        let device = Default::default();
        let pair = small_config().init::<TestBackend>(&device).unwrap();
        let replacement = small_config().tower.init::<TestBackend>(&device);
        let expected = flat(&ParameterSet::capture(&replacement));

        let pair = pair.with_online(replacement).unwrap();
        assert_eq!(flat(&ParameterSet::capture(pair.online())), expected);
        assert_eq!(flat(&ParameterSet::capture(pair.target().unwrap())), expected);
    }

    #[test]
    fn test_ema_blends_batch_norm_running_stats() {
        use crate::model::mlp::MlpNorm;

        let device = Default::default();
        let config = MomentumPairConfig::new(
            TowerConfig::new(
                EncoderArch::Linear {
                    input_dim: 8,
                    output_dim: 6,
                },
                4,
            )
            .with_mlp_hidden_dim(8)
            .with_mlp_norm(MlpNorm::BatchNorm),
        )
        .with_momentum(0.5);
        let pair = config.init::<TestAutodiffBackend>(&device).unwrap();

        // A training-mode forward moves the online running mean and variance
        // away from their initial values; the target has not seen a batch.
        let x = Tensor::<TestAutodiffBackend, 2>::random(
            [16, 8],
            Distribution::Normal(3.0, 2.0),
            &device,
        );
        let _ = pair.forward_online(x);
        let stats = |tower: &Tower<TestAutodiffBackend>| -> Vec<Vec<f32>> {
            let bn = &tower.projector.as_ref().unwrap().batch_norms[0];
            [bn.running_mean.value(), bn.running_var.value()]
                .into_iter()
                .map(|t| t.into_data().to_vec().unwrap())
                .collect()
        };
        let online = stats(pair.online());
        let before = stats(pair.target().unwrap());
        assert_ne!(online, before, "forward did not update running stats");

        let pair = pair.update_momentum(0, 100);
        let after = stats(pair.target().unwrap());
        for ((o, t), a) in online.iter().zip(&before).zip(&after) {
            for ((o, t), a) in o.iter().zip(t).zip(a) {
                let expected = 0.5 * t + 0.5 * o;
                assert!((a - expected).abs() < 1e-5, "expected {expected}, got {a}");
            }
        }
    }

    #[test]
    fn test_named_params_exclude_target() {
        let device = Default::default();
        let pair = small_config()
            .with_prediction_layers(2)
            .init::<TestBackend>(&device)
            .unwrap();
        let params = pair.named_params("");
        assert!(params.iter().all(|p| !p.path.starts_with("target")));
        assert!(params.iter().any(|p| p.path.starts_with("predictor.")));
        assert!(params.iter().any(|p| p.path.starts_with("online.backbone.")));
    }
}
