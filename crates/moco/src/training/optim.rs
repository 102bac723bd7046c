//! Optimizer selection for the online tower.
//!
//! Parameters are split into two groups by path: those matching any
//! configured exclusion pattern (typically biases and normalization
//! parameters) skip weight decay and LARS trust-ratio scaling. SGD and Adam
//! delegate to burn's optimizers with decoupled weight decay applied first;
//! LARS is implemented here.
//!
//! The target tower owns no entry in either group and receives no gradients,
//! so nothing here ever touches it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use burn::module::{AutodiffModule, ModuleMapper, ParamId};
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::error::ConfigError;
use crate::model::bridge::tensor_to_f64;
use crate::model::params::NamedParameters;

/// Supported optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    Lars,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "lars" => Ok(Self::Lars),
            other => Err(ConfigError::UnsupportedOptimizer(other.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => write!(f, "sgd"),
            Self::Adam => write!(f, "adam"),
            Self::Lars => write!(f, "lars"),
        }
    }
}

/// Resolved optimizer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub kind: OptimizerKind,
    pub weight_decay: f64,
    /// Heavy-ball momentum for SGD and LARS. Ignored by Adam.
    pub momentum: f64,
    /// LARS trust coefficient.
    pub lars_eta: f64,
    /// Substrings matched against parameter paths.
    pub exclude_patterns: Vec<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            weight_decay: 1e-4,
            momentum: 0.9,
            lars_eta: 1e-3,
            exclude_patterns: Vec::new(),
        }
    }
}

/// Trainable parameter ids, split by the exclusion list.
#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    regular: HashSet<ParamId>,
    excluded: HashSet<ParamId>,
}

impl ParamGroups {
    pub fn new<M: NamedParameters>(module: &M, patterns: &[String]) -> Self {
        let mut groups = Self::default();
        for param in module.named_params("") {
            if patterns.iter().any(|p| param.path.contains(p.as_str())) {
                tracing::debug!(path = %param.path, "Excluded from weight decay / LARS scaling");
                groups.excluded.insert(param.id);
            } else {
                groups.regular.insert(param.id);
            }
        }
        groups
    }

    /// Ids that receive weight decay and LARS scaling.
    pub fn is_regular(&self, id: &ParamId) -> bool {
        self.regular.contains(id)
    }

    pub fn num_regular(&self) -> usize {
        self.regular.len()
    }

    pub fn num_excluded(&self) -> usize {
        self.excluded.len()
    }
}

/// Warmup followed by cosine decay to zero.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps) as f64 / decay_steps as f64).min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

type BurnStep<M> = Box<dyn FnMut(f64, M, GradientsParams) -> M>;

enum Engine<B: AutodiffBackend, M> {
    /// A burn optimizer preceded by decoupled weight decay.
    Burn(BurnStep<M>),
    Lars(Lars<B>),
}

/// Steps the online parameters of `M` given this step's gradients.
pub struct ContrastiveOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    settings: OptimizerSettings,
    groups: ParamGroups,
    engine: Engine<B, M>,
}

impl<B, M> ContrastiveOptimizer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + NamedParameters + 'static,
{
    pub fn new(settings: OptimizerSettings, module: &M) -> Self {
        let groups = ParamGroups::new(module, &settings.exclude_patterns);
        let engine = match settings.kind {
            OptimizerKind::Sgd => {
                let momentum = (settings.momentum > 0.0).then(|| MomentumConfig {
                    momentum: settings.momentum,
                    dampening: 0.0,
                    nesterov: false,
                });
                let mut inner = SgdConfig::new().with_momentum(momentum).init::<B, M>();
                Engine::Burn(Box::new(move |lr: f64, module: M, grads: GradientsParams| {
                    inner.step(lr, module, grads)
                }))
            }
            OptimizerKind::Adam => {
                let mut inner = AdamConfig::new().init::<B, M>();
                Engine::Burn(Box::new(move |lr: f64, module: M, grads: GradientsParams| {
                    inner.step(lr, module, grads)
                }))
            }
            OptimizerKind::Lars => Engine::Lars(Lars::new(
                settings.momentum,
                settings.lars_eta,
                settings.weight_decay,
            )),
        };

        tracing::info!(
            optimizer = %settings.kind,
            weight_decay = settings.weight_decay,
            regular = groups.num_regular(),
            excluded = groups.num_excluded(),
            "Optimizer initialized"
        );

        Self {
            settings,
            groups,
            engine,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.settings.kind
    }

    pub fn groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// One update at learning rate `lr`.
    pub fn step(&mut self, lr: f64, module: M, mut grads: GradientsParams) -> M {
        match &mut self.engine {
            Engine::Burn(step) => {
                let module = if self.settings.weight_decay > 0.0 {
                    module.map(&mut DecayMapper {
                        groups: &self.groups,
                        factor: 1.0 - lr * self.settings.weight_decay,
                    })
                } else {
                    module
                };
                step(lr, module, grads)
            }
            Engine::Lars(lars) => module.map(&mut LarsMapper {
                lars,
                grads: &mut grads,
                groups: &self.groups,
                lr,
            }),
        }
    }
}

/// `w ← w·(1 − lr·wd)` on regular-group parameters.
struct DecayMapper<'a> {
    groups: &'a ParamGroups,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleMapper<B> for DecayMapper<'_> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        // Running statistics share the normalization layer's path but never require grad.
        if !self.groups.is_regular(&id) || !tensor.is_require_grad() {
            return tensor;
        }
        Tensor::from_inner(tensor.inner().mul_scalar(self.factor)).require_grad()
    }
}

/// Layer-wise adaptive rate scaling (You et al., 2017) with heavy-ball momentum.
///
/// Regular parameters: `g ← g + wd·w`, local rate `η·‖w‖/‖g‖`.
/// Excluded parameters: plain momentum SGD.
struct Lars<B: AutodiffBackend> {
    momentum: f64,
    eta: f64,
    weight_decay: f64,
    velocity: HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> Lars<B> {
    fn new(momentum: f64, eta: f64, weight_decay: f64) -> Self {
        Self {
            momentum,
            eta,
            weight_decay,
            velocity: HashMap::new(),
        }
    }

    fn trust_ratio(&self, w_norm: f64, g_norm: f64) -> f64 {
        if w_norm > 0.0 && g_norm > 0.0 {
            self.eta * w_norm / g_norm
        } else {
            1.0
        }
    }
}

struct LarsMapper<'a, B: AutodiffBackend> {
    lars: &'a mut Lars<B>,
    grads: &'a mut GradientsParams,
    groups: &'a ParamGroups,
    lr: f64,
}

impl<B: AutodiffBackend> ModuleMapper<B> for LarsMapper<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return tensor;
        };
        let is_require_grad = tensor.is_require_grad();
        let dims = tensor.dims();
        let weight = tensor.inner();

        let (grad, lr) = if self.groups.is_regular(&id) {
            let grad = grad + weight.clone().mul_scalar(self.lars.weight_decay);
            let w_norm = tensor_to_f64(weight.clone().powf_scalar(2.0).sum().sqrt());
            let g_norm = tensor_to_f64(grad.clone().powf_scalar(2.0).sum().sqrt());
            let scaled = self.lr * self.lars.trust_ratio(w_norm, g_norm);
            (grad, scaled)
        } else {
            (grad, self.lr)
        };

        let n = dims.iter().product::<usize>();
        let update = grad.reshape([n]).mul_scalar(lr);
        let velocity = match self.lars.velocity.remove(&id) {
            Some(v) => v.mul_scalar(self.lars.momentum) + update,
            None => update,
        };
        let weight = weight - velocity.clone().reshape(dims);
        self.lars.velocity.insert(id, velocity);

        let mut tensor = Tensor::from_inner(weight);
        if is_require_grad {
            tensor = tensor.require_grad();
        }
        tensor
    }
}
