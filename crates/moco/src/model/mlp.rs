//! Projection / prediction MLP.
//!
//! ```text
//! (batch, d_input)
//!   → [Linear(→d_hidden) → Norm → ReLU] × (num_layers − 1)
//!   → Linear(→d_output)
//! ```
//!
//! MoCo v2 uses a 2-layer projector without normalization; BYOL uses
//! 2-layer projector and predictor heads with batch norm.

use std::str::FromStr;

use burn::nn::{BatchNorm, BatchNormConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::params::{join, linear_params, module_params, NamedParam, NamedParameters};

/// Normalization applied after every hidden linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpNorm {
    None,
    BatchNorm,
    LayerNorm,
}

impl FromStr for MlpNorm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "batch_norm" | "bn" => Ok(Self::BatchNorm),
            "layer_norm" | "ln" => Ok(Self::LayerNorm),
            other => Err(ConfigError::UnsupportedNormalization(other.to_string())),
        }
    }
}

/// Configuration for an [`Mlp`].
#[derive(Config, Debug)]
pub struct MlpConfig {
    pub d_input: usize,
    pub d_output: usize,
    /// Total linear layers; must be ≥ 1.
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 2048)]
    pub d_hidden: usize,
    #[config(default = "MlpNorm::None")]
    pub norm: MlpNorm,
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    linears: Vec<Linear<B>>,
    pub(crate) batch_norms: Vec<BatchNorm<B, 1>>,
    layer_norms: Vec<LayerNorm<B>>,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let num_layers = self.num_layers.max(1);
        let mut linears = Vec::with_capacity(num_layers);
        let mut batch_norms = Vec::new();
        let mut layer_norms = Vec::new();

        let mut d_in = self.d_input;
        for _ in 0..num_layers - 1 {
            linears.push(LinearConfig::new(d_in, self.d_hidden).init(device));
            match self.norm {
                MlpNorm::None => {}
                MlpNorm::BatchNorm => batch_norms.push(BatchNormConfig::new(self.d_hidden).init(device)),
                MlpNorm::LayerNorm => layer_norms.push(LayerNormConfig::new(self.d_hidden).init(device)),
            }
            d_in = self.d_hidden;
        }
        linears.push(LinearConfig::new(d_in, self.d_output).init(device));

        Mlp {
            linears,
            batch_norms,
            layer_norms,
        }
    }
}

impl<B: Backend> Mlp<B> {
    /// `(batch, d_input)` → `(batch, d_output)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len() - 1;
        let mut x = x;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i == last {
                break;
            }
            if let Some(bn) = self.batch_norms.get(i) {
                // BatchNorm<_, 1> expects (batch, channels, length).
                let [batch, channels] = x.dims();
                x = bn.forward(x.reshape([batch, channels, 1])).reshape([batch, channels]);
            } else if let Some(ln) = self.layer_norms.get(i) {
                x = ln.forward(x);
            }
            x = burn::tensor::activation::relu(x);
        }
        x
    }

    pub fn num_layers(&self) -> usize {
        self.linears.len()
    }
}

impl<B: Backend> NamedParameters for Mlp<B> {
    fn named_params(&self, prefix: &str) -> Vec<NamedParam> {
        let mut out = Vec::new();
        for (i, linear) in self.linears.iter().enumerate() {
            out.extend(linear_params(&join(prefix, &format!("layers.{i}")), linear));
        }
        for (i, bn) in self.batch_norms.iter().enumerate() {
            out.extend(module_params(&join(prefix, &format!("layers.{i}.bn")), bn));
        }
        for (i, ln) in self.layer_norms.iter().enumerate() {
            out.extend(module_params(&join(prefix, &format!("layers.{i}.ln")), ln));
        }
        out
    }
}
