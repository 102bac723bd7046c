//! Encoder tower (backbone + projector) and the embedding normalizer.

use burn::prelude::*;

use crate::error::ConfigError;
use crate::model::encoder::{Backbone, EncoderArch};
use crate::model::mlp::{Mlp, MlpConfig, MlpNorm};
use crate::model::params::{join, NamedParam, NamedParameters};

/// Denominator floor for L2 normalization.
pub const NORM_EPS: f64 = 1e-12;

/// Project each row onto the unit sphere: `x / max(‖x‖₂, eps)`.
///
/// Input/output shape: `(batch, dim)`.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Configuration for a [`Tower`].
#[derive(Config, Debug)]
pub struct TowerConfig {
    pub encoder: EncoderArch,
    /// Width of the embeddings the tower emits.
    pub embedding_dim: usize,
    /// Linear layers in the projector; 0 feeds backbone features through directly.
    #[config(default = 2)]
    pub projection_layers: usize,
    #[config(default = 2048)]
    pub mlp_hidden_dim: usize,
    #[config(default = "MlpNorm::None")]
    pub mlp_norm: MlpNorm,
}

impl TowerConfig {
    /// Width check between the configured embedding and what the tower emits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::ZeroSized("embedding_dim"));
        }
        if self.encoder.input_dim() == 0 || self.encoder.output_dim() == 0 {
            return Err(ConfigError::ZeroSized("encoder dimensions"));
        }
        if self.projection_layers == 0 && self.encoder.output_dim() != self.embedding_dim {
            return Err(ConfigError::EmbeddingDimMismatch {
                configured: self.embedding_dim,
                actual: self.encoder.output_dim(),
            });
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Tower<B> {
        let projector = (self.projection_layers > 0).then(|| {
            MlpConfig::new(self.encoder.output_dim(), self.embedding_dim)
                .with_num_layers(self.projection_layers)
                .with_d_hidden(self.mlp_hidden_dim)
                .with_norm(self.mlp_norm)
                .init(device)
        });
        Tower {
            backbone: self.encoder.init(device),
            projector,
        }
    }
}

/// Backbone followed by an optional projection MLP.
#[derive(Module, Debug)]
pub struct Tower<B: Backend> {
    pub(crate) backbone: Backbone<B>,
    pub(crate) projector: Option<Mlp<B>>,
}

impl<B: Backend> Tower<B> {
    /// Backbone features, the representation a linear probe consumes.
    pub fn encode(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.backbone.forward(x)
    }

    /// Projected, not yet normalized output.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = self.backbone.forward(x);
        match &self.projector {
            Some(projector) => projector.forward(h),
            None => h,
        }
    }
}

impl<B: Backend> NamedParameters for Tower<B> {
    fn named_params(&self, prefix: &str) -> Vec<NamedParam> {
        let mut out = Vec::new();
        for (i, layer) in self.backbone.layers.iter().enumerate() {
            out.extend(crate::model::params::linear_params(
                &join(prefix, &format!("backbone.layers.{i}")),
                layer,
            ));
        }
        if let Some(projector) = &self.projector {
            out.extend(projector.named_params(&join(prefix, "projector")));
        }
        out
    }
}
