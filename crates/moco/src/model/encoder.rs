//! Encoder architecture identifier.
//!
//! The real backbone (e.g. a ResNet over augmented images) lives outside this
//! crate; what the contrastive core needs is an identifier it can build a
//! stand-in from and, above all, the backbone's output width so the projector
//! and the embedding-dimension checks can be sized correctly.
//!
//! Deserializes from TOML via `#[serde(tag = "type")]`:
//!
//! ```toml
//! [encoder]
//! type = "Mlp"
//! input_dim = 512
//! hidden_dim = 1024
//! output_dim = 256
//! ```

use std::fmt;

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Backbone architecture consumed by both towers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncoderArch {
    /// Single affine map `input_dim → output_dim`.
    Linear { input_dim: usize, output_dim: usize },
    /// Two-layer ReLU MLP `input_dim → hidden_dim → output_dim`.
    Mlp {
        input_dim: usize,
        #[serde(default = "default_mlp_hidden_dim")]
        hidden_dim: usize,
        output_dim: usize,
    },
}

fn default_mlp_hidden_dim() -> usize {
    512
}

impl Default for EncoderArch {
    fn default() -> Self {
        Self::Mlp {
            input_dim: 512,
            hidden_dim: 512,
            output_dim: 512,
        }
    }
}

impl fmt::Display for EncoderArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear {
                input_dim,
                output_dim,
            } => write!(f, "linear({input_dim}->{output_dim})"),
            Self::Mlp {
                input_dim,
                hidden_dim,
                output_dim,
            } => write!(f, "mlp({input_dim}->{hidden_dim}->{output_dim})"),
        }
    }
}

impl EncoderArch {
    /// Width of the features the backbone feeds into the projector.
    pub fn output_dim(&self) -> usize {
        match self {
            Self::Linear { output_dim, .. } | Self::Mlp { output_dim, .. } => *output_dim,
        }
    }

    /// Width of the (flattened) view the backbone consumes.
    pub fn input_dim(&self) -> usize {
        match self {
            Self::Linear { input_dim, .. } | Self::Mlp { input_dim, .. } => *input_dim,
        }
    }

    /// Instantiate the backbone with fresh parameters.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let layers = match self {
            Self::Linear {
                input_dim,
                output_dim,
            } => vec![LinearConfig::new(*input_dim, *output_dim).init(device)],
            Self::Mlp {
                input_dim,
                hidden_dim,
                output_dim,
            } => vec![
                LinearConfig::new(*input_dim, *hidden_dim).init(device),
                LinearConfig::new(*hidden_dim, *output_dim).init(device),
            ],
        };
        Backbone { layers }
    }
}

/// Stand-in backbone: a stack of linear layers with ReLU between them.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub(crate) layers: Vec<Linear<B>>,
}

impl<B: Backend> Backbone<B> {
    /// `(batch, input_dim)` → `(batch, output_dim)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = x;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = burn::tensor::activation::relu(x);
            }
        }
        x
    }
}
