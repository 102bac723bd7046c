//! Contrastive objectives over normalized query/key embeddings.
//!
//! Logits are cosine similarities divided by the temperature `T`:
//!
//! - queue negatives: row `i` is `[q_i·k_i, q_i·n_1, …, q_i·n_K] / T`, label 0
//! - batch negatives: row `i` is `[q_i·k_1, …, q_i·k_N] / T`, label `i`
//! - no negatives (BYOL-style): only `q_i·k_i`
//!
//! Objectives:
//! - `ce`: softmax cross-entropy with the positive as the correct class
//! - `bce`: independent sigmoid terms (positive → 1, negatives → 0), summed per row
//! - `ip`: raw inner product: `−pos` (plus the mean negative when present)
//!
//! The objective and candidate set are resolved once in [`LossEngine::new`];
//! illegal combinations never reach the step.

use std::fmt;
use std::str::FromStr;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::{Int, TensorData};

use crate::error::{ConfigError, MocoError};
use crate::model::bridge::{data_to_vec, tensor_to_f64};

/// Objective applied to the logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    CrossEntropy,
    InnerProduct,
    BinaryCrossEntropy,
}

impl FromStr for LossType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ce" | "cross_entropy" => Ok(Self::CrossEntropy),
            "ip" | "inner_product" => Ok(Self::InnerProduct),
            "bce" | "binary_cross_entropy" => Ok(Self::BinaryCrossEntropy),
            other => Err(ConfigError::UnsupportedLoss(other.to_string())),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrossEntropy => write!(f, "ce"),
            Self::InnerProduct => write!(f, "ip"),
            Self::BinaryCrossEntropy => write!(f, "bce"),
        }
    }
}

/// Where negatives come from when they are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeSource {
    /// The negative queue snapshot.
    Queue,
    /// The other keys of the current batch.
    Batch,
}

impl FromStr for NegativeSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "batch" => Ok(Self::Batch),
            other => Err(ConfigError::UnsupportedValue {
                field: "negative_source",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable loss settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossConfig {
    pub loss_type: LossType,
    pub use_negative_examples: bool,
    pub negative_source: NegativeSource,
    pub use_both_augmentations_as_queries: bool,
    pub temperature: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: LossType::CrossEntropy,
            use_negative_examples: true,
            negative_source: NegativeSource::Queue,
            use_both_augmentations_as_queries: false,
            temperature: 0.2,
        }
    }
}

/// Candidate set each query is scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidates {
    PositiveOnly,
    Queue,
    Batch,
}

/// Similarity statistics for logging. Averaged over query directions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossDiagnostics {
    /// Mean cosine between each query and its key.
    pub pos_cos: f64,
    /// Mean cosine between queries and their negatives (the queue, or the
    /// other keys in the batch when no queue is in use).
    pub neg_cos: f64,
    /// Fraction of queries whose positive outranks every negative.
    pub acc1: Option<f64>,
    /// Fraction of queries whose positive is within the top five.
    pub acc5: Option<f64>,
}

pub struct LossOutput<B: Backend> {
    /// Scalar loss, shape `(1,)`, on the gradient graph of the queries.
    pub loss: Tensor<B, 1>,
    pub diagnostics: LossDiagnostics,
}

/// Resolved loss strategy.
#[derive(Debug, Clone, Copy)]
pub struct LossEngine {
    objective: LossType,
    candidates: Candidates,
    symmetric: bool,
    temperature: f64,
}

impl LossEngine {
    pub fn new(config: LossConfig) -> Result<Self, ConfigError> {
        if !(config.temperature > 0.0 && config.temperature.is_finite()) {
            return Err(ConfigError::NonPositiveTemperature(config.temperature));
        }
        let candidates = match (config.use_negative_examples, config.negative_source) {
            (false, _) => Candidates::PositiveOnly,
            (true, NegativeSource::Queue) => Candidates::Queue,
            (true, NegativeSource::Batch) => Candidates::Batch,
        };
        if candidates == Candidates::PositiveOnly && config.loss_type == LossType::CrossEntropy {
            return Err(ConfigError::CrossEntropyWithoutNegatives);
        }

        tracing::info!(
            loss_type = %config.loss_type,
            candidates = ?candidates,
            symmetric = config.use_both_augmentations_as_queries,
            temperature = config.temperature,
            "Loss engine resolved"
        );

        Ok(Self {
            objective: config.loss_type,
            candidates,
            symmetric: config.use_both_augmentations_as_queries,
            temperature: config.temperature,
        })
    }

    /// Whether [`compute_loss`](Self::compute_loss) expects a queue snapshot.
    pub fn needs_queue(&self) -> bool {
        self.candidates == Candidates::Queue
    }

    /// Whether both views act as queries (two directions per step).
    pub fn symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn has_negatives(&self) -> bool {
        self.candidates != Candidates::PositiveOnly
    }

    pub fn loss_type(&self) -> LossType {
        self.objective
    }

    /// Average the objective over query/key directions.
    ///
    /// `queries[d]` is scored against `keys[d]`. With symmetric queries the
    /// caller passes `[q1, q2]` and `[k2, k1]`; otherwise one of each.
    ///
    /// # Arguments
    /// - `queries`: shape `(batch, dim)` per direction, unit-normalized, on the
    ///   online tower's graph
    /// - `keys`: shape `(batch, dim)` per direction; detached here
    /// - `queue`: shape `(K, dim)` snapshot taken before this step's enqueue,
    ///   required only when negatives come from the queue
    ///
    /// # Returns
    /// Scalar loss of shape `(1,)` and [`LossDiagnostics`]. Without any
    /// negatives, `neg_cos` is the mean off-diagonal query·key cosine of the
    /// batch so collapse stays visible.
    pub fn compute_loss<B: Backend>(
        &self,
        queries: Vec<Tensor<B, 2>>,
        keys: Vec<Tensor<B, 2>>,
        queue: Option<Tensor<B, 2>>,
    ) -> Result<LossOutput<B>, MocoError> {
        let expected = if self.symmetric { 2 } else { 1 };
        if queries.len() != expected || keys.len() != expected {
            return Err(MocoError::InvalidInput(format!(
                "expected {expected} query/key direction(s), got {} queries and {} keys",
                queries.len(),
                keys.len()
            )));
        }
        let queue = match (self.needs_queue(), queue) {
            (true, None) => {
                return Err(MocoError::InvalidInput(
                    "queue negatives enabled but no queue snapshot supplied".to_string(),
                ))
            }
            (true, Some(q)) => Some(q.detach()),
            (false, _) => None,
        };

        let mut total: Option<Tensor<B, 1>> = None;
        let mut diag = LossDiagnostics::default();
        let (mut acc1, mut acc5) = (0.0, 0.0);

        for (q, k) in queries.into_iter().zip(keys) {
            if q.dims() != k.dims() {
                return Err(MocoError::ViewShapeMismatch(q.dims(), k.dims()));
            }
            if let Some(queue) = &queue {
                if queue.dims()[1] != q.dims()[1] {
                    return Err(MocoError::InvalidInput(format!(
                        "queue dim {} does not match embedding dim {}",
                        queue.dims()[1],
                        q.dims()[1]
                    )));
                }
            }
            let out = self.direction(q, k.detach(), queue.clone())?;
            total = Some(match total {
                Some(t) => t + out.loss,
                None => out.loss,
            });
            diag.pos_cos += out.diagnostics.pos_cos;
            diag.neg_cos += out.diagnostics.neg_cos;
            acc1 += out.diagnostics.acc1.unwrap_or(0.0);
            acc5 += out.diagnostics.acc5.unwrap_or(0.0);
        }

        let n = expected as f64;
        diag.pos_cos /= n;
        diag.neg_cos /= n;
        if self.has_negatives() {
            diag.acc1 = Some(acc1 / n);
            diag.acc5 = Some(acc5 / n);
        }
        let loss = total
            .map(|t| t.div_scalar(n))
            .ok_or_else(|| MocoError::InvalidInput("no query directions".to_string()))?;
        Ok(LossOutput {
            loss,
            diagnostics: diag,
        })
    }

    fn direction<B: Backend>(
        &self,
        q: Tensor<B, 2>,
        k: Tensor<B, 2>,
        queue: Option<Tensor<B, 2>>,
    ) -> Result<LossOutput<B>, MocoError> {
        let device = q.device();
        let [n, _] = q.dims();
        let t = self.temperature;

        match self.candidates {
            Candidates::PositiveOnly => {
                let pos = (q.clone() * k.clone()).sum_dim(1); // (N, 1)
                let loss = match self.objective {
                    LossType::InnerProduct => pos.clone().mean().neg(),
                    LossType::BinaryCrossEntropy => {
                        let logits = pos.clone().div_scalar(t);
                        let targets = Tensor::ones([n, 1], &device);
                        bce_with_logits(logits, targets).sum_dim(1).mean()
                    }
                    LossType::CrossEntropy => return Err(ConfigError::CrossEntropyWithoutNegatives.into()),
                };
                // Off-diagonal batch similarity as the negative diagnostic.
                let sim = q.matmul(k.transpose()).detach();
                let eye = identity::<B>(n, &device);
                let neg_cos = off_diagonal_mean(sim, eye);
                Ok(LossOutput {
                    loss,
                    diagnostics: LossDiagnostics {
                        pos_cos: tensor_to_f64(pos.detach().mean()),
                        neg_cos,
                        acc1: None,
                        acc5: None,
                    },
                })
            }
            Candidates::Queue => {
                let queue = queue.ok_or_else(|| {
                    MocoError::InvalidInput("queue snapshot missing".to_string())
                })?;
                let pos = (q.clone() * k).sum_dim(1); // (N, 1)
                let neg = q.matmul(queue.transpose()); // (N, K)
                let [_, num_neg] = neg.dims();

                let loss = match self.objective {
                    LossType::CrossEntropy => {
                        let logits = Tensor::cat(vec![pos.clone(), neg.clone()], 1).div_scalar(t);
                        let labels = Tensor::<B, 1, Int>::zeros([n], &device);
                        CrossEntropyLossConfig::new().init(&device).forward(logits, labels)
                    }
                    LossType::BinaryCrossEntropy => {
                        let logits = Tensor::cat(vec![pos.clone(), neg.clone()], 1).div_scalar(t);
                        let targets = Tensor::cat(
                            vec![
                                Tensor::ones([n, 1], &device),
                                Tensor::zeros([n, num_neg], &device),
                            ],
                            1,
                        );
                        bce_with_logits(logits, targets).sum_dim(1).mean()
                    }
                    LossType::InnerProduct => {
                        (neg.clone().mean_dim(1) - pos.clone()).mean()
                    }
                };

                let pos = pos.detach();
                let neg = neg.detach();
                let outranked = (neg.clone() - pos.clone()).greater_elem(0.0).int().sum_dim(1);
                let (acc1, acc5) = top_k_accuracy::<B>(outranked)?;
                Ok(LossOutput {
                    loss,
                    diagnostics: LossDiagnostics {
                        pos_cos: tensor_to_f64(pos.mean()),
                        neg_cos: tensor_to_f64(neg.mean()),
                        acc1: Some(acc1),
                        acc5: Some(acc5),
                    },
                })
            }
            Candidates::Batch => {
                let sim = q.matmul(k.transpose()); // (N, N), positives on the diagonal
                let eye = identity::<B>(n, &device);
                let pos = (sim.clone() * eye.clone()).sum_dim(1); // (N, 1)

                let loss = match self.objective {
                    LossType::CrossEntropy => {
                        let labels = Tensor::<B, 1, Int>::arange(0..n as i64, &device);
                        CrossEntropyLossConfig::new()
                            .init(&device)
                            .forward(sim.clone().div_scalar(t), labels)
                    }
                    LossType::BinaryCrossEntropy => {
                        bce_with_logits(sim.clone().div_scalar(t), eye.clone()).sum_dim(1).mean()
                    }
                    LossType::InnerProduct => {
                        let others = (n.max(2) - 1) as f64;
                        let neg_mean = (sim.clone().sum_dim(1) - pos.clone()).div_scalar(others);
                        (neg_mean - pos.clone()).mean()
                    }
                };

                let sim = sim.detach();
                let pos = pos.detach();
                // The diagonal itself contributes 0 − 0 and is never counted.
                let outranked = (sim.clone() - pos.clone()).greater_elem(0.0).int().sum_dim(1);
                let (acc1, acc5) = top_k_accuracy::<B>(outranked)?;
                Ok(LossOutput {
                    loss,
                    diagnostics: LossDiagnostics {
                        pos_cos: tensor_to_f64(pos.mean()),
                        neg_cos: off_diagonal_mean(sim, eye),
                        acc1: Some(acc1),
                        acc5: Some(acc5),
                    },
                })
            }
        }
    }
}

/// Numerically stable `BCEWithLogits`, elementwise:
/// `max(x, 0) − x·y + log(1 + e^{−|x|})`.
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 2> {
    let softplus_tail = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    logits.clone().clamp_min(0.0) - logits * targets + softplus_tail
}

fn identity<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0_f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(data, [n, n]), device)
}

/// Mean of the off-diagonal entries of a square matrix; 0 when there are none.
fn off_diagonal_mean<B: Backend>(sim: Tensor<B, 2>, eye: Tensor<B, 2>) -> f64 {
    let [n, _] = sim.dims();
    if n < 2 {
        return 0.0;
    }
    let masked = sim * eye.neg().add_scalar(1.0);
    tensor_to_f64(masked.sum()) / (n * (n - 1)) as f64
}

/// Fractions of rows where no / fewer than five negatives outrank the positive.
fn top_k_accuracy<B: Backend>(outranked: Tensor<B, 2, Int>) -> Result<(f64, f64), MocoError> {
    let counts = data_to_vec(outranked.into_data())?;
    if counts.is_empty() {
        return Ok((0.0, 0.0));
    }
    let n = counts.len() as f64;
    let top1 = counts.iter().filter(|&&c| c < 1.0).count() as f64 / n;
    let top5 = counts.iter().filter(|&&c| c < 5.0).count() as f64 / n;
    Ok((top1, top5))
}
