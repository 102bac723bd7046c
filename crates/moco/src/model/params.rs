//! Parameter collections: flattened snapshots in structural order, named
//! paths for optimizer grouping, and the EMA blend over matched pairs.
//!
//! Online and target towers are built from the same config, so visiting them
//! yields tensors in the same order with the same shapes. Pairs are matched by
//! that position, never by `ParamId`: the two towers deliberately own distinct
//! ids so gradients and optimizer state can never alias across them.

use burn::module::{ModuleMapper, ModuleVisitor, ParamId};
use burn::nn::Linear;
use burn::prelude::*;

/// Flattened copy of every float tensor in a module, in visitation order.
#[derive(Debug, Clone)]
pub struct ParameterSet<B: Backend> {
    tensors: Vec<Tensor<B, 1>>,
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ParameterSet<B> {
    /// Snapshot `module`'s floats (detached from any autodiff graph).
    pub fn capture<M: Module<B>>(module: &M) -> Self {
        let mut collector = Collector {
            tensors: Vec::new(),
            shapes: Vec::new(),
        };
        module.visit(&mut collector);
        Self {
            tensors: collector.tensors,
            shapes: collector.shapes,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalars across all tensors.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.dims()[0]).sum()
    }

    /// Flattened tensors in visitation order.
    pub fn tensors(&self) -> &[Tensor<B, 1>] {
        &self.tensors
    }

    /// Original shape of each tensor, in visitation order.
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    /// Describe the first structural difference from `other`, or `None` when
    /// both sets hold the same number of tensors with the same shapes.
    pub fn mismatch(&self, other: &Self) -> Option<String> {
        if self.shapes.len() != other.shapes.len() {
            return Some(format!(
                "{} tensors vs {}",
                self.shapes.len(),
                other.shapes.len()
            ));
        }
        self.shapes
            .iter()
            .zip(&other.shapes)
            .enumerate()
            .find(|(_, (a, b))| a != b)
            .map(|(i, (a, b))| format!("tensor {i} has shape {a:?} vs {b:?}"))
    }
}

struct Collector<B: Backend> {
    tensors: Vec<Tensor<B, 1>>,
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        self.shapes.push(tensor.dims().to_vec());
        self.tensors.push(tensor.clone().detach().reshape([n]));
    }
}

/// `target ← m·target + (1−m)·online`, per matched tensor pair.
///
/// The blended tensors are detached: the target never joins a gradient graph.
/// Both modules must share one structure (see [`ParameterSet::mismatch`]);
/// unmatched target tensors are left as they are.
pub fn ema_update<B: Backend, M: Module<B>>(target: M, online: &ParameterSet<B>, momentum: f64) -> M {
    let mut mapper = EmaMapper {
        online: online.tensors.iter(),
        momentum,
        mismatched: 0,
    };
    let target = target.map(&mut mapper);
    if mapper.mismatched > 0 {
        tracing::error!(
            mismatched = mapper.mismatched,
            "EMA skipped tensors with no structural counterpart"
        );
    }
    debug_assert_eq!(
        mapper.mismatched, 0,
        "online and target towers are not structurally identical"
    );
    target
}

struct EmaMapper<'a, B: Backend> {
    online: std::slice::Iter<'a, Tensor<B, 1>>,
    momentum: f64,
    mismatched: usize,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<'_, B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let dims = tensor.dims();
        match self.online.next() {
            Some(online) if online.dims()[0] == tensor.shape().num_elements() => {
                let online = online.clone().reshape(dims);
                (tensor.mul_scalar(self.momentum) + online.mul_scalar(1.0 - self.momentum))
                    .detach()
            }
            _ => {
                self.mismatched += 1;
                tensor
            }
        }
    }
}

/// A parameter addressed by a dotted path such as `online.projector.layers.0.weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedParam {
    pub path: String,
    pub id: ParamId,
}

/// Modules that can list their trainable parameters by path.
pub trait NamedParameters {
    fn named_params(&self, prefix: &str) -> Vec<NamedParam>;
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub(crate) fn linear_params<B: Backend>(prefix: &str, linear: &Linear<B>) -> Vec<NamedParam> {
    let mut out = vec![NamedParam {
        path: join(prefix, "weight"),
        id: linear.weight.id,
    }];
    if let Some(bias) = &linear.bias {
        out.push(NamedParam {
            path: join(prefix, "bias"),
            id: bias.id,
        });
    }
    out
}

/// Every float id in `module`, all named `path`. Used for submodules whose
/// fields are not individually addressable (normalization layers).
pub(crate) fn module_params<B: Backend, M: Module<B>>(path: &str, module: &M) -> Vec<NamedParam> {
    let mut ids = IdCollector { ids: Vec::new() };
    module.visit(&mut ids);
    ids.ids
        .into_iter()
        .map(|id| NamedParam {
            path: path.to_string(),
            id,
        })
        .collect()
}

struct IdCollector {
    ids: Vec<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for IdCollector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        self.ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray<f32>;

    fn values(set: &ParameterSet<TestBackend>) -> Vec<Vec<f32>> {
        set.tensors()
            .iter()
            .map(|t| t.clone().into_data().to_vec().unwrap())
            .collect()
    }

    #[test]
    fn test_capture_counts_weight_and_bias() {
        let device = Default::default();
        let layer = LinearConfig::new(4, 3).init::<TestBackend>(&device);
        let set = ParameterSet::capture(&layer);
        assert_eq!(set.len(), 2);
        assert_eq!(set.num_elements(), 4 * 3 + 3);
    }

    #[test]
    fn test_ema_update_elementwise() {
        let device = Default::default();
        let online = LinearConfig::new(4, 3).init::<TestBackend>(&device);
        let target = LinearConfig::new(4, 3).init::<TestBackend>(&device);

        let online_set = ParameterSet::capture(&online);
        let before = values(&ParameterSet::capture(&target));
        let m = 0.9;
        let target = ema_update(target, &online_set, m);
        let after = values(&ParameterSet::capture(&target));
        let online_vals = values(&online_set);

        for ((t, o), a) in before.iter().zip(&online_vals).zip(&after) {
            for ((t, o), a) in t.iter().zip(o).zip(a) {
                let expected = m as f32 * t + (1.0 - m as f32) * o;
                assert!((a - expected).abs() < 1e-6, "expected {expected}, got {a}");
            }
        }
    }

    #[test]
    fn test_ema_zero_momentum_copies_online() {
        let device = Default::default();
        let online = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let target = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let online_set = ParameterSet::capture(&online);
        let target = ema_update(target, &online_set, 0.0);
        assert_eq!(values(&ParameterSet::capture(&target)), values(&online_set));
    }

    #[test]
    fn test_ema_keeps_target_ids() {
        let device = Default::default();
        let online = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let target = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let id = target.weight.id;
        let target = ema_update(target, &ParameterSet::capture(&online), 0.5);
        assert_eq!(target.weight.id, id);
        assert_ne!(target.weight.id, online.weight.id);
    }

    #[test]
    fn test_mismatch_reports_shapes() {
        let device = Default::default();
        let a = ParameterSet::capture(&LinearConfig::new(4, 3).init::<TestBackend>(&device));
        let b = ParameterSet::capture(&LinearConfig::new(4, 3).init::<TestBackend>(&device));
        let wide = ParameterSet::capture(&LinearConfig::new(4, 5).init::<TestBackend>(&device));
        let no_bias = ParameterSet::capture(
            &LinearConfig::new(4, 3)
                .with_bias(false)
                .init::<TestBackend>(&device),
        );

        assert_eq!(a.shapes(), &[vec![4, 3], vec![3]]);
        assert!(a.mismatch(&b).is_none());
        assert_eq!(a.mismatch(&wide).unwrap(), "tensor 0 has shape [4, 3] vs [4, 5]");
        assert_eq!(a.mismatch(&no_bias).unwrap(), "2 tensors vs 1");
    }

    #[test]
    fn test_linear_param_paths() {
        let device = Default::default();
        let layer = LinearConfig::new(2, 2).init::<TestBackend>(&device);
        let paths: Vec<String> = linear_params("proj", &layer)
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(paths, vec!["proj.weight", "proj.bias"]);
    }
}
