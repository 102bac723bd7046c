//! Per-step diagnostics with health checks.

use std::collections::BTreeMap;

use crate::training::loss::LossDiagnostics;

/// Positive and negative cosines both above this look like collapse.
const COLLAPSE_COS: f64 = 0.99;

/// Metrics for one training step, as reported to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub pos_cos: f64,
    pub neg_cos: f64,
    pub acc1: Option<f64>,
    pub acc5: Option<f64>,
    /// Momentum the target will be (or was) blended with this step.
    pub momentum: f64,
}

impl StepMetrics {
    pub fn new(loss: f64, diagnostics: &LossDiagnostics, momentum: f64) -> Self {
        Self {
            loss,
            pos_cos: diagnostics.pos_cos,
            neg_cos: diagnostics.neg_cos,
            acc1: diagnostics.acc1,
            acc5: diagnostics.acc5,
            momentum,
        }
    }

    /// Named scalars for external logging. Accuracies appear only when the
    /// step had negatives.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("loss".to_string(), self.loss);
        map.insert("pos_cos".to_string(), self.pos_cos);
        map.insert("neg_cos".to_string(), self.neg_cos);
        map.insert("momentum".to_string(), self.momentum);
        if let Some(acc1) = self.acc1 {
            map.insert("acc1".to_string(), acc1);
        }
        if let Some(acc5) = self.acc5 {
            map.insert("acc5".to_string(), acc5);
        }
        map
    }

    /// Warnings for conditions the driver likely wants to act on.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("non-finite loss {}", self.loss));
        }
        if self.pos_cos > COLLAPSE_COS && self.neg_cos > COLLAPSE_COS {
            warnings.push(format!(
                "possible representation collapse: pos_cos={:.4} neg_cos={:.4}",
                self.pos_cos, self.neg_cos
            ));
        }
        if let (Some(acc1), Some(acc5)) = (self.acc1, self.acc5) {
            if acc1 > acc5 {
                warnings.push(format!("acc1 {acc1:.3} exceeds acc5 {acc5:.3}"));
            }
        }
        warnings
    }
}

/// Running average over logging intervals.
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    loss: f64,
    pos_cos: f64,
    neg_cos: f64,
    acc1: f64,
    acc5: f64,
    with_accuracy: usize,
    momentum: f64,
    pub count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, m: &StepMetrics) {
        self.loss += m.loss;
        self.pos_cos += m.pos_cos;
        self.neg_cos += m.neg_cos;
        self.momentum += m.momentum;
        if let (Some(a1), Some(a5)) = (m.acc1, m.acc5) {
            self.acc1 += a1;
            self.acc5 += a5;
            self.with_accuracy += 1;
        }
        self.count += 1;
    }

    pub fn average(&self) -> Option<StepMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let (acc1, acc5) = if self.with_accuracy > 0 {
            let k = self.with_accuracy as f64;
            (Some(self.acc1 / k), Some(self.acc5 / k))
        } else {
            (None, None)
        };
        Some(StepMetrics {
            loss: self.loss / n,
            pos_cos: self.pos_cos / n,
            neg_cos: self.neg_cos / n,
            acc1,
            acc5,
            momentum: self.momentum / n,
        })
    }

    pub fn display(&self) -> String {
        match self.average() {
            None => "no data".to_string(),
            Some(m) => {
                let mut s = format!(
                    "loss={:.4} pos_cos={:.3} neg_cos={:.3} m={:.5}",
                    m.loss, m.pos_cos, m.neg_cos, m.momentum
                );
                if let (Some(a1), Some(a5)) = (m.acc1, m.acc5) {
                    s.push_str(&format!(" acc1={a1:.3} acc5={a5:.3}"));
                }
                s
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
