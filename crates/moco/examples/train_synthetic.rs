//! Short MoCo v2 run on synthetic clustered data.
//!
//! Usage:
//!   cargo run --release -p moco --example train_synthetic [-- config.toml]
//!
//! Each example is a noisy copy of one of a few fixed cluster centers; the two
//! views are independent re-noisings of the same example. With a working
//! setup, `acc1` climbs and `pos_cos` separates from `neg_cos`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::{Autodiff, NdArray};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use moco::model::encoder::EncoderArch;
use moco::training::checkpoint::export_checkpoint;
use moco::training::metrics::RunningAvg;
use moco::training::optim::lr_schedule;
use moco::{init_queue, load_config, ContrastiveLearner, ContrastiveOptimizer, MocoConfig, SingleProcess};

type TrainBackend = Autodiff<NdArray<f32>>;

const NUM_CLUSTERS: usize = 10;
const LOG_INTERVAL: usize = 20;

fn default_config() -> MocoConfig {
    MocoConfig {
        encoder: EncoderArch::Mlp {
            input_dim: 32,
            hidden_dim: 64,
            output_dim: 32,
        },
        embedding_dim: 16,
        mlp_hidden_dim: 64,
        queue_capacity: 512,
        batch_size: 32,
        momentum: 0.99,
        temperature: 0.2,
        learning_rate: 0.05,
        total_steps: 200,
        warmup_steps: 10,
        exclude_matching_parameters: vec!["bias".to_string()],
        ..MocoConfig::default()
    }
}

fn sample_views(
    centers: &Tensor<TrainBackend, 2>,
    batch: usize,
    rng: &mut StdRng,
    device: &<TrainBackend as Backend>::Device,
) -> (Tensor<TrainBackend, 2>, Tensor<TrainBackend, 2>) {
    let clusters: Vec<i64> = (0..batch)
        .map(|_| rng.gen_range(0..NUM_CLUSTERS) as i64)
        .collect();
    let idx = Tensor::<TrainBackend, 1, Int>::from_data(TensorData::new(clusters, [batch]), device);
    let base = centers.clone().select(0, idx);
    let dim = base.dims()[1];
    let base = base + Tensor::random([batch, dim], Distribution::Normal(0.0, 0.3), device);
    let v1 = base.clone() + Tensor::random([batch, dim], Distribution::Normal(0.0, 0.1), device);
    let v2 = base + Tensor::random([batch, dim], Distribution::Normal(0.0, 0.1), device);
    (v1, v2)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => load_config(Path::new(&path))?,
        None => default_config(),
    };
    let resolved = config.validate(1)?;
    let device = Default::default();

    let mut pair = resolved.pair.init::<TrainBackend>(&device)?;
    let mut queue = init_queue::<TrainBackend>(&resolved, &device)?;
    let mut learner = ContrastiveLearner::new(&resolved, Box::new(SingleProcess))?;
    let mut optimizer = ContrastiveOptimizer::new(resolved.optimizer.clone(), &pair);

    let input_dim = config.encoder.input_dim();
    let centers = Tensor::<TrainBackend, 2>::random(
        [NUM_CLUSTERS, input_dim],
        Distribution::Normal(0.0, 1.0),
        &device,
    );

    let mut rng = StdRng::seed_from_u64(resolved.seed);
    let mut running_avg = RunningAvg::new();
    let start = Instant::now();

    for step in 0..resolved.total_steps {
        let (v1, v2) = sample_views(&centers, resolved.batch_size, &mut rng, &device);
        let out = learner.training_step(&pair, queue.as_mut(), v1, v2)?;
        running_avg.update(&out.metrics);

        let lr = lr_schedule(
            resolved.learning_rate,
            resolved.warmup_steps,
            resolved.total_steps,
            step,
        );
        let grads = GradientsParams::from_grads(out.loss.backward(), &pair);
        pair = optimizer.step(lr, pair, grads);
        pair = learner.momentum_update(pair);

        if step % LOG_INTERVAL == 0 || step + 1 == resolved.total_steps {
            let warnings = running_avg
                .average()
                .map(|m| m.health_check())
                .unwrap_or_default();
            if !warnings.is_empty() {
                tracing::warn!(step, "Health check warnings: {:?}", warnings);
            }
            tracing::info!(
                step,
                lr = %format!("{lr:.2e}"),
                "avg({}) {}",
                running_avg.count,
                running_avg.display()
            );
            running_avg.reset();
        }
    }

    let dir = PathBuf::from("checkpoints/moco/final");
    export_checkpoint(
        &dir,
        &pair,
        &resolved.pair.tower,
        learner.step(),
        queue.as_ref(),
    )?;
    tracing::info!(
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        dir = %dir.display(),
        "Training complete"
    );
    Ok(())
}
