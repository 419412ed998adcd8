use crate::backend::{ComputeBackend, DType};
use crate::bootstrap::{local_rank, DistributedBootstrap};
use crate::error::BenchError;
use bench_core::stats::{mean, percentile};
use bench_core::{CommandRunner, EnvSource};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

const LEARNING_RATE: f32 = 1.0e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct DdpOptions {
    pub batch_size: usize,
    pub input_size: usize,
    pub output_size: usize,
    pub dtype: String,
    pub warmup: usize,
    pub iters: usize,
}

impl Default for DdpOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            input_size: 4096,
            output_size: 4096,
            dtype: "bfloat16".to_string(),
            warmup: 3,
            iters: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdpStepResult {
    pub batch_size: usize,
    pub input_size: usize,
    pub output_size: usize,
    pub dtype: String,
    pub world_size: usize,
    pub local_rank: i64,
    pub step_time_ms_avg: f64,
    pub step_time_ms_p50: f64,
    pub step_time_ms_p95: f64,
    pub samples_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DdpStepOutcome {
    Failed { error: String },
    Completed(DdpStepResult),
}

impl From<Result<DdpStepResult, BenchError>> for DdpStepOutcome {
    fn from(result: Result<DdpStepResult, BenchError>) -> Self {
        match result {
            Ok(r) => DdpStepOutcome::Completed(r),
            Err(e) => DdpStepOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

pub(crate) fn replicate_parameters<B: ComputeBackend>(
    backend: &mut B,
    weight: &mut B::Tensor,
    world_size: usize,
) -> Result<(), BenchError> {
    if world_size > 1 {
        backend.all_reduce_sum(weight)?;
        backend.scale(weight, 1.0 / world_size as f32)?;
    }
    Ok(())
}

/// Data-parallel training step of a bias-free linear layer.
///
/// Each step is forward (`x @ W`), backward of `sum(y)`, a gradient
/// all-reduce averaged over the world, an SGD update, and dropping the
/// gradient. Only the measured steps are bracketed by device syncs.
pub fn run_ddp_step<B, E, R>(
    backend: Option<&mut B>,
    bootstrap: &mut DistributedBootstrap<E, R>,
    opts: &DdpOptions,
) -> Result<DdpStepResult, BenchError>
where
    B: ComputeBackend,
    E: EnvSource,
    R: CommandRunner,
{
    let backend = backend.ok_or_else(BenchError::missing_backend)?;
    if !backend.device_available() {
        return Err(BenchError::DeviceUnavailable);
    }
    let dtype = DType::parse(&opts.dtype)
        .filter(|d| backend.supports_dtype(*d))
        .ok_or_else(|| BenchError::unsupported_dtype(&opts.dtype))?;
    if opts.batch_size == 0 || opts.input_size == 0 || opts.output_size == 0 {
        return Err(BenchError::UnsupportedConfiguration(
            "batch, input and output sizes must be positive".to_string(),
        ));
    }

    let ctx = bootstrap.ensure_initialized(backend)?;
    let local_rank = local_rank(bootstrap.env());
    let world_size = backend.group_world_size().unwrap_or(ctx.world_size);

    let mut weight = backend.random(opts.input_size, opts.output_size, dtype)?;
    replicate_parameters(backend, &mut weight, world_size)?;
    let x = backend.random(opts.batch_size, opts.input_size, dtype)?;
    let upstream = backend.ones(opts.batch_size, opts.output_size, dtype)?;
    let grad_scale = 1.0 / world_size as f32;

    let mut step = |backend: &mut B| -> Result<(), BenchError> {
        let y = backend.matmul(&x, &weight)?;
        let _loss = backend.scalar_sum(&y)?;
        let xt = backend.transpose(&x)?;
        let mut grad = backend.matmul(&xt, &upstream)?;
        backend.all_reduce_sum(&mut grad)?;
        backend.scale(&mut grad, grad_scale)?;
        backend.sgd_step(&mut weight, &grad, LEARNING_RATE)?;
        drop(grad);
        Ok(())
    };

    for _ in 0..opts.warmup {
        step(backend)?;
    }

    let mut step_times_ms = Vec::with_capacity(opts.iters.max(1));
    for _ in 0..opts.iters.max(1) {
        backend.synchronize();
        let start = Instant::now();
        step(backend)?;
        backend.synchronize();
        step_times_ms.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let avg = mean(&step_times_ms).unwrap_or(0.0);
    let p50 = percentile(&step_times_ms, 50.0).unwrap_or(0.0);
    let p95 = percentile(&step_times_ms, 95.0).unwrap_or(0.0);
    let global_batch = (opts.batch_size * world_size) as f64;
    let samples_per_sec = if avg > 0.0 {
        global_batch / (avg / 1000.0)
    } else {
        0.0
    };
    info!(world_size, avg_ms = avg, samples_per_sec, "ddp step finished");

    Ok(DdpStepResult {
        batch_size: opts.batch_size,
        input_size: opts.input_size,
        output_size: opts.output_size,
        dtype: dtype.as_str().to_string(),
        world_size,
        local_rank,
        step_time_ms_avg: avg,
        step_time_ms_p50: p50,
        step_time_ms_p95: p95,
        samples_per_sec,
    })
}
