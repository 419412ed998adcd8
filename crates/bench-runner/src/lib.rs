use bench_core::{CommandRunner, EnvSource};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

pub mod backend;
pub mod bootstrap;
pub mod detect;
pub mod envelope;
pub mod error;
pub mod group;
pub mod host;
pub mod ops;

pub use backend::{ComputeBackend, DType, Rendezvous};
pub use bootstrap::{DistributedBootstrap, DistributedContext};
pub use envelope::{EnvelopeBuilder, RunEnvelope, TestResult, SCHEMA_VERSION};
pub use error::{BackendError, BenchError};
pub use group::TcpProcessGroup;
pub use host::{HostBackend, HostTensor};
pub use ops::{
    AllreduceResult, CheckResult, DdpOptions, DdpStepOutcome, MultiResult, SingleOptions,
    SingleResult, DEFAULT_MESSAGE_SIZES,
};

pub const EXIT_CHECK_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub envelope: RunEnvelope,
    pub exit_code: i32,
}

impl CommandOutcome {
    fn ok(envelope: RunEnvelope) -> Self {
        Self {
            envelope,
            exit_code: 0,
        }
    }
}

pub fn run_check_command<E, R>(env: &E, runner: &R, now: DateTime<Utc>) -> CommandOutcome
where
    E: EnvSource + ?Sized,
    R: CommandRunner + ?Sized,
{
    let mut builder = EnvelopeBuilder::from_env(env, now);
    info!(run_id = builder.run_id(), "running check");
    let cache_root = builder.cache_root().to_string();
    let cache_root = (!cache_root.is_empty()).then(|| Path::new(&cache_root));
    let result = ops::run_check(env, runner, cache_root);
    let exit_code = if result.passed() {
        0
    } else {
        builder.add_warning("check: failures detected");
        EXIT_CHECK_FAILED
    };
    CommandOutcome {
        envelope: builder.finish(TestResult::Check(result)),
        exit_code,
    }
}

pub fn run_single_command<E, B>(
    env: &E,
    backend: Option<&mut B>,
    opts: &SingleOptions,
    now: DateTime<Utc>,
) -> CommandOutcome
where
    E: EnvSource + ?Sized,
    B: ComputeBackend,
{
    let mut builder = EnvelopeBuilder::from_env(env, now);
    info!(run_id = builder.run_id(), gemm_size = opts.gemm_size, "running single");
    let mut backend = backend;

    let gemm = ops::run_gemm(
        backend.as_deref_mut(),
        opts.gemm_size,
        opts.dtype.as_deref(),
        opts.warmup,
        opts.iters,
    );
    if let Err(err) = &gemm {
        builder.add_warning(format!("single: {}", err));
    }
    let mix = ops::run_kernel_mix(
        backend.as_deref_mut(),
        opts.kernel_mix_size,
        opts.warmup,
        opts.iters,
        opts.softmax_fp32,
    );
    if let Err(err) = &mix {
        builder.add_warning(format!("single: kernel_mix {}", err));
    }

    let result = SingleResult::from_measurements(&gemm, &mix);
    CommandOutcome::ok(builder.finish(TestResult::Single(result)))
}

pub fn run_multi_command<E, R, B>(
    bootstrap: &mut DistributedBootstrap<E, R>,
    backend: Option<&mut B>,
    message_sizes: &[u64],
    iters: usize,
    now: DateTime<Utc>,
) -> CommandOutcome
where
    E: EnvSource,
    R: CommandRunner,
    B: ComputeBackend,
{
    let mut builder = EnvelopeBuilder::from_env(bootstrap.env(), now);
    let sizes = if message_sizes.is_empty() {
        DEFAULT_MESSAGE_SIZES
    } else {
        message_sizes
    };
    info!(run_id = builder.run_id(), sizes = sizes.len(), iters, "running multi");
    let allreduce = match ops::run_allreduce(backend, bootstrap, sizes, iters) {
        Ok(result) => result,
        Err(err) => {
            builder.add_warning(format!("multi: {}", err));
            AllreduceResult::default()
        }
    };
    CommandOutcome::ok(builder.finish(TestResult::Multi(MultiResult { allreduce })))
}

pub fn run_ddp_step_command<E, R, B>(
    bootstrap: &mut DistributedBootstrap<E, R>,
    backend: Option<&mut B>,
    opts: &DdpOptions,
    now: DateTime<Utc>,
) -> CommandOutcome
where
    E: EnvSource,
    R: CommandRunner,
    B: ComputeBackend,
{
    let mut builder = EnvelopeBuilder::from_env(bootstrap.env(), now);
    info!(run_id = builder.run_id(), batch_size = opts.batch_size, "running ddp_step");
    let result = ops::run_ddp_step(backend, bootstrap, opts);
    if let Err(err) = &result {
        builder.add_warning(format!("ddp_step: {}", err));
    }
    CommandOutcome::ok(builder.finish(TestResult::DdpStep(result.into())))
}
