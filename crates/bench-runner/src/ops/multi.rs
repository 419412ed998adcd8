use crate::backend::{ComputeBackend, DType};
use crate::bootstrap::DistributedBootstrap;
use crate::error::BenchError;
use bench_core::{CommandRunner, EnvSource};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_MESSAGE_SIZES: &[u64] = &[1024, 4096, 16384, 65536, 262144, 1048576];
const WARMUP_CALLS: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllreduceResult {
    pub message_sizes_bytes: Vec<u64>,
    pub bandwidth_gbps: Vec<f64>,
    pub latency_us: Vec<f64>,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiResult {
    pub allreduce: AllreduceResult,
}

pub fn parse_message_sizes(csv: &str) -> Vec<u64> {
    csv.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse::<u64>().ok())
        .collect()
}

pub fn run_allreduce<B, E, R>(
    backend: Option<&mut B>,
    bootstrap: &mut DistributedBootstrap<E, R>,
    message_sizes: &[u64],
    iters: usize,
) -> Result<AllreduceResult, BenchError>
where
    B: ComputeBackend,
    E: EnvSource,
    R: CommandRunner,
{
    let backend = backend.ok_or_else(BenchError::missing_backend)?;
    if !backend.device_available() {
        return Err(BenchError::DeviceUnavailable);
    }
    let ctx = bootstrap.ensure_initialized(backend)?;
    let iters = iters.max(1);

    let mut result = AllreduceResult::default();
    let mut last = None;
    for &size in message_sizes {
        let numel = ((size / 4) as usize).max(1);
        let mut buffer = backend.ones(1, numel, DType::Float32)?;
        backend.synchronize();

        for _ in 0..WARMUP_CALLS {
            backend.all_reduce_sum(&mut buffer)?;
        }
        backend.synchronize();

        let start = Instant::now();
        for _ in 0..iters {
            backend.all_reduce_sum(&mut buffer)?;
        }
        backend.synchronize();
        let total = start.elapsed().as_secs_f64();

        let avg = total / iters as f64;
        let bandwidth = if avg > 0.0 {
            size as f64 / avg / 1.0e9
        } else {
            0.0
        };
        debug!(size, avg_s = avg, bandwidth_gbps = bandwidth, "allreduce size done");
        result.message_sizes_bytes.push(size);
        result.bandwidth_gbps.push(bandwidth);
        result.latency_us.push(avg * 1.0e6);
        last = Some(buffer);
    }

    if let Some(buffer) = last {
        let checksum = backend.scalar_sum(&buffer)?;
        result.checksum = format!("{:.4}", checksum);
    }
    info!(
        rank = ctx.rank,
        world_size = ctx.world_size,
        sizes = result.message_sizes_bytes.len(),
        checksum = %result.checksum,
        "allreduce sweep finished"
    );
    Ok(result)
}
