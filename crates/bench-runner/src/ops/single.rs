use crate::backend::{ComputeBackend, DType};
use crate::error::BenchError;
use bench_core::{try_time_operation, TimingSummary};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const HOST_GEMM_COMFORT_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SingleOptions {
    pub gemm_size: usize,
    pub dtype: Option<String>,
    pub kernel_mix_size: usize,
    pub softmax_fp32: bool,
    pub warmup: usize,
    pub iters: usize,
}

impl Default for SingleOptions {
    fn default() -> Self {
        Self {
            gemm_size: 4096,
            dtype: None,
            kernel_mix_size: 2048,
            softmax_fp32: true,
            warmup: 2,
            iters: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GemmMeasurement {
    pub size: usize,
    pub dtype: DType,
    pub timings: TimingSummary,
    pub tflops: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelMixMeasurement {
    pub size: usize,
    pub batch: usize,
    pub hidden: usize,
    pub dtype: DType,
    pub timings: TimingSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmSummary {
    pub dtype: String,
    pub tflops: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMixSummary {
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleResult {
    pub gemm: GemmSummary,
    pub kernel_mix: KernelMixSummary,
}

impl SingleResult {
    pub fn from_measurements(
        gemm: &Result<GemmMeasurement, BenchError>,
        mix: &Result<KernelMixMeasurement, BenchError>,
    ) -> Self {
        let gemm = match gemm {
            Ok(m) => GemmSummary {
                dtype: m.dtype.as_str().to_string(),
                tflops: m.tflops,
                latency_p50_ms: m.timings.p50_ms(),
                latency_p95_ms: m.timings.p95_ms(),
            },
            Err(_) => GemmSummary {
                dtype: "unknown".to_string(),
                tflops: None,
                latency_p50_ms: None,
                latency_p95_ms: None,
            },
        };
        let kernel_mix = match mix {
            Ok(m) => KernelMixSummary {
                latency_p50_ms: m.timings.p50_ms(),
                latency_p95_ms: m.timings.p95_ms(),
            },
            Err(_) => KernelMixSummary {
                latency_p50_ms: None,
                latency_p95_ms: None,
            },
        };
        Self { gemm, kernel_mix }
    }
}

fn select_dtype<B: ComputeBackend>(backend: &B, requested: Option<&str>) -> Result<DType, BenchError> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => DType::parse(name)
            .filter(|d| backend.supports_dtype(*d))
            .ok_or_else(|| BenchError::unsupported_dtype(name)),
        None => Ok(backend.preferred_dtype()),
    }
}

fn warn_if_reference_backend<B: ComputeBackend>(backend: &B, size: usize) -> bool {
    let slow = backend.name() == "host" && size > HOST_GEMM_COMFORT_SIZE;
    if slow {
        warn!(
            backend = backend.name(),
            size,
            "host reference backend is not a throughput target; this gemm will take minutes"
        );
    }
    slow
}

/// Dense square matmul. Throughput is `2 * size^3 / p50`.
pub fn run_gemm<B: ComputeBackend>(
    backend: Option<&mut B>,
    size: usize,
    dtype: Option<&str>,
    warmup: usize,
    iters: usize,
) -> Result<GemmMeasurement, BenchError> {
    let backend = backend.ok_or_else(BenchError::missing_backend)?;
    if !backend.device_available() {
        return Err(BenchError::DeviceUnavailable);
    }
    let dtype = select_dtype(backend, dtype)?;
    if size == 0 {
        return Err(BenchError::UnsupportedConfiguration(
            "gemm size must be positive".to_string(),
        ));
    }

    warn_if_reference_backend(&*backend, size);

    let a = backend.random(size, size, dtype)?;
    let b = backend.random(size, size, dtype)?;
    let timings = try_time_operation(
        || -> Result<(), BenchError> {
            let c = backend.matmul(&a, &b)?;
            backend.synchronize();
            drop(c);
            Ok(())
        },
        warmup,
        iters,
    )?;

    let tflops = timings
        .p50_s
        .filter(|p50| *p50 > 0.0)
        .map(|p50| 2.0 * (size as f64).powi(3) / p50 / 1.0e12);
    info!(size, dtype = dtype.as_str(), ?tflops, "gemm finished");
    Ok(GemmMeasurement {
        size,
        dtype,
        timings,
        tflops,
    })
}

/// matmul -> layer norm -> softmax -> GELU -> residual add -> mean.
///
/// With `softmax_fp32` the segment after layer norm runs in float32 and the
/// result is cast back to the model dtype.
pub fn run_kernel_mix<B: ComputeBackend>(
    backend: Option<&mut B>,
    size: usize,
    warmup: usize,
    iters: usize,
    softmax_fp32: bool,
) -> Result<KernelMixMeasurement, BenchError> {
    let backend = backend.ok_or_else(BenchError::missing_backend)?;
    if !backend.device_available() {
        return Err(BenchError::DeviceUnavailable);
    }
    let hidden = size.max(256);
    let batch = (hidden / 16).max(16);
    let dtype = backend.preferred_dtype();

    let x = backend.random(batch, hidden, dtype)?;
    let residual = backend.random(batch, hidden, dtype)?;
    let w = backend.random(hidden, hidden, dtype)?;

    let timings = try_time_operation(
        || -> Result<(), BenchError> {
            let y = backend.matmul(&x, &w)?;
            let y = backend.layer_norm(&y)?;
            let out = if softmax_fp32 {
                let y = backend.cast(&y, DType::Float32)?;
                let y = backend.softmax(&y)?;
                let y = backend.gelu(&y)?;
                let r = backend.cast(&residual, DType::Float32)?;
                let y = backend.add(&y, &r)?;
                let y = backend.mean(&y)?;
                backend.cast(&y, dtype)?
            } else {
                let y = backend.softmax(&y)?;
                let y = backend.gelu(&y)?;
                let y = backend.add(&y, &residual)?;
                backend.mean(&y)?
            };
            backend.synchronize();
            drop(out);
            Ok(())
        },
        warmup,
        iters,
    )?;

    info!(hidden, batch, softmax_fp32, "kernel mix finished");
    Ok(KernelMixMeasurement {
        size,
        batch,
        hidden,
        dtype,
        timings,
    })
}
