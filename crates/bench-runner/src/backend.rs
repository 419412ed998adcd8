use crate::error::BackendError;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float16,
    BFloat16,
}

impl DType {
    pub fn parse(name: &str) -> Option<DType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "float" => Some(DType::Float32),
            "float16" | "fp16" | "half" => Some(DType::Float16),
            "bfloat16" | "bf16" => Some(DType::BFloat16),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
        }
    }

    pub fn round(&self, v: f32) -> f32 {
        match self {
            DType::Float32 => v,
            DType::Float16 => f16::from_f32(v).to_f32(),
            DType::BFloat16 => bf16::from_f32(v).to_f32(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
}

/// Device runtime consumed by the benchmark operations.
///
/// All tensor operations are asynchronous from the caller's point of view:
/// timing code must call [`ComputeBackend::synchronize`] around its windows.
/// The collective surface mirrors a framework-level process group: it is
/// initialized at most once per process and afterwards reports its rank and
/// world size.
pub trait ComputeBackend {
    type Tensor;

    fn name(&self) -> &str;
    fn device_available(&self) -> bool;
    fn supports_dtype(&self, dtype: DType) -> bool;

    fn preferred_dtype(&self) -> DType {
        if self.supports_dtype(DType::BFloat16) {
            DType::BFloat16
        } else {
            DType::Float16
        }
    }

    fn synchronize(&mut self);

    fn random(&mut self, rows: usize, cols: usize, dtype: DType)
        -> Result<Self::Tensor, BackendError>;
    fn ones(&mut self, rows: usize, cols: usize, dtype: DType) -> Result<Self::Tensor, BackendError>;

    fn matmul(&mut self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn transpose(&mut self, a: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn layer_norm(&mut self, x: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn softmax(&mut self, x: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn gelu(&mut self, x: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn add(&mut self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn mean(&mut self, x: &Self::Tensor) -> Result<Self::Tensor, BackendError>;
    fn cast(&mut self, x: &Self::Tensor, dtype: DType) -> Result<Self::Tensor, BackendError>;
    fn scale(&mut self, x: &mut Self::Tensor, factor: f32) -> Result<(), BackendError>;
    fn sgd_step(
        &mut self,
        param: &mut Self::Tensor,
        grad: &Self::Tensor,
        lr: f32,
    ) -> Result<(), BackendError>;
    fn scalar_sum(&mut self, x: &Self::Tensor) -> Result<f64, BackendError>;

    fn process_group_initialized(&self) -> bool;
    fn init_process_group(
        &mut self,
        collective: &str,
        rank: usize,
        world_size: usize,
        rendezvous: &Rendezvous,
    ) -> Result<(), BackendError>;
    fn all_reduce_sum(&mut self, x: &mut Self::Tensor) -> Result<(), BackendError>;
    fn group_rank(&self) -> Option<usize>;
    fn group_world_size(&self) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_names_parse_with_aliases() {
        assert_eq!(DType::parse("bf16"), Some(DType::BFloat16));
        assert_eq!(DType::parse("Float16"), Some(DType::Float16));
        assert_eq!(DType::parse(" fp32 "), Some(DType::Float32));
        assert_eq!(DType::parse("int8"), None);
        assert_eq!(DType::BFloat16.as_str(), "bfloat16");
    }

    #[test]
    fn rounding_loses_precision_in_narrow_types() {
        let v = 1.0 + 1.0 / 1024.0;
        assert_eq!(DType::Float32.round(v), v);
        assert_eq!(DType::Float16.round(v), v);
        assert_eq!(DType::BFloat16.round(v), 1.0);
    }
}
