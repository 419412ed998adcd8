use crate::backend::{ComputeBackend, DType, Rendezvous};
use crate::error::BackendError;
use crate::group::{TcpProcessGroup, DEFAULT_CONNECT_TIMEOUT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

const LAYER_NORM_EPS: f32 = 1e-5;
const COLLECTIVES: &[&str] = &["nccl", "rccl", "gloo", "tcp"];

#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub rows: usize,
    pub cols: usize,
    pub dtype: DType,
    pub data: Vec<f32>,
}

impl HostTensor {
    fn from_fn(rows: usize, cols: usize, dtype: DType, mut f: impl FnMut(usize) -> f32) -> Self {
        let data = (0..rows * cols).map(|i| dtype.round(f(i))).collect();
        Self {
            rows,
            cols,
            dtype,
            data,
        }
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            dtype: self.dtype,
            data: self.data.iter().map(|v| self.dtype.round(f(*v))).collect(),
        }
    }

    fn map_rows(&self, f: impl Fn(&[f32], &mut [f32])) -> Self {
        let mut data = vec![0.0; self.data.len()];
        if self.cols > 0 {
            for (src, dst) in self
                .data
                .chunks_exact(self.cols)
                .zip(data.chunks_exact_mut(self.cols))
            {
                f(src, dst);
            }
        }
        for v in data.iter_mut() {
            *v = self.dtype.round(*v);
        }
        Self {
            rows: self.rows,
            cols: self.cols,
            dtype: self.dtype,
            data,
        }
    }
}

/// Reference backend that runs every kernel on the host CPU.
///
/// The collective surface is backed by [`TcpProcessGroup`], so multi-rank
/// runs work across processes and nodes without a vendor collective library.
#[derive(Debug)]
pub struct HostBackend {
    device: bool,
    rng: StdRng,
    group: Option<TcpProcessGroup>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_seed(0x5eed)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            device: true,
            rng: StdRng::seed_from_u64(seed),
            group: None,
        }
    }

    pub fn without_device() -> Self {
        Self {
            device: false,
            ..Self::new()
        }
    }

    fn require_device(&self) -> Result<(), BackendError> {
        if self.device {
            Ok(())
        } else {
            Err(BackendError::NoDevice)
        }
    }

    fn same_shape(a: &HostTensor, b: &HostTensor) -> Result<(), BackendError> {
        if a.rows != b.rows || a.cols != b.cols {
            return Err(BackendError::Shape(format!(
                "{}x{} vs {}x{}",
                a.rows, a.cols, b.rows, b.cols
            )));
        }
        Ok(())
    }

    fn normal(&mut self) -> f32 {
        let u1: f32 = 1.0 - self.rng.gen::<f32>();
        let u2: f32 = self.rng.gen::<f32>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

impl ComputeBackend for HostBackend {
    type Tensor = HostTensor;

    fn name(&self) -> &str {
        "host"
    }

    fn device_available(&self) -> bool {
        self.device
    }

    fn supports_dtype(&self, _dtype: DType) -> bool {
        true
    }

    fn synchronize(&mut self) {}

    fn random(&mut self, rows: usize, cols: usize, dtype: DType) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        let data = (0..rows * cols).map(|_| dtype.round(self.normal())).collect();
        Ok(HostTensor {
            rows,
            cols,
            dtype,
            data,
        })
    }

    fn ones(&mut self, rows: usize, cols: usize, dtype: DType) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Ok(HostTensor::from_fn(rows, cols, dtype, |_| 1.0))
    }

    fn matmul(&mut self, a: &HostTensor, b: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        if a.cols != b.rows {
            return Err(BackendError::Shape(format!(
                "matmul {}x{} by {}x{}",
                a.rows, a.cols, b.rows, b.cols
            )));
        }
        if a.dtype != b.dtype {
            return Err(BackendError::Shape(format!(
                "matmul dtype {} by {}",
                a.dtype.as_str(),
                b.dtype.as_str()
            )));
        }
        let (n, k, m) = (a.rows, a.cols, b.cols);
        let mut out = vec![0.0f32; n * m];
        for i in 0..n {
            let row = &mut out[i * m..(i + 1) * m];
            for p in 0..k {
                let av = a.data[i * k + p];
                if av == 0.0 {
                    continue;
                }
                let brow = &b.data[p * m..(p + 1) * m];
                for (o, bv) in row.iter_mut().zip(brow) {
                    *o += av * bv;
                }
            }
        }
        let dtype = a.dtype;
        for v in out.iter_mut() {
            *v = dtype.round(*v);
        }
        Ok(HostTensor {
            rows: n,
            cols: m,
            dtype,
            data: out,
        })
    }

    fn transpose(&mut self, a: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        let (rows, cols) = (a.rows, a.cols);
        Ok(HostTensor::from_fn(cols, rows, a.dtype, |idx| {
            let (r, c) = (idx / rows, idx % rows);
            a.data[c * cols + r]
        }))
    }

    fn layer_norm(&mut self, x: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Ok(x.map_rows(|src, dst| {
            let n = src.len() as f32;
            let mean = src.iter().sum::<f32>() / n;
            let var = src.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
            for (d, s) in dst.iter_mut().zip(src) {
                *d = (s - mean) * inv;
            }
        }))
    }

    fn softmax(&mut self, x: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Ok(x.map_rows(|src, dst| {
            let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0;
            for (d, s) in dst.iter_mut().zip(src) {
                *d = (s - max).exp();
                total += *d;
            }
            for d in dst.iter_mut() {
                *d /= total;
            }
        }))
    }

    fn gelu(&mut self, x: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Ok(x.map(gelu))
    }

    fn add(&mut self, a: &HostTensor, b: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Self::same_shape(a, b)?;
        Ok(HostTensor::from_fn(a.rows, a.cols, a.dtype, |i| {
            a.data[i] + b.data[i]
        }))
    }

    fn mean(&mut self, x: &HostTensor) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        let total: f64 = x.data.iter().map(|v| *v as f64).sum();
        let mean = if x.data.is_empty() {
            f64::NAN
        } else {
            total / x.data.len() as f64
        };
        Ok(HostTensor::from_fn(1, 1, x.dtype, |_| mean as f32))
    }

    fn cast(&mut self, x: &HostTensor, dtype: DType) -> Result<HostTensor, BackendError> {
        self.require_device()?;
        Ok(HostTensor::from_fn(x.rows, x.cols, dtype, |i| x.data[i]))
    }

    fn scale(&mut self, x: &mut HostTensor, factor: f32) -> Result<(), BackendError> {
        self.require_device()?;
        let dtype = x.dtype;
        for v in x.data.iter_mut() {
            *v = dtype.round(*v * factor);
        }
        Ok(())
    }

    fn sgd_step(
        &mut self,
        param: &mut HostTensor,
        grad: &HostTensor,
        lr: f32,
    ) -> Result<(), BackendError> {
        self.require_device()?;
        Self::same_shape(param, grad)?;
        let dtype = param.dtype;
        for (p, g) in param.data.iter_mut().zip(&grad.data) {
            *p = dtype.round(*p - lr * g);
        }
        Ok(())
    }

    fn scalar_sum(&mut self, x: &HostTensor) -> Result<f64, BackendError> {
        self.require_device()?;
        Ok(x.data.iter().map(|v| *v as f64).sum())
    }

    fn process_group_initialized(&self) -> bool {
        self.group.is_some()
    }

    fn init_process_group(
        &mut self,
        collective: &str,
        rank: usize,
        world_size: usize,
        rendezvous: &Rendezvous,
    ) -> Result<(), BackendError> {
        if self.group.is_some() {
            return Err(BackendError::GroupAlreadyInitialized);
        }
        if !COLLECTIVES.contains(&collective) {
            return Err(BackendError::UnknownCollective(collective.to_string()));
        }
        debug!(
            collective,
            rank,
            world_size,
            master = %rendezvous.master_addr,
            port = rendezvous.master_port,
            "joining host process group"
        );
        let group = TcpProcessGroup::connect(
            rank,
            world_size,
            &rendezvous.master_addr,
            rendezvous.master_port,
            DEFAULT_CONNECT_TIMEOUT,
        )?;
        info!(rank, world_size, "process group ready");
        self.group = Some(group);
        Ok(())
    }

    fn all_reduce_sum(&mut self, x: &mut HostTensor) -> Result<(), BackendError> {
        self.require_device()?;
        let group = self
            .group
            .as_mut()
            .ok_or(BackendError::GroupNotInitialized)?;
        group.all_reduce_sum(&mut x.data)?;
        let dtype = x.dtype;
        for v in x.data.iter_mut() {
            *v = dtype.round(*v);
        }
        Ok(())
    }

    fn group_rank(&self) -> Option<usize> {
        self.group.as_ref().map(|g| g.rank())
    }

    fn group_world_size(&self) -> Option<usize> {
        self.group.as_ref().map(|g| g.world_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(rows: usize, cols: usize, data: &[f32]) -> HostTensor {
        HostTensor {
            rows,
            cols,
            dtype: DType::Float32,
            data: data.to_vec(),
        }
    }

    fn single_rank() -> Rendezvous {
        Rendezvous {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
        }
    }

    #[test]
    fn matmul_matches_hand_computed_product() {
        let mut backend = HostBackend::new();
        let a = tensor(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let c = backend.matmul(&a, &b).expect("matmul");
        assert_eq!((c.rows, c.cols), (2, 2));
        assert_eq!(c.data, vec![58.0, 64.0, 139.0, 154.0]);
        assert!(backend.matmul(&a, &a).is_err());
    }

    #[test]
    fn transpose_swaps_axes() {
        let mut backend = HostBackend::new();
        let a = tensor(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = backend.transpose(&a).expect("transpose");
        assert_eq!((t.rows, t.cols), (3, 2));
        assert_eq!(t.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut backend = HostBackend::new();
        let x = tensor(2, 3, &[1.0, 2.0, 3.0, -1.0, 0.0, 1000.0]);
        let y = backend.softmax(&x).expect("softmax");
        for row in y.data.chunks(3) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5, "row sums to {}", total);
        }
    }

    #[test]
    fn layer_norm_centers_each_row() {
        let mut backend = HostBackend::new();
        let x = tensor(1, 4, &[1.0, 2.0, 3.0, 4.0]);
        let y = backend.layer_norm(&x).expect("layer_norm");
        let mean: f32 = y.data.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(y.data[0] < 0.0 && y.data[3] > 0.0);
    }

    #[test]
    fn narrow_dtype_outputs_are_rounded() {
        let mut backend = HostBackend::new();
        let x = tensor(1, 1, &[1.0 + 1.0 / 1024.0]);
        let y = backend.cast(&x, DType::BFloat16).expect("cast");
        assert_eq!(y.data, vec![1.0]);
        assert_eq!(y.dtype, DType::BFloat16);
    }

    #[test]
    fn kernels_fail_without_device() {
        let mut backend = HostBackend::without_device();
        assert!(!backend.device_available());
        assert_eq!(
            backend.ones(1, 1, DType::Float32).expect_err("no device"),
            BackendError::NoDevice
        );
    }

    #[test]
    fn random_is_deterministic_per_seed() {
        let a = HostBackend::with_seed(7)
            .random(4, 4, DType::Float32)
            .expect("random");
        let b = HostBackend::with_seed(7)
            .random(4, 4, DType::Float32)
            .expect("random");
        assert_eq!(a, b);
        assert!(a.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn single_rank_group_initializes_once() {
        let mut backend = HostBackend::new();
        assert!(!backend.process_group_initialized());
        backend
            .init_process_group("nccl", 0, 1, &single_rank())
            .expect("init");
        assert!(backend.process_group_initialized());
        assert_eq!(backend.group_world_size(), Some(1));
        assert_eq!(
            backend
                .init_process_group("nccl", 0, 1, &single_rank())
                .expect_err("second init"),
            BackendError::GroupAlreadyInitialized
        );

        let mut x = backend.ones(1, 4, DType::Float32).expect("ones");
        backend.all_reduce_sum(&mut x).expect("all_reduce");
        assert_eq!(backend.scalar_sum(&x).expect("sum"), 4.0);
    }

    #[test]
    fn unknown_collective_is_rejected() {
        let mut backend = HostBackend::new();
        let err = backend
            .init_process_group("mpi", 0, 1, &single_rank())
            .expect_err("unknown collective");
        assert_eq!(err, BackendError::UnknownCollective("mpi".to_string()));
    }
}
