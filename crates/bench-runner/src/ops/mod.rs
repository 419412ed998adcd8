pub mod check;
pub mod ddp;
pub mod multi;
pub mod single;

pub use check::{run_check, CheckDetails, CheckResult, CheckStatus};
pub use ddp::{run_ddp_step, DdpOptions, DdpStepOutcome, DdpStepResult};
pub use multi::{parse_message_sizes, run_allreduce, AllreduceResult, MultiResult, DEFAULT_MESSAGE_SIZES};
pub use single::{
    run_gemm, run_kernel_mix, GemmMeasurement, GemmSummary, KernelMixMeasurement,
    KernelMixSummary, SingleOptions, SingleResult,
};
