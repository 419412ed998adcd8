use crate::detect::{
    accelerator_count_from_env, accelerator_runtime_version, probe_accelerator_diagnostics,
};
use crate::error::BenchError;
use bench_core::{ensure_dir, CommandRunner, EnvSource};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

const SNIPPET_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDetails {
    pub rocm_info_tool: String,
    pub rocm_info_exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rocm_info_snippet: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rocm_info_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root_writable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root_error: Option<String>,
    pub rocm_version: String,
    pub gpu_count_env: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub details: CheckDetails,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

/// Environment sanity check: accelerator diagnostics and cache-root
/// writability. Never fails; problems are reported through `status`.
pub fn run_check<E, R>(env: &E, runner: &R, cache_root: Option<&Path>) -> CheckResult
where
    E: EnvSource + ?Sized,
    R: CommandRunner + ?Sized,
{
    let mut status = CheckStatus::Pass;

    let probe = probe_accelerator_diagnostics(runner);
    debug!(tool = %probe.tool, exit_code = probe.exit_code, "diagnostics probe finished");
    let rocm_info_snippet = if probe.output.is_empty() {
        None
    } else {
        Some(
            probe
                .output
                .lines()
                .take(SNIPPET_LINES)
                .map(str::to_string)
                .collect(),
        )
    };
    let rocm_info_error = if probe.exit_code != 0 {
        status = CheckStatus::Fail;
        Some("rocminfo/rocm-smi not available".to_string())
    } else {
        None
    };

    let (cache_root_writable, cache_root_error) = match cache_root {
        Some(root) => match probe_cache_root(root) {
            Ok(()) => (Some(true), None),
            Err(err) => {
                warn!(cache_root = %root.display(), error = %err, "cache root not writable");
                status = CheckStatus::Fail;
                (Some(false), Some(err.to_string()))
            }
        },
        None => (None, None),
    };

    CheckResult {
        status,
        details: CheckDetails {
            rocm_info_tool: probe.tool,
            rocm_info_exit_code: probe.exit_code,
            rocm_info_snippet,
            rocm_info_error,
            cache_root_writable,
            cache_root_error,
            rocm_version: accelerator_runtime_version(env),
            gpu_count_env: accelerator_count_from_env(env),
        },
    }
}

fn probe_cache_root(root: &Path) -> Result<(), BenchError> {
    ensure_dir(root).map_err(|e| BenchError::IoFailure(e.to_string()))?;
    let probe = tempfile::Builder::new()
        .prefix(".bench_probe")
        .tempfile_in(root)
        .map_err(|e| BenchError::IoFailure(e.to_string()))?;
    probe
        .close()
        .map_err(|e| BenchError::IoFailure(e.to_string()))
}
