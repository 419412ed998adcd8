use bench_core::env::first_non_empty;
use bench_core::{CommandRunner, EnvSource, EXIT_NOT_FOUND};

pub const NODELIST_VAR: &str = "SLURM_NODELIST";
const RUNTIME_VERSION_VARS: &[&str] = &["ROCM_VERSION", "ROCR_VERSION", "ROCM_VERSION_PATH"];
const GPU_COUNT_VARS: &[&str] = &["SLURM_GPUS_ON_NODE", "SLURM_GPUS_PER_NODE", "SLURM_GPUS"];
const VISIBLE_DEVICE_VARS: &[&str] = &["ROCR_VISIBLE_DEVICES", "CUDA_VISIBLE_DEVICES"];

const DIAGNOSTIC_TOOLS: &[(&str, &[&str])] = &[
    ("rocminfo", &[]),
    ("rocm-smi", &["-i"]),
    ("nvidia-smi", &["-L"]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsProbe {
    pub tool: String,
    pub exit_code: i32,
    pub output: String,
}

pub fn hostname_list<E: EnvSource + ?Sized>(env: &E) -> Vec<String> {
    if let Some(nodelist) = env.non_empty(NODELIST_VAR) {
        return vec![nodelist];
    }
    let local = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default();
    if local.is_empty() {
        vec!["localhost".to_string()]
    } else {
        vec![local]
    }
}

pub fn accelerator_runtime_version<E: EnvSource + ?Sized>(env: &E) -> String {
    first_non_empty(env, RUNTIME_VERSION_VARS).unwrap_or_default()
}

/// Accelerators on this node: scheduler counts first (`"4(x2)"` reads as 4),
/// then the number of entries in a device-visibility list, else 0.
pub fn accelerator_count_from_env<E: EnvSource + ?Sized>(env: &E) -> i64 {
    for key in GPU_COUNT_VARS {
        if let Some(value) = env.non_empty(key) {
            if let Some(count) = leading_count(&value) {
                return count;
            }
        }
    }
    for key in VISIBLE_DEVICE_VARS {
        if let Some(value) = env.non_empty(key) {
            return value.split(',').filter(|v| !v.trim().is_empty()).count() as i64;
        }
    }
    0
}

fn leading_count(value: &str) -> Option<i64> {
    let head = value.split('(').next().unwrap_or("");
    let head = head.split(',').next().unwrap_or("");
    head.trim().parse::<i64>().ok()
}

/// Runs the first diagnostic tool found on PATH. Returns `("", 127, "")` when
/// none is installed.
pub fn probe_accelerator_diagnostics<R: CommandRunner + ?Sized>(runner: &R) -> DiagnosticsProbe {
    for (tool, args) in DIAGNOSTIC_TOOLS {
        if runner.which(tool).is_none() {
            continue;
        }
        let out = runner.run(tool, args);
        return DiagnosticsProbe {
            tool: tool.to_string(),
            exit_code: out.exit_code,
            output: out.combined(),
        };
    }
    DiagnosticsProbe {
        tool: String::new(),
        exit_code: EXIT_NOT_FOUND,
        output: String::new(),
    }
}
