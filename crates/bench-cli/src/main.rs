use anyhow::{Context, Result};
use bench_core::{EnvSource, ProcessEnv, SystemCommandRunner};
use bench_runner::{
    CommandOutcome, DdpOptions, DistributedBootstrap, HostBackend, SingleOptions,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "GPU cluster benchmark harness")]
struct Cli {
    /// Log filter for stderr output, e.g. `info` or `bench_runner=debug`.
    #[arg(long, global = true, env = "BENCH_LOG")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accelerator diagnostics and cache-root sanity check.
    Check {
        #[arg(long)]
        out: PathBuf,
    },
    /// Single-node GEMM and kernel-mix microbenchmarks.
    Single {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "BENCH_GEMM_SIZE", default_value_t = 4096)]
        gemm_size: usize,
        #[arg(long, env = "BENCH_GEMM_DTYPE")]
        dtype: Option<String>,
        #[arg(long, env = "BENCH_KERNEL_MIX_SIZE", default_value_t = 2048)]
        kernel_mix_size: usize,
        #[arg(long, overrides_with = "no_softmax_fp32")]
        softmax_fp32: bool,
        #[arg(long, overrides_with = "softmax_fp32")]
        no_softmax_fp32: bool,
        #[arg(long, env = "BENCH_WARMUP", default_value_t = 2)]
        warmup: usize,
        #[arg(long, env = "BENCH_ITERS", default_value_t = 5)]
        iters: usize,
    },
    /// All-reduce bandwidth/latency sweep across ranks.
    Multi {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "BENCH_ALLREDUCE_SIZES", default_value = "")]
        message_sizes: String,
        #[arg(long, env = "BENCH_ITERS", default_value_t = 5)]
        iters: usize,
    },
    /// Data-parallel training step of a linear layer.
    DdpStep {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "BENCH_DDP_BATCH", default_value_t = 64)]
        batch_size: usize,
        #[arg(long, env = "BENCH_DDP_INPUT", default_value_t = 4096)]
        input_size: usize,
        #[arg(long, env = "BENCH_DDP_OUTPUT", default_value_t = 4096)]
        output_size: usize,
        #[arg(long, env = "BENCH_DDP_DTYPE", default_value = "bfloat16")]
        dtype: String,
        #[arg(long, default_value_t = 3)]
        warmup: usize,
        #[arg(long, default_value_t = 10)]
        iters: usize,
    },
    /// A/B comparison; arguments are passed through to the compare script.
    Compare {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Validate a written result file against the embedded schema.
    SchemaValidate {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = bench_schemas::RESULT_SCHEMA)]
        schema: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());
    match run_command(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(1);
        }
    }
}

/// stderr subscriber. An explicit level wins over `RUST_LOG`; the fallback
/// is `warn` so stdout stays clean for wrappers.
fn setup_logging(level_override: Option<&str>) {
    let filter = match level_override.filter(|l| !l.trim().is_empty()) {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<i32> {
    match command {
        Commands::Check { out } => {
            let outcome =
                bench_runner::run_check_command(&ProcessEnv, &SystemCommandRunner, Utc::now());
            finish(outcome, &out)
        }
        Commands::Single {
            out,
            gemm_size,
            dtype,
            kernel_mix_size,
            softmax_fp32,
            no_softmax_fp32,
            warmup,
            iters,
        } => {
            let opts = SingleOptions {
                gemm_size,
                dtype: dtype.filter(|d| !d.trim().is_empty()),
                kernel_mix_size,
                softmax_fp32: resolve_softmax_fp32(&ProcessEnv, softmax_fp32, no_softmax_fp32),
                warmup,
                iters,
            };
            let mut backend = select_backend(&ProcessEnv);
            let outcome =
                bench_runner::run_single_command(&ProcessEnv, backend.as_mut(), &opts, Utc::now());
            finish(outcome, &out)
        }
        Commands::Multi {
            out,
            message_sizes,
            iters,
        } => {
            let sizes = bench_runner::ops::parse_message_sizes(&message_sizes);
            let mut backend = select_backend(&ProcessEnv);
            let mut bootstrap = DistributedBootstrap::new(ProcessEnv, SystemCommandRunner);
            let outcome = bench_runner::run_multi_command(
                &mut bootstrap,
                backend.as_mut(),
                &sizes,
                iters,
                Utc::now(),
            );
            finish(outcome, &out)
        }
        Commands::DdpStep {
            out,
            batch_size,
            input_size,
            output_size,
            dtype,
            warmup,
            iters,
        } => {
            let opts = DdpOptions {
                batch_size,
                input_size,
                output_size,
                dtype,
                warmup,
                iters,
            };
            let mut backend = select_backend(&ProcessEnv);
            let mut bootstrap = DistributedBootstrap::new(ProcessEnv, SystemCommandRunner);
            let outcome =
                bench_runner::run_ddp_step_command(&mut bootstrap, backend.as_mut(), &opts, Utc::now());
            finish(outcome, &out)
        }
        Commands::Compare { args } => run_compare(&ProcessEnv, &args),
        Commands::SchemaValidate { file, schema, json } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let errors = bench_schemas::validate_value(&schema, &value)?;
            if json {
                emit_json(&json!({
                    "ok": errors.is_empty(),
                    "file": file.display().to_string(),
                    "schema": schema,
                    "errors": errors,
                }));
            } else if errors.is_empty() {
                println!("valid: {}", file.display());
            } else {
                for e in &errors {
                    eprintln!("{}", e);
                }
            }
            Ok(if errors.is_empty() { 0 } else { 1 })
        }
    }
}

fn finish(outcome: CommandOutcome, out: &Path) -> Result<i32> {
    outcome
        .envelope
        .write(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    info!(out = %out.display(), exit_code = outcome.exit_code, "result written");
    println!("run_id: {}", outcome.envelope.run_id);
    println!("out: {}", out.display());
    Ok(outcome.exit_code)
}

/// Explicit flags win; otherwise `BENCH_KERNEL_MIX_SOFTMAX_FP32=0` turns the
/// float32 segment off.
fn resolve_softmax_fp32<E: EnvSource>(env: &E, on: bool, off: bool) -> bool {
    if off {
        return false;
    }
    if on {
        return true;
    }
    env.non_empty("BENCH_KERNEL_MIX_SOFTMAX_FP32")
        .map(|v| v.trim() != "0")
        .unwrap_or(true)
}

/// `host` (default) runs on the reference backend, `none` models a node
/// without a device, anything else is reported as a missing dependency.
fn select_backend<E: EnvSource>(env: &E) -> Option<HostBackend> {
    let name = env
        .non_empty("BENCH_COMPUTE_BACKEND")
        .unwrap_or_else(|| "host".to_string());
    match name.trim() {
        "host" => Some(HostBackend::new()),
        "none" => Some(HostBackend::without_device()),
        other => {
            warn!(backend = other, "compute backend not available");
            None
        }
    }
}

fn compare_script<E: EnvSource>(env: &E) -> Result<PathBuf> {
    if let Some(path) = env.non_empty("BENCH_COMPARE_SCRIPT") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe().context("failed to locate executable")?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join("compare.sh"))
}

/// Runs the compare script with inherited stdio and returns its exit code.
fn run_compare<E: EnvSource>(env: &E, args: &[String]) -> Result<i32> {
    let script = compare_script(env)?;
    info!(script = %script.display(), "running compare");
    match Command::new(&script).args(args).status() {
        Ok(status) => Ok(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("error: failed to run {}: {}", script.display(), err);
            Ok(bench_core::EXIT_NOT_FOUND)
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{{\"ok\":false,\"errors\":[\"failed to serialize JSON payload\"]}}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::MapEnv;

    #[test]
    fn softmax_flags_override_environment() {
        let off = MapEnv::new().with("BENCH_KERNEL_MIX_SOFTMAX_FP32", "0");
        assert!(!resolve_softmax_fp32(&off, false, false));
        assert!(resolve_softmax_fp32(&off, true, false));
        assert!(resolve_softmax_fp32(&MapEnv::new(), false, false));
        assert!(!resolve_softmax_fp32(&MapEnv::new(), false, true));
    }

    #[test]
    fn backend_selection_follows_environment() {
        assert!(select_backend(&MapEnv::new()).is_some());
        let none = MapEnv::new().with("BENCH_COMPUTE_BACKEND", "none");
        assert!(select_backend(&none).is_some());
        let cuda = MapEnv::new().with("BENCH_COMPUTE_BACKEND", "torch");
        assert!(select_backend(&cuda).is_none());
    }

    #[test]
    fn cli_parses_subcommands_and_passthrough_args() {
        let cli = Cli::try_parse_from(["bench", "compare", "a.json", "--baseline", "b.json"])
            .expect("parse");
        match cli.command {
            Commands::Compare { args } => assert_eq!(args, vec!["a.json", "--baseline", "b.json"]),
            _ => panic!("expected compare"),
        }
        let cli = Cli::try_parse_from(["bench", "single", "--out", "r.json", "--no-softmax-fp32"])
            .expect("parse");
        match cli.command {
            Commands::Single {
                no_softmax_fp32, ..
            } => assert!(no_softmax_fp32),
            _ => panic!("expected single"),
        }
        assert!(Cli::try_parse_from(["bench", "frobnicate"]).is_err());
    }

    #[test]
    fn compare_reports_127_when_script_is_missing() {
        let env = MapEnv::new().with("BENCH_COMPARE_SCRIPT", "/nonexistent/compare.sh");
        assert_eq!(run_compare(&env, &[]).expect("compare"), 127);
    }
}
