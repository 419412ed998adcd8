use crate::detect::{accelerator_count_from_env, accelerator_runtime_version, hostname_list};
use crate::ops::{CheckResult, DdpStepOutcome, MultiResult, SingleResult};
use anyhow::Result;
use bench_core::env::{first_non_empty, int_or, string_or};
use bench_core::{atomic_write_json_pretty, EnvSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub image_path: String,
    pub image_digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerContext {
    pub job_id: String,
    pub nodes: i64,
    pub ntasks: i64,
    pub ntasks_per_node: i64,
    pub gpus_per_node: i64,
    pub cpus_per_task: i64,
    pub distribution: String,
    pub cpu_bind: String,
    pub mpi_mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFacts {
    pub hostname_list: Vec<String>,
    pub partition: String,
    pub rocm_version: String,
    pub gpu_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsInfo {
    pub cache_root: String,
    pub results_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OptionalInfo {
    pub fn is_empty(&self) -> bool {
        self.git_rev.is_none()
            && self.template_name.is_none()
            && self.template_version.is_none()
            && self.warnings.is_empty()
            && self.notes.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Check(CheckResult),
    Single(SingleResult),
    Multi(MultiResult),
    DdpStep(DdpStepOutcome),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub schema_version: String,
    pub run_id: String,
    pub timestamp_utc: String,
    pub container: ContainerInfo,
    pub slurm: SchedulerContext,
    pub system: SystemFacts,
    pub paths: PathsInfo,
    pub tests: TestResult,
    #[serde(default, skip_serializing_if = "OptionalInfo::is_empty")]
    pub optional: OptionalInfo,
}

impl RunEnvelope {
    pub fn warnings(&self) -> &[String] {
        &self.optional.warnings
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json()?)
    }
}

pub fn utc_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Timestamp token used when no `RUN_ID` is supplied, e.g. `20250101T120000Z`.
pub fn default_run_id(now: DateTime<Utc>) -> String {
    utc_timestamp(now).replace([':', '-'], "")
}

#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    run_id: String,
    timestamp_utc: String,
    container: ContainerInfo,
    slurm: SchedulerContext,
    system: SystemFacts,
    paths: PathsInfo,
    optional: OptionalInfo,
}

impl EnvelopeBuilder {
    pub fn from_env<E: EnvSource + ?Sized>(env: &E, now: DateTime<Utc>) -> Self {
        Self {
            run_id: first_non_empty(env, &["RUN_ID"]).unwrap_or_else(|| default_run_id(now)),
            timestamp_utc: utc_timestamp(now),
            container: ContainerInfo {
                image_path: string_or(env, &["BENCH_CONTAINER_IMAGE", "CONTAINER_IMAGE"], ""),
                image_digest: string_or(env, &["BENCH_CONTAINER_DIGEST"], ""),
            },
            slurm: SchedulerContext {
                job_id: string_or(env, &["SLURM_JOB_ID"], ""),
                nodes: int_or(env, &["BENCH_NODES", "SLURM_NNODES"], 0),
                ntasks: int_or(env, &["SLURM_NTASKS"], 0),
                ntasks_per_node: int_or(env, &["BENCH_NTASKS_PER_NODE"], 0),
                gpus_per_node: int_or(env, &["BENCH_GPUS_PER_NODE", "SLURM_GPUS_PER_NODE"], 0),
                cpus_per_task: int_or(env, &["BENCH_CPUS_PER_TASK", "SLURM_CPUS_PER_TASK"], 0),
                distribution: string_or(env, &["BENCH_DIST"], ""),
                cpu_bind: string_or(env, &["BENCH_CPU_BIND"], ""),
                mpi_mode: string_or(env, &["BENCH_MPI_MODE"], ""),
            },
            system: SystemFacts {
                hostname_list: hostname_list(env),
                partition: string_or(env, &["BENCH_PARTITION", "SLURM_JOB_PARTITION"], ""),
                rocm_version: accelerator_runtime_version(env),
                gpu_count: accelerator_count_from_env(env),
            },
            paths: PathsInfo {
                cache_root: string_or(env, &["BENCH_CACHE_ROOT"], ""),
                results_dir: string_or(env, &["BENCH_RESULTS_DIR"], ""),
            },
            optional: OptionalInfo {
                git_rev: first_non_empty(env, &["BENCH_GIT_REV"]),
                template_name: first_non_empty(env, &["BENCH_TEMPLATE_NAME"]),
                template_version: first_non_empty(env, &["BENCH_TEMPLATE_VERSION"]),
                warnings: Vec::new(),
                notes: first_non_empty(env, &["BENCH_NOTES"]),
            },
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cache_root(&self) -> &str {
        &self.paths.cache_root
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(warning = %message, "benchmark warning");
        self.optional.warnings.push(message);
    }

    pub fn finish(self, tests: TestResult) -> RunEnvelope {
        RunEnvelope {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: self.run_id,
            timestamp_utc: self.timestamp_utc,
            container: self.container,
            slurm: self.slurm,
            system: self.system,
            paths: self.paths,
            tests,
            optional: self.optional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{CheckDetails, CheckStatus, GemmSummary, KernelMixSummary};
    use bench_core::MapEnv;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).single().expect("valid time")
    }

    fn cluster_env() -> MapEnv {
        MapEnv::new()
            .with("SLURM_JOB_ID", "4242")
            .with("SLURM_NNODES", "2")
            .with("BENCH_NODES", "")
            .with("SLURM_NTASKS", "16")
            .with("BENCH_NTASKS_PER_NODE", "8")
            .with("SLURM_GPUS_PER_NODE", "8")
            .with("SLURM_CPUS_PER_TASK", "7")
            .with("BENCH_DIST", "block:cyclic")
            .with("BENCH_CPU_BIND", "mask_cpu")
            .with("BENCH_MPI_MODE", "host")
            .with("SLURM_JOB_PARTITION", "standard-g")
            .with("SLURM_NODELIST", "nid[005000-005001]")
            .with("SLURM_GPUS_ON_NODE", "8")
            .with("ROCM_VERSION", "6.0.3")
            .with("CONTAINER_IMAGE", "/images/bench.sif")
            .with("BENCH_CACHE_ROOT", "/scratch/cache")
    }

    fn sample_single() -> TestResult {
        TestResult::Single(SingleResult {
            gemm: GemmSummary {
                dtype: "bfloat16".to_string(),
                tflops: Some(1.5),
                latency_p50_ms: Some(0.25),
                latency_p95_ms: Some(0.5),
            },
            kernel_mix: KernelMixSummary {
                latency_p50_ms: None,
                latency_p95_ms: None,
            },
        })
    }

    #[test]
    fn base_payload_merges_scheduler_and_system_facts() {
        let envelope = EnvelopeBuilder::from_env(&cluster_env(), fixed_now()).finish(sample_single());
        assert_eq!(envelope.schema_version, "1.0");
        assert_eq!(envelope.run_id, "20250304T050607Z");
        assert_eq!(envelope.timestamp_utc, "2025-03-04T05:06:07Z");
        assert_eq!(envelope.container.image_path, "/images/bench.sif");
        assert_eq!(envelope.slurm.nodes, 2);
        assert_eq!(envelope.slurm.ntasks, 16);
        assert_eq!(envelope.slurm.gpus_per_node, 8);
        assert_eq!(envelope.slurm.cpus_per_task, 7);
        assert_eq!(envelope.system.hostname_list, vec!["nid[005000-005001]".to_string()]);
        assert_eq!(envelope.system.partition, "standard-g");
        assert_eq!(envelope.system.gpu_count, 8);
        assert_eq!(envelope.paths.cache_root, "/scratch/cache");
        assert!(envelope.optional.is_empty());
    }

    #[test]
    fn explicit_run_id_wins() {
        let env = MapEnv::new().with("RUN_ID", "nightly-7");
        let builder = EnvelopeBuilder::from_env(&env, fixed_now());
        assert_eq!(builder.run_id(), "nightly-7");
    }

    #[test]
    fn warnings_land_in_optional_block() {
        let mut builder = EnvelopeBuilder::from_env(&MapEnv::new(), fixed_now());
        builder.add_warning("single: accelerator device not available");
        let value = builder.finish(sample_single()).to_json().expect("json");
        assert_eq!(
            value["optional"]["warnings"],
            serde_json::json!(["single: accelerator device not available"])
        );
        assert!(value["optional"].get("git_rev").is_none());
    }

    #[test]
    fn serialized_envelope_round_trips() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("out").join("single.json");
        let mut builder = EnvelopeBuilder::from_env(&cluster_env(), fixed_now());
        builder.add_warning("single: kernel_mix accelerator device not available");
        let envelope = builder.finish(sample_single());
        envelope.write(&path).expect("write");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("{\n  \"container\": {"), "keys not sorted:\n{}", text);
        let parsed: RunEnvelope = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.schema_version, envelope.schema_version);
        assert_eq!(parsed.run_id, envelope.run_id);
        assert_eq!(parsed.tests, envelope.tests);
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn envelopes_validate_against_embedded_schema() {
        let check = TestResult::Check(CheckResult {
            status: CheckStatus::Fail,
            details: CheckDetails {
                rocm_info_tool: String::new(),
                rocm_info_exit_code: 127,
                rocm_info_snippet: None,
                rocm_info_error: Some("rocminfo/rocm-smi not available".to_string()),
                cache_root_writable: None,
                cache_root_error: None,
                rocm_version: String::new(),
                gpu_count_env: 0,
            },
        });
        let ddp = TestResult::DdpStep(DdpStepOutcome::Failed {
            error: "distributed init failed: missing rank/world".to_string(),
        });
        for tests in [check, sample_single(), ddp] {
            let value = EnvelopeBuilder::from_env(&cluster_env(), fixed_now())
                .finish(tests)
                .to_json()
                .expect("json");
            let errors = bench_schemas::validate_value(bench_schemas::RESULT_SCHEMA, &value)
                .expect("validate");
            assert!(errors.is_empty(), "schema errors: {:?}", errors);
        }
    }
}
