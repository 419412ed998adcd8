use crate::backend::{ComputeBackend, Rendezvous};
use crate::detect::NODELIST_VAR;
use crate::error::BenchError;
use bench_core::env::int_or;
use bench_core::{CommandRunner, EnvSource};
use tracing::{debug, info};

pub const DEFAULT_MASTER_PORT: u16 = 29500;
pub const DEFAULT_COLLECTIVE: &str = "nccl";
const HOSTNAME_RESOLVER: &str = "scontrol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
    pub backend: String,
    pub master_addr: String,
    pub master_port: u16,
}

/// `(rank, world)` from the launcher or scheduler variables; `-1` marks a
/// value that could not be resolved.
pub fn resolve_rank_and_world<E: EnvSource + ?Sized>(env: &E) -> (i64, i64) {
    let rank = int_or(env, &["RANK", "SLURM_PROCID"], -1);
    let world = int_or(env, &["WORLD_SIZE", "SLURM_NTASKS"], -1);
    (rank, world)
}

pub fn local_rank<E: EnvSource + ?Sized>(env: &E) -> i64 {
    int_or(env, &["LOCAL_RANK", "SLURM_LOCALID"], 0)
}

/// First host of a scheduler node list such as `node[01-04,07]` (-> `node01`)
/// or `nodeA,nodeB` (-> `nodeA`).
pub fn first_host_from_compact_notation(notation: &str) -> Option<String> {
    let notation = notation.trim();
    if notation.is_empty() {
        return None;
    }
    let entry = first_top_level_entry(notation);
    let host = match entry.split_once('[') {
        None => entry.to_string(),
        Some((prefix, rest)) => {
            let inside = rest.split(']').next().unwrap_or("");
            let first = inside.split(',').next().unwrap_or("");
            let start = first.split('-').next().unwrap_or("");
            format!("{}{}", prefix, start.trim())
        }
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn first_top_level_entry(notation: &str) -> &str {
    let mut depth = 0usize;
    for (idx, ch) in notation.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => return &notation[..idx],
            _ => {}
        }
    }
    notation
}

/// Rendezvous host derived from the node list: first line printed by the
/// scheduler's hostname resolver when it is installed and succeeds,
/// otherwise the first host parsed from the compact notation.
pub fn master_address<E, R>(env: &E, runner: &R) -> Option<String>
where
    E: EnvSource + ?Sized,
    R: CommandRunner + ?Sized,
{
    let nodelist = env.non_empty(NODELIST_VAR)?;
    if runner.which(HOSTNAME_RESOLVER).is_some() {
        let out = runner.run(HOSTNAME_RESOLVER, &["show", "hostnames", nodelist.as_str()]);
        if out.exit_code == 0 {
            if let Some(first) = out.stdout.lines().next().map(str::trim) {
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
        debug!(exit_code = out.exit_code, "hostname resolver gave no host; parsing node list");
    }
    first_host_from_compact_notation(&nodelist)
}

/// Owns the process-level "communication group is up" state.
///
/// Operations that need collectives take the bootstrap by `&mut` and call
/// [`DistributedBootstrap::ensure_initialized`]; the group is created at most
/// once per process. Missing `MASTER_ADDR`/`MASTER_PORT` values are written
/// back to the environment so that child libraries see the same rendezvous.
pub struct DistributedBootstrap<E, R> {
    env: E,
    runner: R,
    context: Option<DistributedContext>,
}

impl<E: EnvSource, R: CommandRunner> DistributedBootstrap<E, R> {
    pub fn new(env: E, runner: R) -> Self {
        Self {
            env,
            runner,
            context: None,
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn context(&self) -> Option<&DistributedContext> {
        self.context.as_ref()
    }

    pub fn ensure_initialized<B: ComputeBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<DistributedContext, BenchError> {
        if let Some(ctx) = &self.context {
            if backend.process_group_initialized() {
                return Ok(ctx.clone());
            }
        }
        if backend.process_group_initialized() {
            let ctx = self.adopt_existing_group(backend);
            debug!(rank = ctx.rank, world_size = ctx.world_size, "process group already up");
            self.context = Some(ctx.clone());
            return Ok(ctx);
        }

        let (rank, world) = resolve_rank_and_world(&self.env);
        if rank < 0 || world < 1 {
            return Err(init_failure("missing rank/world"));
        }

        let master_addr = match self.env.non_empty("MASTER_ADDR") {
            Some(addr) => addr,
            None => {
                let addr = master_address(&self.env, &self.runner)
                    .ok_or_else(|| init_failure("missing MASTER_ADDR"))?;
                self.env.set("MASTER_ADDR", &addr);
                addr
            }
        };
        let master_port = match self.env.non_empty("MASTER_PORT") {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| init_failure(&format!("invalid MASTER_PORT: {}", port)))?,
            None => {
                self.env.set("MASTER_PORT", &DEFAULT_MASTER_PORT.to_string());
                DEFAULT_MASTER_PORT
            }
        };
        let collective = self
            .env
            .non_empty("BENCH_DIST_BACKEND")
            .unwrap_or_else(|| DEFAULT_COLLECTIVE.to_string());

        let rendezvous = Rendezvous {
            master_addr: master_addr.clone(),
            master_port,
        };
        info!(
            rank,
            world,
            collective = %collective,
            master = %master_addr,
            port = master_port,
            "initializing process group"
        );
        backend
            .init_process_group(&collective, rank as usize, world as usize, &rendezvous)
            .map_err(|e| init_failure(&e.to_string()))?;

        let ctx = DistributedContext {
            rank: rank as usize,
            world_size: world as usize,
            backend: collective,
            master_addr,
            master_port,
        };
        self.context = Some(ctx.clone());
        Ok(ctx)
    }

    fn adopt_existing_group<B: ComputeBackend>(&self, backend: &B) -> DistributedContext {
        let (env_rank, env_world) = resolve_rank_and_world(&self.env);
        DistributedContext {
            rank: backend
                .group_rank()
                .unwrap_or_else(|| env_rank.max(0) as usize),
            world_size: backend
                .group_world_size()
                .unwrap_or_else(|| env_world.max(1) as usize),
            backend: self
                .env
                .non_empty("BENCH_DIST_BACKEND")
                .unwrap_or_else(|| DEFAULT_COLLECTIVE.to_string()),
            master_addr: self.env.non_empty("MASTER_ADDR").unwrap_or_default(),
            master_port: self
                .env
                .non_empty("MASTER_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_MASTER_PORT),
        }
    }
}

fn init_failure(msg: &str) -> BenchError {
    BenchError::DistributedInitFailure(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;
    use crate::testing::FakeCommandRunner;
    use bench_core::{CommandOutput, MapEnv};

    #[test]
    fn compact_notation_takes_first_range_start() {
        assert_eq!(
            first_host_from_compact_notation("node[01-04,07]"),
            Some("node01".to_string())
        );
        assert_eq!(
            first_host_from_compact_notation("nid[005,010-012]"),
            Some("nid005".to_string())
        );
        assert_eq!(
            first_host_from_compact_notation("gpu[3]"),
            Some("gpu3".to_string())
        );
    }

    #[test]
    fn compact_notation_plain_list_takes_first_host() {
        assert_eq!(
            first_host_from_compact_notation("nodeA,nodeB"),
            Some("nodeA".to_string())
        );
        assert_eq!(
            first_host_from_compact_notation("solo"),
            Some("solo".to_string())
        );
    }

    #[test]
    fn compact_notation_mixed_list_uses_first_entry() {
        assert_eq!(
            first_host_from_compact_notation("login1,gpu[10-11]"),
            Some("login1".to_string())
        );
        assert_eq!(
            first_host_from_compact_notation("gpu[10-11],cpu[1-2]"),
            Some("gpu10".to_string())
        );
    }

    #[test]
    fn compact_notation_empty_is_none() {
        assert_eq!(first_host_from_compact_notation(""), None);
        assert_eq!(first_host_from_compact_notation("   "), None);
    }

    #[test]
    fn rank_and_world_prefer_launcher_variables() {
        let env = MapEnv::new()
            .with("RANK", "3")
            .with("SLURM_PROCID", "1")
            .with("SLURM_NTASKS", "8");
        assert_eq!(resolve_rank_and_world(&env), (3, 8));
        assert_eq!(resolve_rank_and_world(&MapEnv::new()), (-1, -1));
    }

    #[test]
    fn master_address_uses_resolver_first_line() {
        let env = MapEnv::new().with("SLURM_NODELIST", "nid[001-002]");
        let runner = FakeCommandRunner::new().with_tool(
            "scontrol",
            CommandOutput {
                exit_code: 0,
                stdout: "  nid001  \nnid002\n".to_string(),
                stderr: String::new(),
            },
        );
        assert_eq!(master_address(&env, &runner), Some("nid001".to_string()));
        assert_eq!(
            runner.calls(),
            vec![vec![
                "scontrol".to_string(),
                "show".to_string(),
                "hostnames".to_string(),
                "nid[001-002]".to_string()
            ]]
        );
    }

    #[test]
    fn master_address_falls_back_when_resolver_fails_or_is_absent() {
        let env = MapEnv::new().with("SLURM_NODELIST", "nid[007-009]");
        let failing = FakeCommandRunner::new().with_tool(
            "scontrol",
            CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "slurm_load_partitions: Unable to contact slurm controller".to_string(),
            },
        );
        assert_eq!(master_address(&env, &failing), Some("nid007".to_string()));
        assert_eq!(
            master_address(&env, &FakeCommandRunner::new()),
            Some("nid007".to_string())
        );
        assert_eq!(master_address(&MapEnv::new(), &FakeCommandRunner::new()), None);
    }

    #[test]
    fn ensure_initialized_fails_without_rank_or_world() {
        let mut bootstrap = DistributedBootstrap::new(MapEnv::new(), FakeCommandRunner::new());
        let mut backend = HostBackend::new();
        let err = bootstrap
            .ensure_initialized(&mut backend)
            .expect_err("no rank/world");
        assert_eq!(err.to_string(), "distributed init failed: missing rank/world");
        assert!(!backend.process_group_initialized());
    }

    #[test]
    fn ensure_initialized_fails_without_any_master_address() {
        let env = MapEnv::new().with("RANK", "0").with("WORLD_SIZE", "1");
        let mut bootstrap = DistributedBootstrap::new(env, FakeCommandRunner::new());
        let err = bootstrap
            .ensure_initialized(&mut HostBackend::new())
            .expect_err("no master");
        assert_eq!(err.to_string(), "distributed init failed: missing MASTER_ADDR");
    }

    #[test]
    fn ensure_initialized_derives_rendezvous_and_is_idempotent() {
        let env = MapEnv::new()
            .with("SLURM_PROCID", "0")
            .with("SLURM_NTASKS", "1")
            .with("SLURM_NODELIST", "node[01-04,07]");
        let mut bootstrap = DistributedBootstrap::new(env, FakeCommandRunner::new());
        let mut backend = HostBackend::new();

        let ctx = bootstrap.ensure_initialized(&mut backend).expect("init");
        assert_eq!(
            ctx,
            DistributedContext {
                rank: 0,
                world_size: 1,
                backend: "nccl".to_string(),
                master_addr: "node01".to_string(),
                master_port: 29500,
            }
        );
        assert_eq!(bootstrap.env().non_empty("MASTER_ADDR"), Some("node01".to_string()));
        assert_eq!(bootstrap.env().non_empty("MASTER_PORT"), Some("29500".to_string()));

        let again = bootstrap.ensure_initialized(&mut backend).expect("second call");
        assert_eq!(again, ctx);
        assert_eq!(bootstrap.context(), Some(&ctx));
    }

    #[test]
    fn ensure_initialized_adopts_group_started_elsewhere() {
        let mut backend = HostBackend::new();
        backend
            .init_process_group(
                "gloo",
                0,
                1,
                &Rendezvous {
                    master_addr: "127.0.0.1".to_string(),
                    master_port: 29501,
                },
            )
            .expect("pre-init");
        let mut bootstrap = DistributedBootstrap::new(MapEnv::new(), FakeCommandRunner::new());
        let ctx = bootstrap.ensure_initialized(&mut backend).expect("adopt");
        assert_eq!((ctx.rank, ctx.world_size), (0, 1));
        assert_eq!(bootstrap.env().non_empty("MASTER_ADDR"), None);
    }

    #[test]
    fn backend_init_errors_are_wrapped() {
        let env = MapEnv::new()
            .with("RANK", "0")
            .with("WORLD_SIZE", "1")
            .with("MASTER_ADDR", "127.0.0.1")
            .with("MASTER_PORT", "29502")
            .with("BENCH_DIST_BACKEND", "mpi");
        let mut bootstrap = DistributedBootstrap::new(env, FakeCommandRunner::new());
        let err = bootstrap
            .ensure_initialized(&mut HostBackend::new())
            .expect_err("unknown collective");
        assert_eq!(
            err.to_string(),
            "distributed init failed: unknown collective backend: mpi"
        );
        assert!(bootstrap.context().is_none());
    }

    #[test]
    fn invalid_master_port_is_an_init_failure() {
        let env = MapEnv::new()
            .with("RANK", "0")
            .with("WORLD_SIZE", "1")
            .with("MASTER_ADDR", "127.0.0.1")
            .with("MASTER_PORT", "http");
        let mut bootstrap = DistributedBootstrap::new(env, FakeCommandRunner::new());
        let err = bootstrap
            .ensure_initialized(&mut HostBackend::new())
            .expect_err("bad port");
        assert_eq!(err.to_string(), "distributed init failed: invalid MASTER_PORT: http");
    }
}
