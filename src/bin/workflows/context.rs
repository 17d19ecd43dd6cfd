use anyhow::{Context, Result};
use mix_builder::engine::{resolve_engine_binary, CommandEngine};
use mix_builder::preflight::{check_required_tools, BuildCommand};
use mix_builder::runs::{self, BuildJournal};
use mix_builder::workers::{HostParallelism, WorkerPoolConfig, WorkerRequest};
use mix_builder::MixConfig;
use std::path::Path;

/// Run directories kept after each invocation.
const KEEP_RUNS: usize = 50;

/// Everything resolved once per invocation.
pub(crate) struct BuildContext {
    pub(crate) config: MixConfig,
    pub(crate) engine: CommandEngine,
    skip_preflight: bool,
}

impl BuildContext {
    pub(crate) fn load(
        config_path: Option<&Path>,
        workers: WorkerRequest,
        skip_preflight: bool,
    ) -> Result<Self> {
        let path = MixConfig::locate(config_path);
        let config = MixConfig::load(&path)
            .with_context(|| format!("loading builder config '{}'", path.display()))?;
        let workers = WorkerPoolConfig::resolve(workers, &HostParallelism);
        let program = resolve_engine_binary(&config.engine)
            .with_context(|| format!("resolving content engine '{}'", config.engine))?;
        let engine = CommandEngine::new(program, &config.server_state_dir, workers);
        Ok(Self {
            config,
            engine,
            skip_preflight,
        })
    }

    pub(crate) fn preflight(&self, command: BuildCommand) -> Result<()> {
        if self.skip_preflight {
            tracing::warn!(?command, "skipping host tool checks");
            return Ok(());
        }
        check_required_tools(command.required_tools())
            .with_context(|| format!("preflight for {command:?}"))
    }

    /// Run `f` inside a fresh build journal named after `command`.
    pub(crate) fn journaled<T>(
        &self,
        command: &str,
        f: impl FnOnce(&BuildJournal) -> mix_builder::Result<T>,
    ) -> Result<T> {
        let root = runs::runs_root(&self.config.server_state_dir);
        let journal = BuildJournal::start(&root, command)
            .with_context(|| format!("starting build journal under '{}'", root.display()))?;
        tracing::debug!(run_id = %journal.run_id(), command, "build journal started");

        let result = f(&journal);
        journal
            .finish(result.is_ok())
            .with_context(|| format!("closing build journal '{}'", journal.dir().display()))?;
        let value = result.with_context(|| format!("'{command}' failed (run {})", journal.run_id()))?;

        let pruned = runs::prune_old_runs(&root, KEEP_RUNS).context("pruning old build journals")?;
        if pruned > 0 {
            tracing::debug!(pruned, "removed expired build journals");
        }
        Ok(value)
    }
}
