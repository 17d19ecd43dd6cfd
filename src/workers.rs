//! Worker pool sizing for the content engine.
//!
//! Each parallel stage (bundle building, fullfile generation, delta/pack
//! generation) gets its own pool size. A request of 1 or more is taken
//! verbatim; anything else means "use every CPU the host offers".

use std::num::NonZeroUsize;

/// Source of the host's available parallelism.
pub trait Parallelism {
    fn available(&self) -> usize;
}

/// Queries the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostParallelism;

impl Parallelism for HostParallelism {
    fn available(&self) -> usize {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

/// Fixed parallelism, for tests and reproducible runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedParallelism(pub usize);

impl Parallelism for FixedParallelism {
    fn available(&self) -> usize {
        self.0.max(1)
    }
}

/// Effective pool size for a requested size.
pub fn resolve(requested: i64, host: &dyn Parallelism) -> usize {
    if requested >= 1 {
        usize::try_from(requested).unwrap_or(usize::MAX)
    } else {
        host.available()
    }
}

/// Pool sizes as requested on the command line (0 = host default).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerRequest {
    pub fullfile: i64,
    pub delta: i64,
    pub bundle: i64,
}

/// Resolved pool sizes, fixed for the rest of the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub fullfile_workers: usize,
    pub delta_workers: usize,
    pub bundle_workers: usize,
}

impl WorkerPoolConfig {
    pub fn resolve(request: WorkerRequest, host: &dyn Parallelism) -> Self {
        let config = Self {
            fullfile_workers: resolve(request.fullfile, host),
            delta_workers: resolve(request.delta, host),
            bundle_workers: resolve(request.bundle, host),
        };
        tracing::debug!(
            fullfile = config.fullfile_workers,
            delta = config.delta_workers,
            bundle = config.bundle_workers,
            "resolved worker pools"
        );
        config
    }
}
