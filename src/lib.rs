//! Release build orchestration for layered OS mixes.
//!
//! A mix is a derivative OS published as numbered versions of bundle content.
//! This crate sequences the steps that turn a mix state into published
//! content, leaving the content itself to an external engine:
//!
//! - **State** - persisted version, format, upstream pointer and bundle registry
//! - **Sequencer** - bundles, update content and images in a fixed order
//! - **Delta packs** - which `(from, to)` packs to build
//! - **Format bumps** - the two-build protocol for crossing a format boundary
//! - **Content store** - hard-link aliasing of version trees
//!
//! # Architecture
//!
//! ```text
//! mix-builder (binary)
//!     │
//!     ├── config ──── builder.toml
//!     ├── workers ─── pool sizes for the engine
//!     └── runs ────── per-invocation journal
//!           │
//!           ▼
//! FormatBumpOrchestrator ──▶ StageSequencer ──▶ ContentEngine (external)
//!     │                                             ▲
//!     ├── state (MixState snapshots)                │
//!     ├── content_store (alias L+20 into L+10)      │
//!     └── history (LAST_VER, Manifest.MoM) ◀── DeltaPackRangeResolver
//! ```

pub mod bump;
pub mod bundles;
pub mod config;
pub mod content_store;
pub mod delta;
pub mod engine;
pub mod error;
pub mod history;
pub mod preflight;
pub mod runs;
pub mod sequencer;
pub mod state;
pub mod workers;

pub use bump::{BumpOptions, BumpPhase, CrossingSummary, FormatBumpOrchestrator, FormatBumpSession};
pub use config::MixConfig;
pub use content_store::ContentStore;
pub use delta::{DeltaPackRangeResolver, DeltaPackRequest, DeltaPair};
pub use engine::{BundleBuild, CommandEngine, ContentEngine, SigningMaterial, UpdateParameters};
pub use error::{MixError, Result};
pub use history::{ManifestHistory, VersionHistory};
pub use runs::BuildJournal;
pub use sequencer::{AllOptions, StageSequencer, UpdateFlags};
pub use state::{BundleEntry, BundleStatus, MixState, VERSION_STRIDE};
pub use workers::{HostParallelism, Parallelism, WorkerPoolConfig, WorkerRequest};
