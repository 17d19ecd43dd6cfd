//! Format-bump protocol.
//!
//! Crossing an incompatible format boundary publishes the same content twice:
//!
//! - `L+10` ("old" build): the last build in the original format. Its
//!   manifests are produced by tooling that old clients understand.
//! - `L+20` ("new" build): the first build in the new format, with identical
//!   content.
//!
//! Both record `L` as their predecessor, so clients on `L` see one hop. The
//! bundles are built once, under `L+20` with the new format marker baked in,
//! and the `L+20` tree is aliased into `L+10` through the content store.
//!
//! Each phase starts by reloading persisted state, so a failed phase can be
//! re-run by the operator once the cause is fixed. If the old phase fails
//! after its update was published, the predecessor marker must be reset to
//! `L` by hand before re-running it.

mod session;

pub use session::FormatBumpSession;

use crate::bundles;
use crate::config::MixConfig;
use crate::content_store::ContentStore;
use crate::engine::ContentEngine;
use crate::error::{MixError, Result};
use crate::history;
use crate::runs::BuildJournal;
use crate::sequencer::{StageSequencer, UpdateFlags};
use crate::state::{stride_after, MixState};
use std::cmp::Ordering;

/// Upper bound on old/new pairs in one chained run.
pub const MAX_CHAINED_BUMPS: usize = 64;

/// Where a bump pair stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpPhase {
    Idle,
    OldPhase,
    NewPhase,
    Done,
}

impl BumpPhase {
    pub fn next(self) -> Self {
        match self {
            BumpPhase::Idle => BumpPhase::OldPhase,
            BumpPhase::OldPhase => BumpPhase::NewPhase,
            BumpPhase::NewPhase | BumpPhase::Done => BumpPhase::Done,
        }
    }
}

/// Flags shared by both phases.
#[derive(Debug, Clone, Default)]
pub struct BumpOptions {
    pub update: UpdateFlags,
    pub clean: bool,
}

/// Outcome of a chained upstream crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingSummary {
    pub pairs: usize,
    pub mix_version: u32,
}

pub struct FormatBumpOrchestrator<'a> {
    engine: &'a dyn ContentEngine,
    config: &'a MixConfig,
    options: BumpOptions,
    journal: Option<&'a BuildJournal>,
}

impl<'a> FormatBumpOrchestrator<'a> {
    pub fn new(engine: &'a dyn ContentEngine, config: &'a MixConfig, options: BumpOptions) -> Self {
        Self {
            engine,
            config,
            options,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a BuildJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn sequencer(&self) -> StageSequencer<'a> {
        let sequencer = StageSequencer::new(self.engine, self.config);
        match self.journal {
            Some(journal) => sequencer.with_journal(journal),
            None => sequencer,
        }
    }

    fn step<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.journal {
            Some(journal) => journal.record(name, f),
            None => f(),
        }
    }

    /// Build `L+20` content in the new format, alias it into `L+10`, publish
    /// `L+10` in the original format, and reset the predecessor marker to `L`.
    pub fn old_phase(&self, new_format: &str) -> Result<FormatBumpSession> {
        FormatBumpSession::validate_format(new_format)?;
        let state_path = &self.config.state_file;
        let image_dir = self.config.image_dir();
        let mut state = MixState::load(state_path)?;
        let last = history::read_last_version(&image_dir)?;
        let session = FormatBumpSession::derive(last, &state, new_format)?;
        tracing::info!(
            original = session.original_version,
            old = session.old_version,
            new = session.new_version,
            old_format = %session.old_format,
            new_format = %session.new_format,
            "format bump: old phase"
        );

        let sequencer = self.sequencer();
        state.with_scoped_override(session.new_version, &session.new_format, |scoped| {
            sequencer.run_bundles(scoped, self.options.update.skip_signing, self.options.clean)
        })?;

        let new_tree = self.config.version_tree(session.new_version);
        let old_tree = self.config.version_tree(session.old_version);
        bundles::replace_with_placeholders(&new_tree, &state.deleted_bundles())?;

        match state.mix_version.cmp(&session.old_version) {
            Ordering::Less => state.advance_version(session.old_version)?,
            Ordering::Equal => {}
            Ordering::Greater => {
                return Err(MixError::state(format!(
                    "mix version {} is already past the bump slot {}",
                    state.mix_version, session.old_version
                )))
            }
        }
        state.save(state_path)?;

        let store = ContentStore::open(&self.config.server_state_dir)?;
        self.step("content-clone", || {
            store.clone_version_tree(
                &new_tree,
                session.new_version,
                &old_tree,
                session.old_version,
            )?;
            store.verify_clone(&new_tree, &old_tree)
        })?;

        let params = self
            .options
            .update
            .parameters_with(self.options.update.min_version, &session.old_format);
        sequencer.run_update(&state, &params)?;

        history::write_last_version(&image_dir, session.original_version)?;
        Ok(session)
    }

    /// Move to `L+20`, switch the format for good, drop deleted bundles, and
    /// publish `L+20` in the new format.
    pub fn new_phase(&self, new_format: &str) -> Result<u32> {
        FormatBumpSession::validate_format(new_format)?;
        let new_format = new_format.trim();
        let state_path = &self.config.state_file;
        let mut state = MixState::load(state_path)?;
        let old_version = state.mix_version;

        let marker = history::read_last_version(&self.config.image_dir())?;
        if stride_after(marker)? != old_version {
            return Err(MixError::state(format!(
                "predecessor marker {marker} does not precede mix version {old_version}; \
                 run the old phase first"
            )));
        }

        let new_version = state.next_version()?;
        tracing::info!(
            old = old_version,
            new = new_version,
            previous = marker,
            new_format = %new_format,
            "format bump: new phase"
        );
        state.advance_version(new_version)?;
        state.set_format_permanent(new_format)?;
        let dropped = state.drop_deleted_bundles();
        state.save(state_path)?;

        if let Some(groups_ini) = &self.config.groups_ini {
            bundles::drop_from_groups_ini(groups_ini, &dropped)?;
        }
        if !dropped.is_empty() {
            tracing::info!(bundles = ?dropped, "dropped deleted bundles from registry");
        }

        let params = self.options.update.parameters_with(new_version, new_format);
        self.sequencer().run_update(&state, &params)?;
        Ok(new_version)
    }

    /// Perform `phase` and return the phase that follows it.
    pub fn advance(&self, phase: BumpPhase, new_format: &str, crossing: bool) -> Result<BumpPhase> {
        match phase {
            BumpPhase::Idle | BumpPhase::Done => {}
            BumpPhase::OldPhase => {
                self.step("old-phase", || self.old_phase(new_format))?;
                if crossing {
                    self.pin_upstream()?;
                }
            }
            BumpPhase::NewPhase => {
                self.step("new-phase", || self.new_phase(new_format))?;
                if crossing {
                    self.unpin_upstream()?;
                }
            }
        }
        Ok(phase.next())
    }

    /// One old/new pair.
    pub fn run_pair(&self, new_format: &str) -> Result<()> {
        self.drive(new_format, false)
    }

    fn drive(&self, new_format: &str, crossing: bool) -> Result<()> {
        let mut phase = BumpPhase::Idle;
        while phase != BumpPhase::Done {
            phase = self.advance(phase, new_format, crossing)?;
        }
        Ok(())
    }

    /// Run old/new pairs until the engine reports the mix has caught up with
    /// the upstream, then open a fresh slot for the next ordinary build.
    ///
    /// The first pair always runs; `bump_needed` is asked after each pair.
    pub fn run_upstream_crossing(&self, new_format: &str) -> Result<CrossingSummary> {
        FormatBumpSession::validate_format(new_format)?;
        let state_path = &self.config.state_file;
        let mut pairs = 0usize;
        loop {
            self.drive(new_format, true)?;
            pairs += 1;
            let state = MixState::load(state_path)?;
            if !self.engine.bump_needed(&state)? {
                break;
            }
            if pairs >= MAX_CHAINED_BUMPS {
                return Err(MixError::state(format!(
                    "upstream still needs a format bump after {MAX_CHAINED_BUMPS} pairs"
                )));
            }
        }

        let mut state = MixState::load(state_path)?;
        let next = state.next_version()?;
        state.advance_version(next)?;
        state.save(state_path)?;
        tracing::info!(pairs, version = state.mix_version, "upstream format crossing finished");
        Ok(CrossingSummary {
            pairs,
            mix_version: state.mix_version,
        })
    }

    /// Point the upstream at the last release of the current format.
    fn pin_upstream(&self) -> Result<()> {
        let state_path = &self.config.state_file;
        let mut state = MixState::load(state_path)?;
        let pinned = self.engine.latest_upstream_in_format(&state)?;
        tracing::info!(upstream = %pinned, "pinning upstream to format boundary");
        state.stage_upstream(&pinned);
        state.save(state_path)
    }

    fn unpin_upstream(&self) -> Result<()> {
        let state_path = &self.config.state_file;
        let mut state = MixState::load(state_path)?;
        if state.unstage_upstream() {
            state.save(state_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order() {
        let mut phase = BumpPhase::Idle;
        let mut seen = vec![phase];
        while phase != BumpPhase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                BumpPhase::Idle,
                BumpPhase::OldPhase,
                BumpPhase::NewPhase,
                BumpPhase::Done
            ]
        );
        assert_eq!(BumpPhase::Done.next(), BumpPhase::Done);
    }
}
