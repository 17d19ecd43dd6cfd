use super::BuildContext;
use anyhow::Result;
use mix_builder::preflight::BuildCommand;
use mix_builder::{
    AllOptions, BumpOptions, DeltaPackRangeResolver, DeltaPackRequest, FormatBumpOrchestrator,
    ManifestHistory, MixState, StageSequencer, UpdateFlags,
};
use std::path::Path;

pub(crate) fn build_bundles(ctx: &BuildContext, clean: bool, no_signing: bool) -> Result<()> {
    ctx.preflight(BuildCommand::Bundles)?;
    ctx.journaled("build bundles", |journal| {
        let state = MixState::load(&ctx.config.state_file)?;
        StageSequencer::new(&ctx.engine, &ctx.config)
            .with_journal(journal)
            .run_bundles(&state, no_signing, clean)
    })
}

pub(crate) fn build_update(ctx: &BuildContext, flags: &UpdateFlags, increment: bool) -> Result<()> {
    ctx.preflight(BuildCommand::Update)?;
    ctx.journaled("build update", |journal| {
        let sequencer = StageSequencer::new(&ctx.engine, &ctx.config).with_journal(journal);
        let state = MixState::load(&ctx.config.state_file)?;
        sequencer.run_update(&state, &flags.parameters(&state))?;
        if increment {
            sequencer.increment(&ctx.config.state_file)?;
        }
        Ok(())
    })
}

pub(crate) fn build_all(ctx: &BuildContext, options: &AllOptions) -> Result<()> {
    ctx.preflight(BuildCommand::All)?;
    ctx.journaled("build all", |journal| {
        StageSequencer::new(&ctx.engine, &ctx.config)
            .with_journal(journal)
            .run_all(&ctx.config.state_file, options)
    })
}

pub(crate) fn build_image(ctx: &BuildContext, format: Option<&str>, template: Option<&Path>) -> Result<()> {
    ctx.preflight(BuildCommand::Image)?;
    ctx.journaled("build image", |journal| {
        let state = MixState::load(&ctx.config.state_file)?;
        StageSequencer::new(&ctx.engine, &ctx.config)
            .with_journal(journal)
            .run_image(&state, format, template)
    })
}

pub(crate) fn build_delta_packs(ctx: &BuildContext, request: &DeltaPackRequest) -> Result<()> {
    ctx.journaled("build delta-packs", |journal| {
        let state = MixState::load(&ctx.config.state_file)?;
        let history = ManifestHistory::new(&ctx.config.www_dir());
        let pairs = journal.record("delta-packs", || {
            DeltaPackRangeResolver::new(&history).build(&ctx.engine, &state, request)
        })?;
        tracing::info!(packs = pairs.len(), "delta packs built");
        Ok(())
    })
}

pub(crate) fn format_bump(ctx: &BuildContext, new_format: &str, options: BumpOptions) -> Result<()> {
    ctx.journaled("build format-bump", |journal| {
        FormatBumpOrchestrator::new(&ctx.engine, &ctx.config, options)
            .with_journal(journal)
            .run_pair(new_format)
    })
}

pub(crate) fn format_bump_old(ctx: &BuildContext, new_format: &str, options: BumpOptions) -> Result<()> {
    ctx.journaled("build format-bump old", |journal| {
        let session = FormatBumpOrchestrator::new(&ctx.engine, &ctx.config, options)
            .with_journal(journal)
            .old_phase(new_format)?;
        tracing::info!(
            version = session.old_version,
            next = session.new_version,
            "old format build published; run 'format-bump new' next"
        );
        Ok(())
    })
}

pub(crate) fn format_bump_new(ctx: &BuildContext, new_format: &str, options: BumpOptions) -> Result<()> {
    ctx.journaled("build format-bump new", |journal| {
        let version = FormatBumpOrchestrator::new(&ctx.engine, &ctx.config, options)
            .with_journal(journal)
            .new_phase(new_format)?;
        tracing::info!(version, format = %new_format, "new format build published");
        Ok(())
    })
}

pub(crate) fn upstream_format(ctx: &BuildContext, new_format: &str, options: BumpOptions) -> Result<()> {
    ctx.journaled("build upstream-format", |journal| {
        let summary = FormatBumpOrchestrator::new(&ctx.engine, &ctx.config, options)
            .with_journal(journal)
            .run_upstream_crossing(new_format)?;
        if summary.pairs == 0 {
            tracing::info!(version = summary.mix_version, "mix already matches the upstream format");
        }
        Ok(())
    })
}
