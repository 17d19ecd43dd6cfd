//! mix-builder - release build orchestrator for OS mixes.
//!
//! Reads `builder.toml`, loads the mix state and drives the content engine
//! through bundle, update, image, delta-pack and format-bump builds.

mod workflows;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mix_builder::sequencer::UpdateFlags;
use mix_builder::workers::WorkerRequest;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mix-builder")]
#[command(about = "Release build orchestrator for OS mixes")]
#[command(
    after_help = "QUICK START:\n  mix-builder build all --increment   Build and publish the next version\n  mix-builder build delta-packs --previous-versions 3\n  mix-builder build format-bump --new-format 2"
)]
struct Cli {
    /// Builder config (default: $MIX_BUILDER_CONFIG, then ./builder.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Full-file workers for update builds (0 = one per CPU)
    #[arg(long, global = true, default_value_t = 0, allow_negative_numbers = true)]
    fullfile_workers: i64,

    /// Delta-pack workers (0 = one per CPU)
    #[arg(long, global = true, default_value_t = 0, allow_negative_numbers = true)]
    delta_workers: i64,

    /// Bundle workers (0 = one per CPU)
    #[arg(long, global = true, default_value_t = 0, allow_negative_numbers = true)]
    bundle_workers: i64,

    /// Don't check for required host tools
    #[arg(long, global = true)]
    skip_preflight: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build mix content
    Build {
        #[command(subcommand)]
        target: BuildTarget,
    },
}

#[derive(Subcommand)]
enum BuildTarget {
    /// Build bundle content for the current version
    Bundles {
        /// Remove previous bundle output first
        #[arg(long)]
        clean: bool,
        /// Don't sign content
        #[arg(long)]
        no_signing: bool,
    },

    /// Build manifests, full files and packs for the current version
    Update {
        #[command(flatten)]
        update: UpdateArgs,
        /// Advance the mix version by one slot afterwards
        #[arg(long)]
        increment: bool,
    },

    /// Add local packages, then build bundles and update content
    All {
        #[command(flatten)]
        update: UpdateArgs,
        /// Advance the mix version by one slot afterwards
        #[arg(long)]
        increment: bool,
        /// Remove previous bundle output first
        #[arg(long)]
        clean: bool,
    },

    /// Build an installable image
    Image {
        /// Format to build the image in (default: the mix format)
        #[arg(long)]
        format: Option<String>,
        /// Image template
        #[arg(long)]
        template: Option<PathBuf>,
    },

    /// Build delta packs from earlier versions to a target
    DeltaPacks {
        /// Single source version
        #[arg(long, conflicts_with = "previous_versions")]
        from: Option<u32>,
        /// Number of previously published versions to pack from
        #[arg(long)]
        previous_versions: Option<u32>,
        /// Target version (default: the current mix version)
        #[arg(long)]
        to: Option<u32>,
        /// Explain per file why it was or was not packed
        #[arg(long)]
        report: bool,
    },

    /// Publish the +10 (old format) and +20 (new format) builds
    #[command(subcommand_negates_reqs = true)]
    FormatBump {
        #[command(subcommand)]
        phase: Option<BumpPhaseTarget>,
        /// Format to build later versions in
        #[arg(long, required = true)]
        new_format: Option<String>,
        #[command(flatten)]
        bump: BumpArgs,
    },

    /// Repeat format bumps until the mix has caught up with the upstream
    UpstreamFormat {
        /// Format to build later versions in
        #[arg(long)]
        new_format: String,
        #[command(flatten)]
        bump: BumpArgs,
    },
}

#[derive(Subcommand)]
enum BumpPhaseTarget {
    /// Build the +10 version in the old format
    Old {
        #[arg(long)]
        new_format: String,
        #[command(flatten)]
        bump: BumpArgs,
    },
    /// Build the +20 version in the new format
    New {
        #[arg(long)]
        new_format: String,
        #[command(flatten)]
        bump: BumpArgs,
    },
}

/// Update flags shared by `update` and `all`.
#[derive(Args, Clone, Debug, Default)]
struct UpdateArgs {
    /// Format to build with (default: the mix format)
    #[arg(long)]
    format: Option<String>,
    /// Oldest version clients may update from
    #[arg(long, default_value_t = 0)]
    min_version: u32,
    /// Don't sign content
    #[arg(long)]
    no_signing: bool,
    /// Don't move the published pointer
    #[arg(long)]
    no_publish: bool,
    /// Skip full-file generation
    #[arg(long)]
    skip_fullfiles: bool,
    /// Skip zero and delta packs
    #[arg(long)]
    skip_packs: bool,
}

impl UpdateArgs {
    fn flags(&self) -> UpdateFlags {
        UpdateFlags {
            format: self.format.clone(),
            min_version: self.min_version,
            no_publish: self.no_publish,
            skip_signing: self.no_signing,
            skip_fullfiles: self.skip_fullfiles,
            skip_packs: self.skip_packs,
        }
    }
}

/// Flags for format-bump builds; the format comes from the bump itself.
#[derive(Args, Clone, Debug, Default)]
struct BumpArgs {
    /// Oldest version clients may update from (old build only)
    #[arg(long, default_value_t = 0)]
    min_version: u32,
    /// Don't sign content
    #[arg(long)]
    no_signing: bool,
    /// Don't move the published pointer
    #[arg(long)]
    no_publish: bool,
    /// Skip full-file generation
    #[arg(long)]
    skip_fullfiles: bool,
    /// Skip zero and delta packs
    #[arg(long)]
    skip_packs: bool,
    /// Remove previous bundle output first
    #[arg(long)]
    clean: bool,
}

impl BumpArgs {
    fn options(&self) -> mix_builder::BumpOptions {
        mix_builder::BumpOptions {
            update: UpdateFlags {
                format: None,
                min_version: self.min_version,
                no_publish: self.no_publish,
                skip_signing: self.no_signing,
                skip_fullfiles: self.skip_fullfiles,
                skip_packs: self.skip_packs,
            },
            clean: self.clean,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let workers = WorkerRequest {
        fullfile: cli.fullfile_workers,
        delta: cli.delta_workers,
        bundle: cli.bundle_workers,
    };
    let ctx = workflows::BuildContext::load(cli.config.as_deref(), workers, cli.skip_preflight)?;

    let Commands::Build { target } = cli.command;
    match target {
        BuildTarget::Bundles { clean, no_signing } => workflows::build_bundles(&ctx, clean, no_signing),
        BuildTarget::Update { update, increment } => {
            workflows::build_update(&ctx, &update.flags(), increment)
        }
        BuildTarget::All {
            update,
            increment,
            clean,
        } => workflows::build_all(
            &ctx,
            &mix_builder::AllOptions {
                clean,
                increment,
                update: update.flags(),
            },
        ),
        BuildTarget::Image { format, template } => {
            workflows::build_image(&ctx, format.as_deref(), template.as_deref())
        }
        BuildTarget::DeltaPacks {
            from,
            previous_versions,
            to,
            report,
        } => workflows::build_delta_packs(
            &ctx,
            &mix_builder::DeltaPackRequest {
                from_version: from,
                previous_versions,
                to_version: to,
                report,
            },
        ),
        BuildTarget::FormatBump {
            phase,
            new_format,
            bump,
        } => match phase {
            Some(BumpPhaseTarget::Old { new_format, bump }) => {
                workflows::format_bump_old(&ctx, &new_format, bump.options())
            }
            Some(BumpPhaseTarget::New { new_format, bump }) => {
                workflows::format_bump_new(&ctx, &new_format, bump.options())
            }
            None => {
                let new_format = new_format.context("--new-format is required")?;
                workflows::format_bump(&ctx, &new_format, bump.options())
            }
        },
        BuildTarget::UpstreamFormat { new_format, bump } => {
            workflows::upstream_format(&ctx, &new_format, bump.options())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bump_pair_requires_new_format() {
        assert!(Cli::try_parse_from(["mix-builder", "build", "format-bump"]).is_err());

        let cli = Cli::try_parse_from(["mix-builder", "build", "format-bump", "--new-format", "2"])
            .unwrap();
        let Commands::Build { target } = cli.command;
        assert!(matches!(
            target,
            BuildTarget::FormatBump { phase: None, new_format: Some(ref f), .. } if f == "2"
        ));
    }

    #[test]
    fn format_bump_phases_take_their_own_new_format() {
        let cli = Cli::try_parse_from([
            "mix-builder",
            "build",
            "format-bump",
            "old",
            "--new-format",
            "2",
        ])
        .unwrap();
        let Commands::Build { target } = cli.command;
        assert!(matches!(
            target,
            BuildTarget::FormatBump {
                phase: Some(BumpPhaseTarget::Old { ref new_format, .. }),
                ..
            } if new_format == "2"
        ));

        assert!(Cli::try_parse_from(["mix-builder", "build", "format-bump", "new"]).is_err());
    }
}
