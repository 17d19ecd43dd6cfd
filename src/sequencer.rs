//! Ordered build pipeline: bundles, then update content, then images.
//!
//! The sequencer decides order and inputs; the content engine does the work.
//! Any failing step aborts the sequence and nothing already written is rolled
//! back.

use crate::config::MixConfig;
use crate::engine::{BundleBuild, ContentEngine, UpdateParameters};
use crate::error::Result;
use crate::runs::BuildJournal;
use crate::state::MixState;
use std::fs;
use std::path::{Path, PathBuf};

/// Operator choices for an update build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    /// Format to build with; the mix's current format when unset.
    pub format: Option<String>,
    pub min_version: u32,
    pub no_publish: bool,
    pub skip_signing: bool,
    pub skip_fullfiles: bool,
    pub skip_packs: bool,
}

impl UpdateFlags {
    pub fn parameters(&self, state: &MixState) -> UpdateParameters {
        let format = self
            .format
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(state.format.as_str());
        self.parameters_with(self.min_version, format)
    }

    pub fn parameters_with(&self, min_version: u32, format: &str) -> UpdateParameters {
        UpdateParameters {
            min_version,
            format: format.to_string(),
            publish: !self.no_publish,
            skip_signing: self.skip_signing,
            skip_fullfiles: self.skip_fullfiles,
            skip_packs: self.skip_packs,
        }
    }
}

/// Options for `build all`.
#[derive(Debug, Clone, Default)]
pub struct AllOptions {
    pub clean: bool,
    pub increment: bool,
    pub update: UpdateFlags,
}

pub struct StageSequencer<'a> {
    engine: &'a dyn ContentEngine,
    config: &'a MixConfig,
    journal: Option<&'a BuildJournal>,
}

impl<'a> StageSequencer<'a> {
    pub fn new(engine: &'a dyn ContentEngine, config: &'a MixConfig) -> Self {
        Self {
            engine,
            config,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a BuildJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn step<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.journal {
            Some(journal) => journal.record(name, f),
            None => f(),
        }
    }

    /// Build bundles for `state`.
    ///
    /// Without a certificate at the configured path, fresh key material is
    /// generated and the caller's `skip_signing` is honored. With an existing
    /// certificate, signing is forced off and no key is passed; the engine
    /// has never been asked to reload an existing key.
    pub fn run_bundles(&self, state: &MixState, skip_signing: bool, clean: bool) -> Result<()> {
        self.step("bundles", || {
            let build = if self.config.cert.exists() {
                tracing::debug!(
                    cert = %self.config.cert.display(),
                    "certificate present; building bundles without signing"
                );
                BundleBuild {
                    signing: None,
                    skip_signing: true,
                    clean,
                }
            } else {
                tracing::info!("generating certificate for signature validation");
                let material = self.engine.generate_signing_material(&self.config.cert)?;
                BundleBuild {
                    signing: Some(material),
                    skip_signing,
                    clean,
                }
            };
            tracing::info!(
                version = state.mix_version,
                format = %state.format,
                clean,
                "building bundles"
            );
            self.engine.build_bundles(state, &build)
        })
    }

    /// Build manifests/packs for the current version. Never changes the version.
    pub fn run_update(&self, state: &MixState, params: &UpdateParameters) -> Result<()> {
        self.step("update", || {
            tracing::info!(
                version = state.mix_version,
                format = %params.format,
                min_version = params.min_version,
                publish = params.publish,
                "building update"
            );
            self.engine.build_update(state, params)
        })
    }

    pub fn run_image(&self, state: &MixState, format: Option<&str>, template: Option<&Path>) -> Result<()> {
        self.step("image", || {
            let format = format
                .filter(|f| !f.trim().is_empty())
                .unwrap_or(state.format.as_str());
            tracing::info!(version = state.mix_version, format, "building image");
            self.engine.build_image(state, format, template)
        })
    }

    /// Local packages, bundles, update, then the optional version increment.
    pub fn run_all(&self, state_path: &Path, options: &AllOptions) -> Result<()> {
        let state = MixState::load(state_path)?;
        self.ingest_local_packages(&state)?;
        self.run_bundles(&state, options.update.skip_signing, options.clean)?;
        self.run_update(&state, &options.update.parameters(&state))?;
        if options.increment {
            self.increment(state_path)?;
        }
        Ok(())
    }

    /// Advance the persisted version by one publish slot.
    pub fn increment(&self, state_path: &Path) -> Result<u32> {
        self.step("increment", || {
            let mut state = MixState::load(state_path)?;
            let next = state.next_version()?;
            state.advance_version(next)?;
            state.save(state_path)?;
            tracing::info!(version = next, "mix version incremented");
            Ok(next)
        })
    }

    /// Hand visible files of the local package directory to the engine.
    /// An unreadable or absent directory is skipped.
    pub fn ingest_local_packages(&self, state: &MixState) -> Result<usize> {
        let Some(dir) = self.config.local_rpm_dir.as_deref() else {
            return Ok(0);
        };
        let rpms = match list_visible_files(dir) {
            Ok(rpms) => rpms,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "skipping local packages");
                return Ok(0);
            }
        };
        if rpms.is_empty() {
            return Ok(0);
        }
        self.step("local-packages", || {
            tracing::info!(count = rpms.len(), "adding local packages");
            self.engine.add_rpm_list(state, &rpms)
        })?;
        Ok(rpms.len())
    }
}

fn list_visible_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_file() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_flags_default_to_state_format() {
        let state = MixState::new(10, "1", "3");
        let flags = UpdateFlags {
            no_publish: true,
            ..Default::default()
        };
        let params = flags.parameters(&state);
        assert_eq!(params.format, "3");
        assert!(!params.publish);

        let flags = UpdateFlags {
            format: Some("4".to_string()),
            min_version: 20,
            ..Default::default()
        };
        let params = flags.parameters(&state);
        assert_eq!(params.format, "4");
        assert_eq!(params.min_version, 20);
        assert!(params.publish);
    }

    #[test]
    fn hidden_files_are_not_packages() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("b.rpm"), b"").unwrap();
        fs::write(tmp.path().join("a.rpm"), b"").unwrap();
        fs::write(tmp.path().join(".repodata"), b"").unwrap();
        fs::create_dir_all(tmp.path().join("subdir")).unwrap();

        let files = list_visible_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![tmp.path().join("a.rpm"), tmp.path().join("b.rpm")]
        );
    }
}
