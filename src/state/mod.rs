//! Persisted mix version/format state.
//!
//! `MixState` is a snapshot: it is loaded from disk at the start of every
//! invocation (and every bump phase), mutated locally, and saved back before
//! the next phase starts. Nothing holds a long-lived copy across phases, so a
//! crashed run always resumes from what is actually on disk.

mod scoped;

pub use scoped::ScopedOverride;

use crate::bundles;
use crate::content_store::replace_file;
use crate::error::{IoContext, MixError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Distance between two publishable mix versions.
pub const VERSION_STRIDE: u32 = 10;

/// Lifecycle of a bundle in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    #[default]
    Active,
    /// Slated for removal: emptied during a format bump, then dropped.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleEntry {
    pub name: String,
    #[serde(default)]
    pub status: BundleStatus,
}

impl BundleEntry {
    pub fn active(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: BundleStatus::Active,
        }
    }

    pub fn deleted(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: BundleStatus::Deleted,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateToml {
    mix: MixToml,
    #[serde(default)]
    bundles: Vec<BundleEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MixToml {
    version: u32,
    upstream_version: String,
    format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    staged_upstream: Option<String>,
}

/// Snapshot of the persisted mix state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixState {
    pub mix_version: u32,
    pub upstream_version: String,
    pub format: String,
    /// Upstream version the operator asked for, saved while a chained bump
    /// pins `upstream_version` to a format boundary.
    pub staged_upstream: Option<String>,
    pub bundles: Vec<BundleEntry>,
}

impl MixState {
    pub fn new(mix_version: u32, upstream_version: &str, format: &str) -> Self {
        Self {
            mix_version,
            upstream_version: upstream_version.to_string(),
            format: format.to_string(),
            staged_upstream: None,
            bundles: Vec::new(),
        }
    }

    /// Load the state record at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MixError::state(format!(
                "state file '{}' not found",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).io_context("reading state file", path)?;
        let parsed: StateToml = toml::from_str(&raw).map_err(|e| {
            MixError::state(format!("parsing state file '{}': {e}", path.display()))
        })?;

        let format = parsed.mix.format.trim().to_string();
        if format.is_empty() {
            return Err(MixError::state(format!(
                "state file '{}' has an empty format",
                path.display()
            )));
        }

        for bundle in &parsed.bundles {
            bundles::validate_bundle_name(&bundle.name)?;
        }

        Ok(Self {
            mix_version: parsed.mix.version,
            upstream_version: parsed.mix.upstream_version.trim().to_string(),
            format,
            staged_upstream: parsed.mix.staged_upstream,
            bundles: parsed.bundles,
        })
    }

    /// Persist the snapshot to `path` (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = StateToml {
            mix: MixToml {
                version: self.mix_version,
                upstream_version: self.upstream_version.clone(),
                format: self.format.clone(),
                staged_upstream: self.staged_upstream.clone(),
            },
            bundles: self.bundles.clone(),
        };
        let text = toml::to_string_pretty(&doc)
            .map_err(|e| MixError::state(format!("serializing mix state: {e}")))?;
        replace_file(path, text.as_bytes())
    }

    /// Move the mix version forward to `version`.
    pub fn advance_version(&mut self, version: u32) -> Result<()> {
        if version <= self.mix_version {
            return Err(MixError::state(format!(
                "mix version must increase: {} -> {} rejected",
                self.mix_version, version
            )));
        }
        tracing::debug!(from = self.mix_version, to = version, "advancing mix version");
        self.mix_version = version;
        Ok(())
    }

    /// The next publish slot after the current version.
    pub fn next_version(&self) -> Result<u32> {
        stride_after(self.mix_version)
    }

    /// Change the format for this and every later build.
    pub fn set_format_permanent(&mut self, format: &str) -> Result<()> {
        let format = format.trim();
        if format.is_empty() {
            return Err(MixError::config("format must not be empty"));
        }
        tracing::info!(from = %self.format, to = %format, "setting mix format");
        self.format = format.to_string();
        Ok(())
    }

    /// Run `body` with `format` applied; the prior format is restored
    /// afterwards whether `body` succeeds, fails, or panics.
    pub fn with_scoped_format<T>(
        &mut self,
        format: &str,
        body: impl FnOnce(&MixState) -> Result<T>,
    ) -> Result<T> {
        let guard = ScopedOverride::apply(self, None, format);
        body(&*guard)
    }

    /// Like [`MixState::with_scoped_format`], also overriding the version.
    pub fn with_scoped_override<T>(
        &mut self,
        version: u32,
        format: &str,
        body: impl FnOnce(&MixState) -> Result<T>,
    ) -> Result<T> {
        let guard = ScopedOverride::apply(self, Some(version), format);
        body(&*guard)
    }

    /// Pin the upstream pointer, remembering the operator's original value.
    pub fn stage_upstream(&mut self, pinned: &str) {
        if self.staged_upstream.is_none() {
            self.staged_upstream = Some(self.upstream_version.clone());
        }
        self.upstream_version = pinned.to_string();
    }

    /// Restore the upstream pointer saved by [`MixState::stage_upstream`].
    /// Returns false when nothing was staged.
    pub fn unstage_upstream(&mut self) -> bool {
        match self.staged_upstream.take() {
            Some(original) => {
                self.upstream_version = original;
                true
            }
            None => false,
        }
    }

    pub fn deleted_bundles(&self) -> Vec<&str> {
        self.bundles
            .iter()
            .filter(|b| b.status == BundleStatus::Deleted)
            .map(|b| b.name.as_str())
            .collect()
    }

    /// Remove deleted bundles from the registry, returning their names.
    pub fn drop_deleted_bundles(&mut self) -> Vec<String> {
        let (dropped, kept): (Vec<_>, Vec<_>) = self
            .bundles
            .drain(..)
            .partition(|b| b.status == BundleStatus::Deleted);
        self.bundles = kept;
        dropped.into_iter().map(|b| b.name).collect()
    }
}

/// `version + VERSION_STRIDE`, rejecting overflow.
pub fn stride_after(version: u32) -> Result<u32> {
    version
        .checked_add(VERSION_STRIDE)
        .ok_or_else(|| MixError::state(format!("mix version {version} cannot be advanced")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("mixer.state");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn save_then_load_keeps_bundles_and_staging() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mixer.state");

        let mut state = MixState::new(100, "31000", "1");
        state.bundles = vec![BundleEntry::active("os-core"), BundleEntry::deleted("editors")];
        state.stage_upstream("30990");
        state.save(&path).unwrap();

        let loaded = MixState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.staged_upstream.as_deref(), Some("31000"));
    }

    #[test]
    fn load_rejects_non_numeric_version() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "[mix]\nversion = \"ten\"\nupstream_version = \"1\"\nformat = \"1\"\n",
        );
        assert!(matches!(MixState::load(&path), Err(MixError::State(_))));
    }

    #[test]
    fn load_rejects_missing_format() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "[mix]\nversion = 10\nupstream_version = \"1\"\n");
        let err = MixState::load(&path).unwrap_err();
        assert!(matches!(err, MixError::State(_)));
        assert!(err.to_string().contains("format"));
    }

    #[test]
    fn load_rejects_bundle_names_that_escape_the_tree() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "[mix]\nversion = 10\nupstream_version = \"1\"\nformat = \"1\"\n\n[[bundles]]\nname = \"../../victim\"\nstatus = \"deleted\"\n",
        );
        let err = MixState::load(&path).unwrap_err();
        assert!(matches!(err, MixError::State(_)));
        assert!(err.to_string().contains("../../victim"));
    }

    #[test]
    fn load_missing_file_is_state_error() {
        let tmp = TempDir::new().unwrap();
        let err = MixState::load(&tmp.path().join("nope.state")).unwrap_err();
        assert!(matches!(err, MixError::State(_)));
    }

    #[test]
    fn advance_version_must_increase() {
        let mut state = MixState::new(100, "1", "1");
        assert!(state.advance_version(100).is_err());
        assert!(state.advance_version(90).is_err());
        state.advance_version(110).unwrap();
        assert_eq!(state.mix_version, 110);
        assert_eq!(state.next_version().unwrap(), 120);
    }

    #[test]
    fn next_version_overflow_is_state_error() {
        let state = MixState::new(u32::MAX - 5, "1", "1");
        assert!(matches!(state.next_version(), Err(MixError::State(_))));
    }

    #[test]
    fn scoped_format_restores_after_failure() {
        let mut state = MixState::new(100, "1", "1");
        let result: Result<()> = state.with_scoped_format("2", |s| {
            assert_eq!(s.format, "2");
            Err(MixError::external("build-bundles", "boom"))
        });
        assert!(result.is_err());
        assert_eq!(state.format, "1");
    }

    #[test]
    fn scoped_override_restores_after_panic() {
        let mut state = MixState::new(100, "1", "1");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = state.with_scoped_override(120, "2", |s| -> Result<()> {
                assert_eq!(s.mix_version, 120);
                panic!("engine crashed");
            });
        }));
        assert!(outcome.is_err());
        assert_eq!(state.mix_version, 100);
        assert_eq!(state.format, "1");
    }

    #[test]
    fn permanent_format_rejects_empty() {
        let mut state = MixState::new(100, "1", "1");
        assert!(matches!(
            state.set_format_permanent("  "),
            Err(MixError::Configuration(_))
        ));
        state.set_format_permanent("2").unwrap();
        assert_eq!(state.format, "2");
    }

    #[test]
    fn unstage_without_stage_is_noop() {
        let mut state = MixState::new(100, "31000", "1");
        assert!(!state.unstage_upstream());
        state.stage_upstream("30990");
        state.stage_upstream("30980");
        assert!(state.unstage_upstream());
        assert_eq!(state.upstream_version, "31000");
    }

    #[test]
    fn drop_deleted_bundles_keeps_active_order() {
        let mut state = MixState::new(100, "1", "1");
        state.bundles = vec![
            BundleEntry::active("a"),
            BundleEntry::deleted("b"),
            BundleEntry::active("c"),
        ];
        assert_eq!(state.deleted_bundles(), vec!["b"]);
        assert_eq!(state.drop_deleted_bundles(), vec!["b".to_string()]);
        let names: Vec<_> = state.bundles.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
