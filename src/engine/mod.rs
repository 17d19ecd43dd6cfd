//! Boundary to the content engine.
//!
//! The engine is whatever actually produces bundle trees, manifests, packs
//! and images. The orchestrator only decides *what* to build *as which
//! version/format*, and hands each call a [`MixState`] snapshot.

mod command;

pub use command::{resolve_engine_binary, CommandEngine};

use crate::error::Result;
use crate::state::MixState;
use std::path::{Path, PathBuf};

/// Inputs for one update (manifest/pack) build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateParameters {
    pub min_version: u32,
    pub format: String,
    pub publish: bool,
    pub skip_signing: bool,
    pub skip_fullfiles: bool,
    pub skip_packs: bool,
}

/// Freshly generated key material for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningMaterial {
    pub private_key: PathBuf,
    pub cert_template: PathBuf,
}

/// Inputs for one bundle build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleBuild {
    pub signing: Option<SigningMaterial>,
    pub skip_signing: bool,
    pub clean: bool,
}

pub trait ContentEngine {
    /// Create a key pair and certificate template for `cert_path`.
    fn generate_signing_material(&self, cert_path: &Path) -> Result<SigningMaterial>;

    /// Build bundle content for `state.mix_version` under
    /// `image/<mix_version>/`, stamping `state.format`.
    fn build_bundles(&self, state: &MixState, build: &BundleBuild) -> Result<()>;

    /// Build manifests/fullfiles/packs for `state.mix_version`.
    fn build_update(&self, state: &MixState, params: &UpdateParameters) -> Result<()>;

    fn build_image(&self, state: &MixState, format: &str, template: Option<&Path>) -> Result<()>;

    fn build_delta_packs(&self, state: &MixState, from: u32, to: u32, report: bool) -> Result<()>;

    /// Add locally built packages to the mix repository.
    fn add_rpm_list(&self, state: &MixState, rpms: &[PathBuf]) -> Result<()>;

    /// Whether the upstream has crossed a format the mix has not.
    fn bump_needed(&self, state: &MixState) -> Result<bool>;

    /// Latest upstream version still in the mix's current format.
    fn latest_upstream_in_format(&self, state: &MixState) -> Result<String>;
}
