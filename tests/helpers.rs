//! Shared test utilities: a scratch mix and a recording content engine.

#![allow(dead_code)]

use mix_builder::engine::{BundleBuild, ContentEngine, SigningMaterial, UpdateParameters};
use mix_builder::history::{self, MOM_FILE};
use mix_builder::state::{BundleEntry, MixState};
use mix_builder::{MixConfig, MixError, Result};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const UPSTREAM: &str = "31000";

/// A mix rooted in a temporary directory, with `version` already published.
pub struct TestMix {
    /// Temporary directory (kept alive for lifetime of TestMix)
    pub _temp_dir: TempDir,
    pub config: MixConfig,
}

impl TestMix {
    pub fn published_at(version: u32, format: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = MixConfig::rooted_at(temp_dir.path());
        config.groups_ini = Some(temp_dir.path().join("mixbundles/groups.ini"));
        config.local_rpm_dir = Some(temp_dir.path().join("local-rpms"));

        let mut state = MixState::new(version, UPSTREAM, format);
        state.bundles = vec![
            BundleEntry::active("os-core"),
            BundleEntry::active("editors"),
            BundleEntry::deleted("legacy"),
        ];
        state.save(&config.state_file).expect("Failed to write state");

        fs::create_dir_all(config.groups_ini.as_ref().unwrap().parent().unwrap()).unwrap();
        fs::write(
            config.groups_ini.as_ref().unwrap(),
            "[os-core]\ngroup=os-core\n\n[editors]\ngroup=editors\n\n[legacy]\ngroup=legacy\n",
        )
        .unwrap();

        publish_manifest(&config.www_dir(), version, 0, format, 0);
        history::write_last_version(&config.image_dir(), version).unwrap();

        Self {
            _temp_dir: temp_dir,
            config,
        }
    }

    pub fn state(&self) -> MixState {
        MixState::load(&self.config.state_file).expect("Failed to load state")
    }

    pub fn last_version(&self) -> u32 {
        history::read_last_version(&self.config.image_dir()).expect("Failed to read LAST_VER")
    }

    pub fn add_local_rpms(&self, names: &[&str]) {
        let dir = self.config.local_rpm_dir.as_ref().unwrap();
        fs::create_dir_all(dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"rpm").unwrap();
        }
    }
}

/// Write a `Manifest.MoM` header for `version`.
pub fn publish_manifest(www: &Path, version: u32, previous: u32, format: &str, min_version: u32) {
    let dir = www.join(version.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(MOM_FILE),
        format!(
            "MANIFEST\t{format}\nversion:\t{version}\nprevious:\t{previous}\nminversion:\t{min_version}\n\n"
        ),
    )
    .unwrap();
}

/// Relative path of the format marker inside each bundle.
pub const FORMAT_MARKER: &str = "usr/share/defaults/swupd/format";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Cert,
    Bundles {
        version: u32,
        format: String,
        signed: bool,
        skip_signing: bool,
        clean: bool,
    },
    Update {
        version: u32,
        format: String,
        upstream: String,
        min_version: u32,
        publish: bool,
    },
    Image {
        version: u32,
        format: String,
    },
    Delta {
        from: u32,
        to: u32,
        report: bool,
    },
    Rpms(usize),
    BumpNeeded,
    LatestUpstream,
}

/// Engine that writes just enough on disk for the orchestrator to observe,
/// and records every call.
pub struct FakeEngine {
    config: MixConfig,
    calls: RefCell<Vec<Call>>,
    bumps_remaining: Cell<u32>,
    fail_update_at: Cell<Option<u32>>,
}

impl FakeEngine {
    pub fn new(config: &MixConfig) -> Self {
        Self {
            config: config.clone(),
            calls: RefCell::new(Vec::new()),
            bumps_remaining: Cell::new(0),
            fail_update_at: Cell::new(None),
        }
    }

    /// Report `n` more format crossings before the mix catches up.
    pub fn with_bumps(self, n: u32) -> Self {
        self.bumps_remaining.set(n);
        self
    }

    pub fn fail_update_at(&self, version: Option<u32>) {
        self.fail_update_at.set(version);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn update_versions(&self) -> Vec<u32> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Update { version, .. } => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn bundle_versions(&self) -> Vec<u32> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Bundles { version, .. } => Some(*version),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

/// Unlink before writing so files shared with another tree stay intact.
fn write_fresh(path: &Path, bytes: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    if path.exists() {
        fs::remove_file(path).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

impl ContentEngine for FakeEngine {
    fn generate_signing_material(&self, cert_path: &Path) -> Result<SigningMaterial> {
        self.record(Call::Cert);
        write_fresh(cert_path, b"CERT");
        let dir = cert_path.parent().unwrap_or_else(|| Path::new("."));
        Ok(SigningMaterial {
            private_key: dir.join("private.pem"),
            cert_template: dir.join("configuration.cnf"),
        })
    }

    fn build_bundles(&self, state: &MixState, build: &BundleBuild) -> Result<()> {
        self.record(Call::Bundles {
            version: state.mix_version,
            format: state.format.clone(),
            signed: build.signing.is_some(),
            skip_signing: build.skip_signing,
            clean: build.clean,
        });
        let tree = self.config.version_tree(state.mix_version);
        if build.clean && tree.exists() {
            fs::remove_dir_all(&tree).unwrap();
        }
        for bundle in &state.bundles {
            let root = tree.join(&bundle.name);
            write_fresh(&root.join(FORMAT_MARKER), state.format.as_bytes());
            write_fresh(
                &root.join(format!("usr/lib/{}.conf", bundle.name)),
                format!("bundle={}\n", bundle.name).as_bytes(),
            );
        }
        Ok(())
    }

    fn build_update(&self, state: &MixState, params: &UpdateParameters) -> Result<()> {
        self.record(Call::Update {
            version: state.mix_version,
            format: params.format.clone(),
            upstream: state.upstream_version.clone(),
            min_version: params.min_version,
            publish: params.publish,
        });
        if self.fail_update_at.get() == Some(state.mix_version) {
            return Err(MixError::external("build-update", "injected failure"));
        }
        if params.publish {
            let image_dir = self.config.image_dir();
            let previous = history::read_last_version(&image_dir).unwrap_or(0);
            publish_manifest(
                &self.config.www_dir(),
                state.mix_version,
                previous,
                &params.format,
                params.min_version,
            );
            history::write_last_version(&image_dir, state.mix_version)?;
        }
        Ok(())
    }

    fn build_image(&self, state: &MixState, format: &str, _template: Option<&Path>) -> Result<()> {
        self.record(Call::Image {
            version: state.mix_version,
            format: format.to_string(),
        });
        Ok(())
    }

    fn build_delta_packs(&self, _state: &MixState, from: u32, to: u32, report: bool) -> Result<()> {
        self.record(Call::Delta { from, to, report });
        Ok(())
    }

    fn add_rpm_list(&self, _state: &MixState, rpms: &[PathBuf]) -> Result<()> {
        self.record(Call::Rpms(rpms.len()));
        Ok(())
    }

    fn bump_needed(&self, _state: &MixState) -> Result<bool> {
        self.record(Call::BumpNeeded);
        let remaining = self.bumps_remaining.get();
        if remaining == 0 {
            return Ok(false);
        }
        self.bumps_remaining.set(remaining - 1);
        Ok(true)
    }

    fn latest_upstream_in_format(&self, state: &MixState) -> Result<String> {
        self.record(Call::LatestUpstream);
        Ok(format!("{}-last", state.format))
    }
}

/// Every regular file under `tree`, relative to it.
pub fn files_under(tree: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(tree)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(tree).unwrap().to_path_buf())
        .collect();
    out.sort();
    out
}
