//! Published version history.
//!
//! Two on-disk sources:
//! - `image/LAST_VER`: the predecessor marker, i.e. the version the next
//!   manifests will name as their `previous:`.
//! - `www/<version>/Manifest.MoM`: one per published version. Only the text
//!   header is read here; the rest of the manifest belongs to the engine.

use crate::content_store::replace_file;
use crate::error::{IoContext, MixError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const LAST_VER_FILE: &str = "LAST_VER";
pub const MOM_FILE: &str = "Manifest.MoM";

/// Walkable view of which versions were published and what preceded them.
pub trait VersionHistory {
    fn is_published(&self, version: u32) -> Result<bool>;

    /// The `previous:` version recorded by `version`'s manifest, `None` at
    /// the start of history.
    fn previous_of(&self, version: u32) -> Result<Option<u32>>;
}

/// Reads the predecessor marker under `<server_state>/image/`.
pub fn read_last_version(image_dir: &Path) -> Result<u32> {
    let path = image_dir.join(LAST_VER_FILE);
    if !path.is_file() {
        return Err(MixError::state(format!(
            "no published version recorded: '{}' is missing",
            path.display()
        )));
    }
    let raw = fs::read_to_string(&path).io_context("reading predecessor marker", &path)?;
    raw.trim().parse::<u32>().map_err(|_| {
        MixError::state(format!(
            "predecessor marker '{}' holds '{}', not a version",
            path.display(),
            raw.trim()
        ))
    })
}

/// Overwrite the predecessor marker.
pub fn write_last_version(image_dir: &Path, version: u32) -> Result<()> {
    let path = image_dir.join(LAST_VER_FILE);
    replace_file(&path, format!("{version}\n").as_bytes())?;
    tracing::info!(version, path = %path.display(), "wrote predecessor marker");
    Ok(())
}

/// History backed by published `Manifest.MoM` headers.
#[derive(Debug, Clone)]
pub struct ManifestHistory {
    www_dir: PathBuf,
}

impl ManifestHistory {
    pub fn new(www_dir: &Path) -> Self {
        Self {
            www_dir: www_dir.to_path_buf(),
        }
    }

    fn mom_path(&self, version: u32) -> PathBuf {
        self.www_dir.join(version.to_string()).join(MOM_FILE)
    }
}

impl VersionHistory for ManifestHistory {
    fn is_published(&self, version: u32) -> Result<bool> {
        Ok(self.mom_path(version).is_file())
    }

    fn previous_of(&self, version: u32) -> Result<Option<u32>> {
        let path = self.mom_path(version);
        let raw = fs::read_to_string(&path).io_context("reading manifest header", &path)?;
        match parse_previous(&raw) {
            Some(Ok(0)) => Ok(None),
            Some(Ok(v)) => Ok(Some(v)),
            Some(Err(value)) => Err(MixError::state(format!(
                "manifest '{}' has a non-numeric previous: '{value}'",
                path.display()
            ))),
            None => Err(MixError::state(format!(
                "manifest '{}' has no previous: header",
                path.display()
            ))),
        }
    }
}

/// Value of the `previous:` header line, if present.
fn parse_previous(manifest: &str) -> Option<std::result::Result<u32, String>> {
    for line in manifest.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix("previous:") {
            let value = rest.trim();
            return Some(value.parse::<u32>().map_err(|_| value.to_string()));
        }
    }
    None
}
