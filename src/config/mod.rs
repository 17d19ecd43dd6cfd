//! Builder configuration (`builder.toml`).
//!
//! ```toml
//! [builder]
//! server_state_dir = "update"
//! state_file = "mixer.state"
//! cert = "Swupd_Root.pem"
//! engine = "mixer-engine"
//!
//! [mixer]
//! local_rpm_dir = "local-rpms"
//! groups_ini = "mixbundles/groups.ini"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::error::{IoContext, MixError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "builder.toml";
pub const CONFIG_ENV: &str = "MIX_BUILDER_CONFIG";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    builder: BuilderToml,
    mixer: Option<MixerToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuilderToml {
    server_state_dir: Option<String>,
    state_file: Option<String>,
    cert: Option<String>,
    engine: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MixerToml {
    local_rpm_dir: Option<String>,
    groups_ini: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixConfig {
    pub server_state_dir: PathBuf,
    pub state_file: PathBuf,
    /// Signing certificate; its absence triggers key generation.
    pub cert: PathBuf,
    /// Engine executable name or path (see `engine::resolve_engine_binary`).
    pub engine: String,
    pub local_rpm_dir: Option<PathBuf>,
    pub groups_ini: Option<PathBuf>,
}

impl MixConfig {
    /// Which config file to use: explicit flag, then `MIX_BUILDER_CONFIG`,
    /// then `./builder.toml`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MixError::config(format!(
                "builder config '{}' not found",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).io_context("reading builder config", path)?;
        let parsed: ConfigToml = toml::from_str(&raw).map_err(|e| {
            MixError::config(format!("parsing builder config '{}': {e}", path.display()))
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(Self::from_toml(parsed, base))
    }

    fn from_toml(parsed: ConfigToml, base: &Path) -> Self {
        let builder = parsed.builder;
        let mixer = parsed.mixer.unwrap_or(MixerToml {
            local_rpm_dir: None,
            groups_ini: None,
        });
        Self {
            server_state_dir: resolve(base, builder.server_state_dir.as_deref().unwrap_or("update")),
            state_file: resolve(base, builder.state_file.as_deref().unwrap_or("mixer.state")),
            cert: resolve(base, builder.cert.as_deref().unwrap_or("Swupd_Root.pem")),
            engine: builder
                .engine
                .unwrap_or_else(|| "mixer-engine".to_string()),
            local_rpm_dir: mixer.local_rpm_dir.map(|p| resolve(base, &p)),
            groups_ini: mixer.groups_ini.map(|p| resolve(base, &p)),
        }
    }

    /// Config rooted at `dir` with every default, for tests and scaffolding.
    pub fn rooted_at(dir: &Path) -> Self {
        Self::from_toml(
            ConfigToml {
                builder: BuilderToml {
                    server_state_dir: None,
                    state_file: None,
                    cert: None,
                    engine: None,
                },
                mixer: None,
            },
            dir,
        )
    }

    pub fn image_dir(&self) -> PathBuf {
        self.server_state_dir.join("image")
    }

    pub fn www_dir(&self) -> PathBuf {
        self.server_state_dir.join("www")
    }

    /// Content tree for one version.
    pub fn version_tree(&self, version: u32) -> PathBuf {
        self.image_dir().join(version.to_string())
    }
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(
            &path,
            "[builder]\nserver_state_dir = \"srv\"\ncert = \"/etc/mix/cert.pem\"\n\n[mixer]\nlocal_rpm_dir = \"rpms\"\n",
        )
        .unwrap();

        let config = MixConfig::load(&path).unwrap();
        assert_eq!(config.server_state_dir, tmp.path().join("srv"));
        assert_eq!(config.state_file, tmp.path().join("mixer.state"));
        assert_eq!(config.cert, PathBuf::from("/etc/mix/cert.pem"));
        assert_eq!(config.local_rpm_dir, Some(tmp.path().join("rpms")));
        assert_eq!(config.groups_ini, None);
        assert_eq!(config.engine, "mixer-engine");
        assert_eq!(config.version_tree(110), tmp.path().join("srv/image/110"));
    }

    #[test]
    fn unknown_keys_are_configuration_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(&path, "[builder]\nserverstate = \"x\"\n").unwrap();
        assert!(matches!(
            MixConfig::load(&path),
            Err(MixError::Configuration(_))
        ));
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = Path::new("/srv/mix/builder.toml");
        assert_eq!(MixConfig::locate(Some(explicit)), explicit.to_path_buf());
    }
}
