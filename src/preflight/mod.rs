//! Preflight checks for build commands.
//!
//! Each command declares the host tools its engine calls shell out to. They
//! are looked up on `PATH` before anything is built, so a missing tool fails
//! the command up front instead of halfway through a publish.
//!
//! ```rust
//! use mix_builder::preflight::{check_required_tools, BuildCommand};
//!
//! if let Err(e) = check_required_tools(BuildCommand::Update.required_tools()) {
//!     eprintln!("{e}");
//! }
//! ```

use crate::error::{MixError, Result};

/// Commands with host tool requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildCommand {
    Bundles,
    Update,
    All,
    Image,
}

const BUNDLE_TOOLS: &[(&str, &str)] = &[("rpm", "rpm"), ("dnf", "dnf")];
const UPDATE_TOOLS: &[(&str, &str)] = &[("openssl", "openssl"), ("xz", "xz")];
const IMAGE_TOOLS: &[(&str, &str)] = &[("ister.py", "ister")];
const ALL_TOOLS: &[(&str, &str)] = &[
    ("rpm", "rpm"),
    ("dnf", "dnf"),
    ("openssl", "openssl"),
    ("xz", "xz"),
    ("ister.py", "ister"),
];

impl BuildCommand {
    /// `(command, package)` pairs the command needs.
    pub fn required_tools(self) -> &'static [(&'static str, &'static str)] {
        match self {
            BuildCommand::Bundles => BUNDLE_TOOLS,
            BuildCommand::Update => UPDATE_TOOLS,
            BuildCommand::Image => IMAGE_TOOLS,
            BuildCommand::All => ALL_TOOLS,
        }
    }
}

/// Whether `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Fail with every missing tool and the package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        return Err(MixError::config(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        )));
    }
    tracing::debug!(count = tools.len(), "host tools present");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_the_union_of_its_parts() {
        for part in [BuildCommand::Bundles, BuildCommand::Update, BuildCommand::Image] {
            for tool in part.required_tools() {
                assert!(BuildCommand::All.required_tools().contains(tool));
            }
        }
        assert_eq!(BuildCommand::All.required_tools().len(), 5);
    }

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn missing_tools_are_configuration_errors() {
        let tools = &[("sh", "dash"), ("nonexistent_command_xyz", "fake-package")];
        match check_required_tools(tools) {
            Err(MixError::Configuration(msg)) => {
                assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
                assert!(!msg.contains("dash"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }
}
