//! Error taxonomy for the release build orchestrator.
//!
//! Every error is fatal to the current invocation. The variants exist so the
//! operator can tell a bad flag combination from corrupt state, a failing
//! engine call, or a filesystem problem.

use std::path::{Path, PathBuf};

/// Errors produced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum MixError {
    /// Contradictory or missing flags / configuration values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persisted version/format state is malformed or would go backwards.
    #[error("state error: {0}")]
    State(String),

    /// A delegated content-engine call failed.
    #[error("content engine '{operation}' failed: {message}")]
    ExternalTool { operation: String, message: String },

    /// Read/write/clone failure on a concrete path.
    #[error("{context} '{}': {source}", .path.display())]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MixError>;

impl MixError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalTool {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Attach a path and a short description to `std::io` failures.
pub trait IoContext<T> {
    fn io_context(self, context: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: &str, path: &Path) -> Result<T> {
        self.map_err(|source| MixError::Io {
            context: context.to_string(),
            path: path.to_path_buf(),
            source,
        })
    }
}
