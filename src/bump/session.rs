use crate::error::{MixError, Result};
use crate::state::{stride_after, MixState};

/// Versions and formats involved in one old/new pair, fixed at the start of
/// the old phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatBumpSession {
    /// `L`: last published version, recorded as `previous` by both builds.
    pub original_version: u32,
    /// `L+10`: last build in the original format.
    pub old_version: u32,
    /// `L+20`: first build in the new format.
    pub new_version: u32,
    pub old_format: String,
    pub new_format: String,
}

impl FormatBumpSession {
    pub fn derive(last_published: u32, state: &MixState, new_format: &str) -> Result<Self> {
        Self::validate_format(new_format)?;
        let new_format = new_format.trim();
        let old_version = stride_after(last_published)?;
        let new_version = stride_after(old_version)?;
        Ok(Self {
            original_version: last_published,
            old_version,
            new_version,
            old_format: state.format.clone(),
            new_format: new_format.to_string(),
        })
    }

    pub fn validate_format(format: &str) -> Result<()> {
        if format.trim().is_empty() {
            return Err(MixError::config("new format must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_last_published() {
        let state = MixState::new(100, "31000", "1");
        let session = FormatBumpSession::derive(100, &state, " 2 ").unwrap();
        assert_eq!(session.original_version, 100);
        assert_eq!(session.old_version, 110);
        assert_eq!(session.new_version, 120);
        assert_eq!(session.old_format, "1");
        assert_eq!(session.new_format, "2");
    }

    #[test]
    fn empty_format_is_rejected() {
        let state = MixState::new(100, "31000", "1");
        assert!(matches!(
            FormatBumpSession::derive(100, &state, "  "),
            Err(MixError::Configuration(_))
        ));
    }

    #[test]
    fn overflow_near_max_is_state_error() {
        let state = MixState::new(100, "31000", "1");
        assert!(matches!(
            FormatBumpSession::derive(u32::MAX - 15, &state, "2"),
            Err(MixError::State(_))
        ));
    }
}
