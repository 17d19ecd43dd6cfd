use super::MixState;
use std::ops::Deref;

/// Temporarily overrides version/format on a [`MixState`]; the prior values
/// come back when the guard drops, including during unwinding.
pub struct ScopedOverride<'a> {
    state: &'a mut MixState,
    prior_version: u32,
    prior_format: String,
}

impl<'a> ScopedOverride<'a> {
    pub fn apply(state: &'a mut MixState, version: Option<u32>, format: &str) -> Self {
        let prior_version = state.mix_version;
        let prior_format = std::mem::replace(&mut state.format, format.to_string());
        if let Some(version) = version {
            state.mix_version = version;
        }
        tracing::debug!(
            version = state.mix_version,
            format = %state.format,
            "applied scoped state override"
        );
        Self {
            state,
            prior_version,
            prior_format,
        }
    }
}

impl Deref for ScopedOverride<'_> {
    type Target = MixState;

    fn deref(&self) -> &MixState {
        &*self.state
    }
}

impl Drop for ScopedOverride<'_> {
    fn drop(&mut self) {
        self.state.mix_version = self.prior_version;
        self.state.format = std::mem::take(&mut self.prior_format);
    }
}
