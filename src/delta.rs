//! Delta-pack range resolution.
//!
//! A client updating a bundle looks for a pack from its current version to
//! the new one. The operator either names one source version (`--from`) or
//! asks for packs from the N versions actually published before the target
//! (`--previous-versions`). The latter follows the `previous:` chain of the
//! published manifests, so gaps in version numbering are walked over rather
//! than stepped through arithmetically.

use crate::engine::ContentEngine;
use crate::error::{MixError, Result};
use crate::history::VersionHistory;
use crate::state::MixState;

/// One delta-pack build request as given by the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaPackRequest {
    pub from_version: Option<u32>,
    pub previous_versions: Option<u32>,
    /// Target version; the current mix version when unset.
    pub to_version: Option<u32>,
    /// Ask the engine to explain per file why it was packed or not.
    pub report: bool,
}

/// A concrete `(from, to)` pack to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaPair {
    pub from: u32,
    pub to: u32,
}

pub struct DeltaPackRangeResolver<'a> {
    history: &'a dyn VersionHistory,
}

impl<'a> DeltaPackRangeResolver<'a> {
    pub fn new(history: &'a dyn VersionHistory) -> Self {
        Self { history }
    }

    /// Turn `request` into pairs, newest source first.
    pub fn resolve(&self, request: &DeltaPackRequest, current_version: u32) -> Result<Vec<DeltaPair>> {
        let to = request.to_version.unwrap_or(current_version);
        match (request.from_version, request.previous_versions) {
            (Some(_), Some(_)) | (None, None) => Err(MixError::config(
                "either --from or --previous-versions must be set, but not both",
            )),
            (Some(from), None) => {
                if from >= to {
                    return Err(MixError::config(format!(
                        "--from version {from} must be lower than the target version {to}"
                    )));
                }
                Ok(vec![DeltaPair { from, to }])
            }
            (None, Some(count)) => self.previous_pairs(count, to),
        }
    }

    fn previous_pairs(&self, count: u32, to: u32) -> Result<Vec<DeltaPair>> {
        if !self.history.is_published(to)? {
            return Err(MixError::state(format!(
                "target version {to} has not been published"
            )));
        }

        let mut pairs = Vec::new();
        let mut cursor = self.history.previous_of(to)?;
        while let Some(from) = cursor {
            if pairs.len() as u32 >= count {
                break;
            }
            if from >= to {
                return Err(MixError::state(format!(
                    "published history is not increasing: {from} precedes {to}"
                )));
            }
            pairs.push(DeltaPair { from, to });
            if !self.history.is_published(from)? {
                break;
            }
            cursor = self.history.previous_of(from)?;
        }

        if (pairs.len() as u32) < count {
            tracing::warn!(
                requested = count,
                found = pairs.len(),
                to,
                "fewer published versions than requested"
            );
        }
        Ok(pairs)
    }

    /// Resolve and ask the engine for each pack in order.
    pub fn build(
        &self,
        engine: &dyn ContentEngine,
        state: &MixState,
        request: &DeltaPackRequest,
    ) -> Result<Vec<DeltaPair>> {
        let pairs = self.resolve(request, state.mix_version)?;
        for pair in &pairs {
            tracing::info!(from = pair.from, to = pair.to, report = request.report, "building delta packs");
            engine.build_delta_packs(state, pair.from, pair.to, request.report)?;
        }
        Ok(pairs)
    }
}
