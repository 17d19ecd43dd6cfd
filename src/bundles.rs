//! Transforms applied to deleted bundles during a format bump.
//!
//! The old phase empties a deleted bundle's content so clients see it as
//! removed while the bundle stays addressable; the new phase then drops it
//! from the registries for good.

use crate::content_store::replace_file;
use crate::error::{IoContext, MixError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Replace each named bundle's content directory under `tree` with an empty
/// directory. Files are unlinked, never truncated, so a tree that shares
/// storage with another version is not corrupted.
pub fn replace_with_placeholders(tree: &Path, bundles: &[&str]) -> Result<usize> {
    for name in bundles {
        validate_bundle_name(name)?;
    }
    let mut replaced = 0usize;
    for name in bundles {
        let dir = tree.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).io_context("emptying deleted bundle", &dir)?;
        }
        fs::create_dir_all(&dir).io_context("creating bundle placeholder", &dir)?;
        tracing::info!(bundle = %name, "replaced deleted bundle with empty placeholder");
        replaced += 1;
    }
    Ok(replaced)
}

/// Bundle names become directory names; they must be a single safe segment.
pub fn validate_bundle_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(MixError::state("bundle name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(MixError::state(format!(
            "bundle name must be a safe filename segment: '{name}'"
        )));
    }
    Ok(())
}

/// Rewrite the group registry without the sections for `names`.
/// A missing registry is not an error. Returns how many sections were dropped.
pub fn drop_from_groups_ini(path: &Path, names: &[String]) -> Result<usize> {
    if names.is_empty() || !path.is_file() {
        return Ok(0);
    }
    let raw = fs::read_to_string(path).io_context("reading group registry", path)?;
    let drop: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    let mut out = String::with_capacity(raw.len());
    let mut skipping = false;
    let mut dropped = 0usize;
    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(section) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            skipping = drop.contains(section.trim());
            if skipping {
                dropped += 1;
            }
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }

    if dropped > 0 {
        replace_file(path, out.as_bytes())?;
    }
    Ok(dropped)
}
