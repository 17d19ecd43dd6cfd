//! Content-addressed store backing cross-version content aliasing.
//!
//! Layout under `<server_state>/.content/`:
//!
//! ```text
//! blobs/sha256/<aa>/<sha256>   file bytes, hard-linked into version trees
//! index/<version>.json         relative path -> sha256 for one version tree
//! locks/<version>.lock         exclusive lock while a version index is written
//! ```
//!
//! A version tree never owns an independent copy of a file that another
//! version also publishes: both trees and the blob are links to the same
//! inode. Because of that, files under `image/<version>/` must never be
//! truncated or rewritten in place once a clone has happened; use
//! [`replace_file`] which writes a sibling and renames it over the path.

use crate::error::{IoContext, MixError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Store directory name inside the server state root.
pub const DEFAULT_STORE_DIR: &str = ".content";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One regular file of a version tree, referenced by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Hash index of one version's content tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionIndex {
    pub version: u32,
    pub stored_at_unix: u64,
    /// Version whose tree this one was cloned from, if any.
    #[serde(default)]
    pub cloned_from: Option<u32>,
    pub files: BTreeMap<String, FileRef>,
}

/// What a clone produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneSummary {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (and create if needed) the store under `server_state_dir`.
    pub fn open(server_state_dir: &Path) -> Result<Self> {
        let store = Self {
            root: server_state_dir.join(DEFAULT_STORE_DIR),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.blobs_dir().join("sha256"),
            self.index_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir).io_context("creating content store directory", &dir)?;
        }
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn index_path(&self, version: u32) -> PathBuf {
        self.index_dir().join(format!("{version}.json"))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            return Err(MixError::state(format!("invalid sha256 '{sha256}'")));
        }
        Ok(self
            .blobs_dir()
            .join("sha256")
            .join(&sha256[..2])
            .join(sha256))
    }

    /// Record `path` in the store. The blob is a hard link to `path` when the
    /// content is new; existing blobs are left as they are.
    pub fn adopt_file(&self, path: &Path) -> Result<FileRef> {
        let (sha256, size_bytes) = sha256_file(path)?;
        let blob = self.blob_path(&sha256)?;
        if !blob.exists() {
            if let Some(parent) = blob.parent() {
                fs::create_dir_all(parent).io_context("creating blob directory", parent)?;
            }
            fs::hard_link(path, &blob).io_context("linking file into content store", path)?;
        }
        Ok(FileRef { sha256, size_bytes })
    }

    /// Alias the tree at `src` into `dst` so every regular file shares
    /// storage with its counterpart, and index both versions.
    ///
    /// The destination is assembled in a hidden sibling directory and renamed
    /// into place, replacing a stale tree left by an earlier failed run.
    /// A failed hard link is an error; an independent copy is never made.
    pub fn clone_version_tree(
        &self,
        src: &Path,
        src_version: u32,
        dst: &Path,
        dst_version: u32,
    ) -> Result<CloneSummary> {
        if !src.is_dir() {
            return Err(MixError::Io {
                context: "content tree to clone is missing".to_string(),
                path: src.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let _lock = self.acquire_lock(dst_version)?;

        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        let dst_name = dst
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tree")
            .to_string();
        let staging = StagingDir::new(parent.join(tmp_name(&format!(".{dst_name}.clone"))));

        let mut summary = CloneSummary::default();
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| MixError::Io {
                context: "walking content tree".to_string(),
                path: src.to_path_buf(),
                source: e.into(),
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|_| MixError::state(format!("path escaped '{}'", src.display())))?;
            let target = staging.path.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&target).io_context("creating cloned directory", &target)?;
                summary.dirs += 1;
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())
                    .io_context("reading symlink", entry.path())?;
                make_symlink(&link, &target)?;
                summary.symlinks += 1;
            } else if file_type.is_file() {
                let file_ref = self.adopt_file(entry.path())?;
                fs::hard_link(entry.path(), &target)
                    .io_context("aliasing file into cloned tree", &target)?;
                files.insert(rel.to_string_lossy().into_owned(), file_ref);
                summary.files += 1;
            } else {
                return Err(MixError::state(format!(
                    "cannot alias special file '{}' (not a directory, symlink or regular file)",
                    entry.path().display()
                )));
            }
        }

        if dst.exists() {
            tracing::warn!(path = %dst.display(), "replacing existing content tree");
            fs::remove_dir_all(dst).io_context("removing stale content tree", dst)?;
        }
        fs::rename(&staging.path, dst).io_context("moving cloned tree into place", dst)?;
        staging.keep();

        let now = now_unix();
        self.write_index(&VersionIndex {
            version: src_version,
            stored_at_unix: now,
            cloned_from: None,
            files: files.clone(),
        })?;
        self.write_index(&VersionIndex {
            version: dst_version,
            stored_at_unix: now,
            cloned_from: Some(src_version),
            files,
        })?;

        tracing::info!(
            from = src_version,
            to = dst_version,
            files = summary.files,
            dirs = summary.dirs,
            symlinks = summary.symlinks,
            "cloned content tree"
        );
        Ok(summary)
    }

    /// Check that every regular file under `src` has a counterpart under
    /// `dst` sharing the same storage.
    pub fn verify_clone(&self, src: &Path, dst: &Path) -> Result<usize> {
        let mut checked = 0usize;
        for entry in WalkDir::new(src).follow_links(false) {
            let entry = entry.map_err(|e| MixError::Io {
                context: "walking content tree".to_string(),
                path: src.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|_| MixError::state(format!("path escaped '{}'", src.display())))?;
            let twin = dst.join(rel);
            if !twin.is_file() || !shares_storage(entry.path(), &twin)? {
                return Err(MixError::state(format!(
                    "'{}' is not aliased to '{}'",
                    twin.display(),
                    entry.path().display()
                )));
            }
            checked += 1;
        }
        Ok(checked)
    }

    pub fn load_index(&self, version: u32) -> Result<Option<VersionIndex>> {
        let path = self.index_path(version);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).io_context("reading version index", &path)?;
        let index = serde_json::from_slice(&bytes).map_err(|e| {
            MixError::state(format!("parsing version index '{}': {e}", path.display()))
        })?;
        Ok(Some(index))
    }

    /// Remove blobs no version index references. Returns how many were removed.
    pub fn gc(&self) -> Result<usize> {
        let referenced = self.collect_referenced_blobs()?;
        let blobs_root = self.blobs_dir().join("sha256");

        let mut removed = 0usize;
        for ent in WalkDir::new(&blobs_root).into_iter().filter_map(|e| e.ok()) {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(ent.path()).io_context("removing unreferenced blob", ent.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    fn write_index(&self, index: &VersionIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| MixError::state(format!("serializing version index: {e}")))?;
        replace_file(&self.index_path(index.version), &bytes)
    }

    fn collect_referenced_blobs(&self) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for ent in WalkDir::new(self.index_dir())
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !ent.file_type().is_file()
                || ent.path().extension().and_then(|s| s.to_str()) != Some("json")
            {
                continue;
            }
            let Ok(bytes) = fs::read(ent.path()) else {
                continue;
            };
            let Ok(index) = serde_json::from_slice::<VersionIndex>(&bytes) else {
                continue;
            };
            out.extend(index.files.into_values().map(|f| f.sha256));
        }
        Ok(out)
    }

    fn acquire_lock(&self, version: u32) -> Result<StoreLock> {
        let path = self.locks_dir().join(format!("{version}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context("creating content store lock", &path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(MixError::state(format!(
                "content tree for version {version} is locked by another process: {}",
                path.display()
            )));
        }
        Ok(StoreLock { _file: file, path })
    }
}

/// Unlocks and removes the lock file on drop.
#[derive(Debug)]
struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Removes a half-built clone on drop unless it was moved into place.
#[derive(Debug)]
struct StagingDir {
    path: PathBuf,
    keep: bool,
}

impl StagingDir {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            tracing::debug!(path = %self.path.display(), "removing unfinished clone");
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
///
/// Any hard link that `path` had is broken for this path only; the twin in
/// another version tree keeps the old bytes.
pub fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).io_context("creating parent directory", parent)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = parent.join(tmp_name(&format!(".{name}")));
    fs::write(&tmp, bytes).io_context("writing temp file", &tmp)?;
    fs::rename(&tmp, path).io_context("renaming temp file into place", path)?;
    Ok(())
}

/// True when `a` and `b` are the same underlying file.
#[cfg(unix)]
pub fn shares_storage(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let ma = fs::symlink_metadata(a).io_context("reading metadata", a)?;
    let mb = fs::symlink_metadata(b).io_context("reading metadata", b)?;
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

#[cfg(not(unix))]
pub fn shares_storage(_a: &Path, _b: &Path) -> Result<bool> {
    Err(MixError::config(
        "storage identity checks are only supported on unix hosts",
    ))
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).io_context("recreating symlink", target)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, target: &Path) -> Result<()> {
    Err(MixError::config(format!(
        "cannot recreate symlink '{}' on this host",
        target.display()
    )))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-tmp-{}-{n}-{seq}", std::process::id())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context("opening file for hashing", path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf).io_context("reading file for hashing", path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
