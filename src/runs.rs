//! Per-invocation build journal.
//!
//! Every orchestrator invocation gets `<server_state>/runs/<run_id>/run-manifest.json`
//! listing each step and how it ended. Nothing reads it back to resume; it is
//! for the operator deciding which phase to re-run after a failure.

use crate::content_store::replace_file;
use crate::error::{IoContext, MixError, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

pub const RUNS_DIR: &str = "runs";
const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: RunStatus,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub command: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

pub fn runs_root(server_state_dir: &Path) -> PathBuf {
    server_state_dir.join(RUNS_DIR)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub struct BuildJournal {
    dir: PathBuf,
    manifest: RefCell<RunManifest>,
}

impl BuildJournal {
    /// Allocate a run directory under `runs_root` and write the initial record.
    pub fn start(runs_root: &Path, command: &str) -> Result<Self> {
        let (run_id, dir) = allocate_run_dir(runs_root)?;
        let journal = Self {
            dir,
            manifest: RefCell::new(RunManifest {
                run_id,
                command: command.to_string(),
                status: RunStatus::Running,
                created_at_utc: now_utc_compact(),
                finished_at_utc: None,
                steps: Vec::new(),
            }),
        };
        journal.flush()?;
        Ok(journal)
    }

    pub fn run_id(&self) -> String {
        self.manifest.borrow().run_id.clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `f` as step `name`, recording start and outcome.
    pub fn record<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let index = {
            let mut manifest = self.manifest.borrow_mut();
            manifest.steps.push(StepRecord {
                name: name.to_string(),
                status: RunStatus::Running,
                started_at_utc: now_utc_compact(),
                finished_at_utc: None,
                error: None,
            });
            manifest.steps.len() - 1
        };
        self.flush()?;

        let result = f();
        {
            let mut manifest = self.manifest.borrow_mut();
            let step = &mut manifest.steps[index];
            step.finished_at_utc = Some(now_utc_compact());
            match &result {
                Ok(_) => step.status = RunStatus::Success,
                Err(e) => {
                    step.status = RunStatus::Failed;
                    step.error = Some(e.to_string());
                }
            }
        }
        self.flush()?;
        result
    }

    /// Close the run with an overall outcome.
    pub fn finish(&self, success: bool) -> Result<()> {
        {
            let mut manifest = self.manifest.borrow_mut();
            manifest.status = if success {
                RunStatus::Success
            } else {
                RunStatus::Failed
            };
            manifest.finished_at_utc = Some(now_utc_compact());
        }
        self.flush()
    }

    pub fn snapshot(&self) -> RunManifest {
        self.manifest.borrow().clone()
    }

    fn flush(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&*self.manifest.borrow())
            .map_err(|e| MixError::state(format!("serializing run manifest: {e}")))?;
        replace_file(&manifest_path(&self.dir), &bytes)
    }
}

pub fn load_runs(runs_root: &Path) -> Result<Vec<RunManifest>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_root).io_context("reading runs directory", runs_root)? {
        let entry = entry.io_context("iterating runs directory", runs_root)?;
        let run_dir = entry.path();
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') || !run_dir.is_dir() {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path).io_context("reading run manifest", &path)?;
        let parsed: RunManifest = serde_json::from_slice(&bytes).map_err(|e| {
            MixError::state(format!("parsing run manifest '{}': {e}", path.display()))
        })?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run.run_id.clone()));
    Ok(runs)
}

/// Most recent run, by run id (ids sort by creation time).
pub fn latest_run(runs_root: &Path) -> Result<Option<RunManifest>> {
    Ok(load_runs(runs_root)?.into_iter().next())
}

/// Keep the newest `keep` runs, deleting the rest.
pub fn prune_old_runs(runs_root: &Path, keep: usize) -> Result<usize> {
    let runs = load_runs(runs_root)?;
    let mut removed = 0usize;
    for run in runs.into_iter().skip(keep) {
        let path = runs_root.join(&run.run_id);
        fs::remove_dir_all(&path).io_context("removing expired run directory", &path)?;
        removed += 1;
    }
    Ok(removed)
}

fn allocate_run_dir(runs_root: &Path) -> Result<(String, PathBuf)> {
    for _ in 0..32 {
        let run_id = generate_run_id();
        let run_dir = runs_root.join(&run_id);
        if run_dir.exists() {
            continue;
        }
        fs::create_dir_all(&run_dir).io_context("creating run directory", &run_dir)?;
        return Ok((run_id, run_dir));
    }
    Err(MixError::state(format!(
        "failed allocating a unique run directory under '{}'",
        runs_root.display()
    )))
}

/// Sortable id: nanosecond clock, pid and a sequence number, fixed-width hex.
fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let value = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    format!("{value:032x}")
}

fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
