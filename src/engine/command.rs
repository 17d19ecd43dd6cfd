//! Content engine backed by an external executable.
//!
//! Every operation is `<engine> <operation> [flags]`, with the state snapshot
//! exported through the environment:
//!
//! - `MIX_VERSION`, `MIX_FORMAT`, `MIX_UPSTREAM_VERSION`
//! - `MIX_SERVER_STATE_DIR`
//! - `MIX_FULLFILE_WORKERS`, `MIX_DELTA_WORKERS`, `MIX_BUNDLE_WORKERS`
//!
//! Resolution order for the executable:
//! 1. `MIX_ENGINE_BIN` env var
//! 2. The configured path, if it exists
//! 3. The configured name looked up in `PATH`

use super::{BundleBuild, ContentEngine, SigningMaterial, UpdateParameters};
use crate::error::{MixError, Result};
use crate::state::MixState;
use crate::workers::WorkerPoolConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Find the engine executable.
pub fn resolve_engine_binary(configured: &str) -> Result<PathBuf> {
    if let Ok(bin) = env::var("MIX_ENGINE_BIN") {
        let path = PathBuf::from(&bin);
        if path.is_file() {
            return Ok(path);
        }
        return Err(MixError::config(format!(
            "MIX_ENGINE_BIN points at '{bin}', which does not exist"
        )));
    }

    let path = PathBuf::from(configured);
    if path.is_file() {
        return Ok(path);
    }

    which::which(configured).map_err(|_| {
        MixError::config(format!(
            "content engine '{configured}' not found.\n\n\
             Resolution order tried:\n\
             1. MIX_ENGINE_BIN env var - not set\n\
             2. configured path '{configured}' - not found\n\
             3. System PATH - not found"
        ))
    })
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    server_state_dir: PathBuf,
    workers: WorkerPoolConfig,
}

struct Output {
    stdout: String,
}

impl CommandEngine {
    pub fn new(program: PathBuf, server_state_dir: &Path, workers: WorkerPoolConfig) -> Self {
        Self {
            program,
            server_state_dir: server_state_dir.to_path_buf(),
            workers,
        }
    }

    fn run(&self, state: &MixState, operation: &str, args: &[String]) -> Result<Output> {
        tracing::debug!(
            engine = %self.program.display(),
            operation,
            version = state.mix_version,
            format = %state.format,
            ?args,
            "invoking content engine"
        );
        let output = Command::new(&self.program)
            .arg(operation)
            .args(args)
            .env("MIX_VERSION", state.mix_version.to_string())
            .env("MIX_FORMAT", &state.format)
            .env("MIX_UPSTREAM_VERSION", &state.upstream_version)
            .env("MIX_SERVER_STATE_DIR", &self.server_state_dir)
            .env("MIX_FULLFILE_WORKERS", self.workers.fullfile_workers.to_string())
            .env("MIX_DELTA_WORKERS", self.workers.delta_workers.to_string())
            .env("MIX_BUNDLE_WORKERS", self.workers.bundle_workers.to_string())
            .output()
            .map_err(|e| {
                MixError::external(
                    operation,
                    format!("failed to execute '{}': {e}", self.program.display()),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MixError::external(
                operation,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(Output { stdout })
    }
}

fn flag(args: &mut Vec<String>, enabled: bool, name: &str) {
    if enabled {
        args.push(name.to_string());
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl ContentEngine for CommandEngine {
    fn generate_signing_material(&self, cert_path: &Path) -> Result<SigningMaterial> {
        let blank = MixState::new(0, "", "");
        let out = self.run(
            &blank,
            "generate-cert",
            &["--cert".to_string(), path_arg(cert_path)],
        )?;

        let mut private_key = None;
        let mut cert_template = None;
        for line in out.stdout.lines() {
            if let Some(v) = line.trim().strip_prefix("key=") {
                private_key = Some(PathBuf::from(v));
            } else if let Some(v) = line.trim().strip_prefix("template=") {
                cert_template = Some(PathBuf::from(v));
            }
        }
        match (private_key, cert_template) {
            (Some(private_key), Some(cert_template)) => Ok(SigningMaterial {
                private_key,
                cert_template,
            }),
            _ => Err(MixError::external(
                "generate-cert",
                "expected 'key=<path>' and 'template=<path>' on stdout",
            )),
        }
    }

    fn build_bundles(&self, state: &MixState, build: &BundleBuild) -> Result<()> {
        let mut args = Vec::new();
        flag(&mut args, build.clean, "--clean");
        flag(&mut args, build.skip_signing, "--no-signing");
        if let Some(material) = &build.signing {
            args.push("--key".to_string());
            args.push(path_arg(&material.private_key));
            args.push("--template".to_string());
            args.push(path_arg(&material.cert_template));
        }
        self.run(state, "build-bundles", &args).map(drop)
    }

    fn build_update(&self, state: &MixState, params: &UpdateParameters) -> Result<()> {
        let mut args = vec![
            "--format".to_string(),
            params.format.clone(),
            "--min-version".to_string(),
            params.min_version.to_string(),
        ];
        flag(&mut args, !params.publish, "--no-publish");
        flag(&mut args, params.skip_signing, "--no-signing");
        flag(&mut args, params.skip_fullfiles, "--skip-fullfiles");
        flag(&mut args, params.skip_packs, "--skip-packs");
        self.run(state, "build-update", &args).map(drop)
    }

    fn build_image(&self, state: &MixState, format: &str, template: Option<&Path>) -> Result<()> {
        let mut args = vec!["--format".to_string(), format.to_string()];
        if let Some(template) = template {
            args.push("--template".to_string());
            args.push(path_arg(template));
        }
        self.run(state, "build-image", &args).map(drop)
    }

    fn build_delta_packs(&self, state: &MixState, from: u32, to: u32, report: bool) -> Result<()> {
        let mut args = vec![
            "--from".to_string(),
            from.to_string(),
            "--to".to_string(),
            to.to_string(),
        ];
        flag(&mut args, report, "--report");
        self.run(state, "build-delta-packs", &args).map(drop)
    }

    fn add_rpm_list(&self, state: &MixState, rpms: &[PathBuf]) -> Result<()> {
        let args: Vec<String> = rpms.iter().map(|p| path_arg(p)).collect();
        self.run(state, "add-rpms", &args).map(drop)
    }

    fn bump_needed(&self, state: &MixState) -> Result<bool> {
        let out = self.run(state, "bump-needed", &[])?;
        match out.stdout.trim() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            other => Err(MixError::external(
                "bump-needed",
                format!("unexpected answer '{other}'"),
            )),
        }
    }

    fn latest_upstream_in_format(&self, state: &MixState) -> Result<String> {
        let out = self.run(state, "latest-upstream-in-format", &[])?;
        let version = out.stdout.trim();
        if version.is_empty() {
            return Err(MixError::external(
                "latest-upstream-in-format",
                "engine printed no version",
            ));
        }
        Ok(version.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::workers::{FixedParallelism, WorkerRequest};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("engine.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn engine(program: PathBuf, dir: &Path) -> CommandEngine {
        let workers = WorkerPoolConfig::resolve(
            WorkerRequest {
                fullfile: 3,
                delta: 2,
                bundle: 1,
            },
            &FixedParallelism(4),
        );
        CommandEngine::new(program, dir, workers)
    }

    #[test]
    fn update_flags_and_snapshot_reach_the_engine() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let program = script(
            tmp.path(),
            &format!(
                "echo \"$@|$MIX_VERSION|$MIX_FORMAT|$MIX_FULLFILE_WORKERS\" >> {}",
                log.display()
            ),
        );
        let engine = engine(program, tmp.path());
        let state = MixState::new(110, "31000", "1");
        engine
            .build_update(
                &state,
                &UpdateParameters {
                    min_version: 0,
                    format: "1".to_string(),
                    publish: false,
                    skip_signing: true,
                    skip_fullfiles: false,
                    skip_packs: true,
                },
            )
            .unwrap();

        let line = fs::read_to_string(&log).unwrap();
        assert_eq!(
            line.trim(),
            "build-update --format 1 --min-version 0 --no-publish --no-signing --skip-packs|110|1|3"
        );
    }

    #[test]
    fn delta_range_and_report_reach_the_engine() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let program = script(
            tmp.path(),
            &format!("echo \"$@|$MIX_DELTA_WORKERS\" >> {}", log.display()),
        );
        let engine = engine(program, tmp.path());
        let state = MixState::new(80, "31000", "1");

        engine.build_delta_packs(&state, 50, 80, true).unwrap();
        engine.build_delta_packs(&state, 60, 80, false).unwrap();

        let log = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(
            lines,
            vec![
                "build-delta-packs --from 50 --to 80 --report|2",
                "build-delta-packs --from 60 --to 80|2",
            ]
        );
    }

    #[test]
    fn failing_engine_is_external_tool_error() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "echo broken >&2; exit 3");
        let engine = engine(program, tmp.path());
        let err = engine
            .build_image(&MixState::new(10, "1", "1"), "1", None)
            .unwrap_err();
        match err {
            MixError::ExternalTool { operation, message } => {
                assert_eq!(operation, "build-image");
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bump_needed_parses_answer() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "echo true");
        let engine = engine(program, tmp.path());
        assert!(engine.bump_needed(&MixState::new(10, "1", "1")).unwrap());
    }

    #[test]
    fn signing_material_is_read_from_stdout() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "echo key=/tmp/k.pem; echo template=/tmp/t.cfg");
        let engine = engine(program, tmp.path());
        let material = engine
            .generate_signing_material(&tmp.path().join("Swupd_Root.pem"))
            .unwrap();
        assert_eq!(material.private_key, PathBuf::from("/tmp/k.pem"));
        assert_eq!(material.cert_template, PathBuf::from("/tmp/t.cfg"));
    }
}
