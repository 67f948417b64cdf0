//! Run external commands.
//!
//! The guardian drives the co-located service through two scripts shipped with every release:
//! `version.sh` (prints `<label>: <version>`) and `restart.sh` (swaps in a new binary). Both,
//! as well as `tar`, are executed through the [Shell] capability so tests can substitute
//! `mocks::Shell`.

use std::{
    future::Future,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Script that reports the version of a release.
pub const VERSION_SCRIPT: &str = "version.sh";

/// Script that restarts the service with a new binary.
pub const RESTART_SCRIPT: &str = "restart.sh";

/// Errors that can occur when running commands.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("missing script: {0}")]
    MissingScript(PathBuf),
    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected version output: {0:?}")]
    UnexpectedOutput(String),
}

/// Result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code (`None` if terminated by a signal).
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes programs on the host.
pub trait Shell: Clone + Send + Sync + 'static {
    /// Run `program` with `args` in `dir` and wait for it to exit.
    fn run(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
    ) -> impl Future<Output = Result<Output, Error>> + Send;
}

/// [Shell] backed by [tokio::process::Command].
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

impl Shell for System {
    async fn run(&self, program: &str, args: &[String], dir: &Path) -> Result<Output, Error> {
        debug!(program, ?args, ?dir, "running command");
        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;
        Ok(Output {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `program`, failing unless it exits with zero.
pub async fn run_checked<S: Shell>(
    shell: &S,
    program: &str,
    args: &[String],
    dir: &Path,
) -> Result<Output, Error> {
    let output = shell.run(program, args, dir).await?;
    if !output.success() {
        let mut command = program.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        return Err(Error::Failed {
            command,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Report the version of the release in `dir` by running its `version.sh`.
pub async fn probe_version<S: Shell>(shell: &S, dir: &Path) -> Result<String, Error> {
    let script = dir.join(VERSION_SCRIPT);
    if !script.is_file() {
        return Err(Error::MissingScript(script));
    }
    let output = run_checked(shell, "bash", &[VERSION_SCRIPT.to_string()], dir).await?;
    match parse_version(&output.stdout) {
        Some(version) => Ok(version),
        None => Err(Error::UnexpectedOutput(output.stdout)),
    }
}

/// Restart the service in `install_path` with the binary at `binary`.
pub async fn restart<S: Shell>(shell: &S, install_path: &Path, binary: &Path) -> Result<(), Error> {
    let script = install_path.join(RESTART_SCRIPT);
    if !script.is_file() {
        return Err(Error::MissingScript(script));
    }
    let args = [RESTART_SCRIPT.to_string(), binary.display().to_string()];
    run_checked(shell, "bash", &args, install_path).await?;
    Ok(())
}

/// Extract the version from `<label>: <version>\n...`.
///
/// The version is the text after the first `": "` up to the next newline (or the end).
pub fn parse_version(stdout: &str) -> Option<String> {
    let (_, rest) = stdout.split_once(": ")?;
    let version = rest.split('\n').next()?.trim_end_matches('\r');
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}
