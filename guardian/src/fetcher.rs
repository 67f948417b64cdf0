//! Download, verify and unpack release artifacts.
//!
//! Each attempt picks one mirror uniformly at random and streams the artifact into the
//! staging directory, hashing it as it is written. An attempt that fails part way removes what
//! it wrote. The whole download is retried under the configured [retry::Policy]. Once a
//! download succeeds, its SHA-256 digest must match the digest carried by the proposal (a
//! mismatch is never retried). Only then is the archive unpacked into a fresh directory and the
//! version of the release probed with its `version.sh`.

use crate::{
    retry,
    shell::{self, Shell},
    utils::{from_hex_formatted, hex},
};
use futures::StreamExt;
use rand::{seq::SliceRandom, RngCore};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

/// Errors that can occur when fetching an artifact.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no mirrors")]
    NoMirrors,
    #[error("fetch failed after {attempts} attempts: {reason}")]
    FetchExhausted { attempts: usize, reason: String },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("unpack failed: {0}")]
    Unpack(shell::Error),
    #[error("probe failed: {0}")]
    Probe(shell::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single download attempt fails.
#[derive(Debug, Error)]
enum Attempt {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the [Fetcher].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory downloads and unpacked releases are written to.
    pub staging: PathBuf,

    /// Name of the service binary inside a release.
    pub binary: String,

    /// Retry policy for downloads.
    pub retry: retry::Policy,
}

/// An unpacked and verified release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    /// Downloaded archive.
    pub archive: PathBuf,

    /// Directory the archive was unpacked into.
    pub directory: PathBuf,

    /// Path of the service binary in [Fetched::directory].
    pub binary: PathBuf,

    /// Version reported by the release.
    pub version: String,
}

/// Retrieves release artifacts.
pub struct Fetcher<S: Shell, R: RngCore> {
    cfg: Config,
    http: reqwest::Client,
    shell: S,
    rng: R,
}

impl<S: Shell, R: RngCore + Send> Fetcher<S, R> {
    pub fn new(cfg: Config, shell: S, rng: R) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            shell,
            rng,
        }
    }

    /// Fetch the artifact served by `urls`, verify it against `expected_hash` and unpack it.
    pub async fn fetch(&mut self, urls: &[String], expected_hash: &str) -> Result<Fetched, Error> {
        if urls.is_empty() {
            return Err(Error::NoMirrors);
        }
        fs::create_dir_all(&self.cfg.staging).await?;

        // Download from a random mirror per attempt
        let policy = self.cfg.retry;
        let http = &self.http;
        let staging = self.cfg.staging.as_path();
        let rng = &mut self.rng;
        let (archive, digest) = policy
            .run("download", |attempt| {
                let url = urls
                    .choose(&mut *rng)
                    .map(String::as_str)
                    .unwrap_or_default();
                async move {
                    debug!(attempt, url, "downloading artifact");
                    download(http, url, staging).await
                }
            })
            .await
            .map_err(|err| Error::FetchExhausted {
                attempts: policy.attempts.max(1),
                reason: err.to_string(),
            })?;

        // Verify before anything is unpacked
        verify(&digest, expected_hash)?;

        // Unpack into a fresh directory
        let directory = unpack(&self.shell, &self.cfg, &archive).await?;
        let version = shell::probe_version(&self.shell, &directory)
            .await
            .map_err(Error::Probe)?;
        info!(?directory, version, "fetched release");
        Ok(Fetched {
            archive,
            binary: directory.join(&self.cfg.binary),
            directory,
            version,
        })
    }
}

/// Unpack `archive` into a fresh directory under the staging directory.
async fn unpack<S: Shell>(shell: &S, cfg: &Config, archive: &Path) -> Result<PathBuf, Error> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let directory = cfg.staging.join(format!("{}-{nanos}", cfg.binary));
    fs::create_dir_all(&directory).await?;
    let args = [
        "-zxf".to_string(),
        archive.display().to_string(),
        "-C".to_string(),
        directory.display().to_string(),
    ];
    if let Err(err) = shell::run_checked(shell, "tar", &args, &cfg.staging).await {
        if let Err(cleanup) = fs::remove_dir_all(&directory).await {
            warn!(?directory, ?cleanup, "unable to remove partial unpack");
        }
        return Err(Error::Unpack(err));
    }
    Ok(directory)
}

/// Download `url` into `staging`, named after the last segment of its path.
///
/// Returns the path of the archive and its SHA-256 digest. A partially written archive is
/// removed.
async fn download(
    http: &reqwest::Client,
    url: &str,
    staging: &Path,
) -> Result<(PathBuf, [u8; 32]), Attempt> {
    let name = file_name(url).ok_or_else(|| Attempt::InvalidUrl(url.to_string()))?;
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Attempt::Status {
            url: url.to_string(),
            status,
        });
    }
    let path = staging.join(name);
    match copy(response, &path).await {
        Ok((digest, len)) => {
            debug!(url, ?path, len, "downloaded artifact");
            Ok((path, digest))
        }
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&path).await {
                warn!(?path, ?cleanup, "unable to remove partial download");
            }
            Err(err)
        }
    }
}

/// Stream the body of `response` into `path`, returning its digest and length.
async fn copy(response: reqwest::Response, path: &Path) -> Result<([u8; 32], u64), Attempt> {
    let mut file = fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut len = 0;
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        len += chunk.len() as u64;
    }
    file.flush().await?;
    Ok((hasher.finalize().into(), len))
}

fn file_name(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    let name = url.path_segments()?.last()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Compare `actual` against `expected` (hex, optionally `0x`-prefixed, in either case).
pub fn verify(actual: &[u8], expected: &str) -> Result<(), Error> {
    if from_hex_formatted(expected).as_deref() == Some(actual) {
        return Ok(());
    }
    Err(Error::HashMismatch {
        expected: expected.trim().to_string(),
        actual: hex(actual),
    })
}
