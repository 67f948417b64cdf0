//! Load, validate and persist the guardian configuration.
//!
//! The configuration lives in `guardian.yaml` inside the repo root. The repo root is taken from
//! `--repo`, then `GUARDIAN_PATH`, then `~/.guardian`. A handful of fields can be overridden with
//! `GUARDIAN_`-prefixed environment variables (see [Config::apply_env]). Overrides are applied
//! after the file is read and are only written back by `config rewrite-with-env`.

use crate::{
    chain::{Filter, NODE_MANAGER_ADDRESS, NODE_UPGRADE_TOPIC, VOTE_EVENT_TOPIC},
    retry,
    telemetry::{self, Rotation},
    utils::{format_duration, parse_duration},
};
use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Name of the configuration file inside the repo root.
pub const CONFIG_FILE: &str = "guardian.yaml";

/// Environment variable naming the repo root.
pub const REPO_ENV: &str = "GUARDIAN_PATH";

/// Repo root used when neither `--repo` nor [REPO_ENV] is set (relative to `$HOME`).
pub const DEFAULT_REPO: &str = ".guardian";

/// Directory (inside the repo root) log files are written to.
pub const LOGS_DIR: &str = "logs";

/// Directory (inside the repo root) releases are downloaded and unpacked into.
pub const STAGING_DIR: &str = "staging";

/// Partition (inside the repo root) holding the durable state.
pub const STATE_PARTITION: &str = "state";

/// Errors that can occur when loading or writing the configuration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("home directory not set")]
    NoHome,
    #[error("io error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {name}: {value:?}")]
    Env { name: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Error {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Log {
    /// Filter directive (`info`, `debug`, `commonware_guardian=trace`, ...).
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    pub json: bool,

    /// File (inside `<repo>/logs`) to append to. Disabled when `null`.
    pub filename: Option<String>,

    /// How often the log file is rotated (`minutely`, `hourly`, `daily` or `never`).
    pub rotation: Rotation,

    /// Rotated log files older than this are deleted.
    #[serde(with = "duration")]
    pub max_age: Duration,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            filename: Some("guardian.log".to_string()),
            rotation: Rotation::Daily,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Which events are followed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Subscribe {
    /// First block to backfill from (`0` is genesis).
    pub from_block: u64,

    /// Last block to backfill to (`0` is latest).
    pub to_block: u64,

    pub addresses: Vec<Address>,

    /// Topic matrix (at most four positions). An empty position matches any topic.
    pub topics: Vec<Vec<B256>>,
}

impl Default for Subscribe {
    fn default() -> Self {
        Self {
            from_block: 1,
            to_block: 0,
            addresses: vec![NODE_MANAGER_ADDRESS],
            topics: vec![vec![VOTE_EVENT_TOPIC], Vec::new(), vec![NODE_UPGRADE_TOPIC]],
        }
    }
}

/// Download and reconnect retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Retry {
    pub attempts: usize,

    #[serde(with = "duration")]
    pub backoff: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: retry::DEFAULT_ATTEMPTS,
            backoff: retry::DEFAULT_BACKOFF,
        }
    }
}

/// Guardian configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// WebSocket JSON-RPC endpoint of the node.
    pub dial_url: String,

    /// Directory of the running node (holds `version.sh` and `restart.sh`). A leading `~` is
    /// expanded to `$HOME`.
    pub install_path: PathBuf,

    /// Name of the node binary inside a release archive.
    pub binary: String,

    pub log: Log,
    pub subscribe: Subscribe,
    pub retry: Retry,

    /// Capacity of the installer mailbox.
    pub mailbox_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial_url: "ws://localhost:9991".to_string(),
            install_path: PathBuf::from("~/.axiom"),
            binary: "axiom".to_string(),
            log: Log::default(),
            subscribe: Subscribe::default(),
            retry: Retry::default(),
            mailbox_size: 16,
        }
    }
}

impl Config {
    /// Parse a YAML document. Missing fields take their default value.
    pub fn parse(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Override fields from `GUARDIAN_*` variables returned by `env`.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
        if let Some(value) = env("GUARDIAN_DIAL_URL") {
            self.dial_url = value;
        }
        if let Some(value) = env("GUARDIAN_INSTALL_PATH") {
            self.install_path = PathBuf::from(value);
        }
        if let Some(value) = env("GUARDIAN_BINARY") {
            self.binary = value;
        }
        if let Some(value) = env("GUARDIAN_LOG_LEVEL") {
            self.log.level = value;
        }
        if let Some(value) = env("GUARDIAN_LOG_JSON") {
            self.log.json = parse_env("GUARDIAN_LOG_JSON", value)?;
        }
        if let Some(value) = env("GUARDIAN_SUBSCRIBE_FROM_BLOCK") {
            self.subscribe.from_block = parse_env("GUARDIAN_SUBSCRIBE_FROM_BLOCK", value)?;
        }
        if let Some(value) = env("GUARDIAN_SUBSCRIBE_TO_BLOCK") {
            self.subscribe.to_block = parse_env("GUARDIAN_SUBSCRIBE_TO_BLOCK", value)?;
        }
        Ok(())
    }

    /// Check that every field can be used to start the engine.
    pub fn validate(&self) -> Result<(), Error> {
        let url = reqwest::Url::parse(&self.dial_url)
            .map_err(|err| Error::Invalid(format!("dial_url {:?}: {err}", self.dial_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Invalid(format!(
                "dial_url must be ws(s): {:?}",
                self.dial_url
            )));
        }
        if self.binary.is_empty() || self.binary.contains('/') {
            return Err(Error::Invalid(format!("binary {:?}", self.binary)));
        }
        if self.install_path.as_os_str().is_empty() {
            return Err(Error::Invalid("install_path is empty".to_string()));
        }
        if self.mailbox_size == 0 {
            return Err(Error::Invalid("mailbox_size must be positive".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Invalid("retry.attempts must be positive".to_string()));
        }
        tracing_subscriber::EnvFilter::try_new(&self.log.level)
            .map_err(|err| Error::Invalid(format!("log.level {:?}: {err}", self.log.level)))?;
        if let Some(filename) = &self.log.filename {
            if filename.is_empty() || filename.contains('/') {
                return Err(Error::Invalid(format!("log.filename {filename:?}")));
            }
        }
        let subscribe = &self.subscribe;
        if subscribe.to_block != 0 && subscribe.to_block < subscribe.from_block {
            return Err(Error::Invalid(format!(
                "subscribe.to_block {} is before subscribe.from_block {}",
                subscribe.to_block, subscribe.from_block
            )));
        }
        if subscribe.topics.len() > 4 {
            return Err(Error::Invalid(format!(
                "subscribe.topics has {} positions (at most 4)",
                subscribe.topics.len()
            )));
        }
        Ok(())
    }

    /// The events to follow. A zero block bound means unbounded.
    pub fn filter(&self) -> Filter {
        let bound = |block: u64| (block != 0).then_some(block);
        Filter {
            addresses: self.subscribe.addresses.clone(),
            topics: self.subscribe.topics.clone(),
            from_block: bound(self.subscribe.from_block),
            to_block: bound(self.subscribe.to_block),
        }
    }

    pub fn retry_policy(&self) -> retry::Policy {
        retry::Policy::new(self.retry.attempts, self.retry.backoff)
    }

    /// The install path with a leading `~` expanded against `home`.
    pub fn install_path(&self, home: Option<&Path>) -> Result<PathBuf, Error> {
        expand_home(&self.install_path, home)
    }

    /// The log file inside `root`, if file output is enabled.
    pub fn log_file(&self, root: &Path) -> Option<telemetry::File> {
        self.log.filename.as_ref().map(|filename| telemetry::File {
            path: root.join(LOGS_DIR).join(filename),
            rotation: self.log.rotation,
            max_age: self.log.max_age,
        })
    }

    /// Atomically replace the configuration file in `root`.
    pub fn write(&self, root: &Path) -> Result<(), Error> {
        let yaml = self.to_yaml()?;
        fs::create_dir_all(root).map_err(|err| Error::io(root, err))?;
        let path = root.join(CONFIG_FILE);
        let tmp = root.join(format!("{CONFIG_FILE}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(|err| Error::io(&tmp, err))?;
        file.write_all(yaml.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|err| Error::io(&tmp, err))?;
        fs::rename(&tmp, &path).map_err(|err| Error::io(&path, err))
    }
}

/// Reads process environment variables.
pub fn system_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Resolve the repo root from the `--repo` flag, [REPO_ENV] or `$HOME/.guardian`.
pub fn repo_root(
    flag: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, Error> {
    let home = env("HOME").map(PathBuf::from);
    if let Some(flag) = flag {
        return expand_home(flag, home.as_deref());
    }
    if let Some(path) = env(REPO_ENV) {
        return expand_home(Path::new(&path), home.as_deref());
    }
    home.map(|home| home.join(DEFAULT_REPO)).ok_or(Error::NoHome)
}

/// Whether `root` holds a configuration file.
pub fn exists(root: &Path) -> bool {
    root.join(CONFIG_FILE).is_file()
}

/// Read the configuration in `root` and apply environment overrides.
pub fn read(root: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    let path = root.join(CONFIG_FILE);
    let yaml = fs::read_to_string(&path).map_err(|err| Error::io(&path, err))?;
    let mut config = Config::parse(&yaml)?;
    config.apply_env(env)?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration in `root`, writing the defaults first if there is none.
///
/// An existing repo must be writable (the durable state and log files are kept next to the
/// configuration).
pub fn load(root: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
    if !exists(root) {
        Config::default().write(root)?;
    } else {
        check_writable(root)?;
    }
    read(root, env)
}

fn check_writable(root: &Path) -> Result<(), Error> {
    let probe = root.join(".write-test");
    fs::write(&probe, b"").map_err(|err| Error::io(root, err))?;
    fs::remove_file(&probe).map_err(|err| Error::io(&probe, err))
}

fn expand_home(path: &Path, home: Option<&Path>) -> Result<PathBuf, Error> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = home.ok_or(Error::NoHome)?;
    Ok(home.join(rest))
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, Error> {
    value.trim().parse().map_err(|_| Error::Env { name, value })
}

mod duration {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(de::Error::custom)
    }
}
