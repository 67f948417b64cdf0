//! Install approved upgrades and reconnect to the restarted node.
//!
//! # Overview
//!
//! The [Actor] is the single owner of the durable [State](crate::state::State), the
//! [Fetcher](crate::fetcher::Fetcher) and the [Shell](crate::shell::Shell). Any task may
//! request a cycle through a [Mailbox], but cycles run one at a time, so no two cycles ever
//! probe, download, restart or write state concurrently.
//!
//! # Cycle
//!
//! Each cycle moves through the following steps, ending early with an [Outcome] or an [Error]:
//!
//! 1. If the previous reconnect failed, reconnect first.
//! 2. Probe the running version (`version.sh` in the install path). With nothing pending the
//!    cycle is [Outcome::Idle]. If the running version is the last applied version the cycle
//!    is [Outcome::Current] and the pending proposal stays in the slot.
//! 3. Take the pending proposal (clearing the slot) and fetch, verify and unpack its release.
//!    A release reporting the running version is recorded as applied without a restart.
//! 4. Invoke `restart.sh` with the new binary. No rollback is attempted on failure.
//! 5. Record the applied version, proposal and cursor.
//! 6. Dial the endpoint again and resubscribe (under the retry policy), handing the new
//!    subscription to the loop. On failure the connection is marked stale and the reconnect
//!    is retried at the start of the next cycle.
//!
//! Failures are logged and returned to the requester; they never stop the actor.

use crate::{
    chain::{self, Filter, Subscription},
    fetcher, retry, shell,
    state::State,
    tracker::Tracker,
};
use std::path::PathBuf;
use thiserror::Error;

mod actor;
pub use actor::Actor;
mod ingress;
pub use ingress::{Mailbox, Message};

/// A subscription established after an install, or the reason none could be.
pub type Replacement = Result<Subscription, chain::Error>;

/// Errors that can end a cycle.
#[derive(Debug, Error)]
pub enum Error {
    #[error("version probe failed: {0}")]
    Probe(shell::Error),
    #[error(transparent)]
    Fetch(#[from] fetcher::Error),
    #[error("restart failed: {0}")]
    Restart(shell::Error),
    #[error("reconnect failed: {0}")]
    Reconnect(String),
    #[error("installer closed")]
    Closed,
}

/// How a cycle ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was pending.
    Idle,
    /// The pending upgrade is already running.
    Current { version: String },
    /// The pending upgrade was installed and the subscription replaced.
    Installed { proposal: u64, version: String },
}

/// Configuration for the [Actor].
pub struct Config<D, S, R> {
    /// Establishes connections to the endpoint.
    pub dialer: D,

    /// Runs `tar`, `version.sh` and `restart.sh`.
    pub shell: S,

    /// Source of randomness for mirror selection.
    pub rng: R,

    /// Pending upgrade slot shared with the loop.
    pub tracker: Tracker,

    /// Cursor and applied-version record.
    pub state: State,

    /// Directory of the running service (holds `version.sh` and `restart.sh`).
    pub install_path: PathBuf,

    /// Directory releases are downloaded and unpacked into.
    pub staging: PathBuf,

    /// Name of the service binary inside a release.
    pub binary: String,

    /// Filter to resubscribe with.
    pub filter: Filter,

    /// Retry policy for downloads and reconnects.
    pub retry: retry::Policy,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetcher::Error as FetchError,
        metadata,
        mocks::{self, mirror::Mirror},
        proposal::{Kind, Proposal, Status, Strategy},
        utils::hex,
    };
    use futures::{channel::mpsc, StreamExt};
    use rand::{rngs::mock::StepRng, Rng};
    use sha2::{Digest, Sha256};
    use std::{env, time::Duration};

    const RELEASE: &[u8] = b"axiom release v2.0.0";

    struct Harness {
        chain: mocks::Chain,
        shell: mocks::Shell,
        tracker: Tracker,
        mailbox: Mailbox,
        replacements: mpsc::Receiver<Replacement>,
        repo: PathBuf,
        install: PathBuf,
    }

    impl Harness {
        fn state_config(&self) -> metadata::Config {
            state_config(&self.repo)
        }

        fn staged(&self) -> Vec<String> {
            let mut entries: Vec<String> = std::fs::read_dir(self.repo.join("download"))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            entries.sort();
            entries
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.repo);
        }
    }

    fn state_config(repo: &std::path::Path) -> metadata::Config {
        metadata::Config {
            directory: repo.to_path_buf(),
            partition: "state".to_string(),
        }
    }

    /// Start an actor for a service running `running`, optionally with an applied record.
    ///
    /// Mirror picks alternate between the first two mirrors of a proposal.
    async fn setup(running: &str, applied: Option<(&str, u64)>) -> Harness {
        let suffix: u64 = rand::thread_rng().gen();
        let repo = env::temp_dir().join(format!("guardian_installer_{suffix}"));
        let install = repo.join("install");
        let shell = mocks::Shell::default();
        shell.install(&install, running).unwrap();
        shell.set_artifact_version("v2.0.0");

        let mut state = State::open(state_config(&repo)).await;
        if let Some((version, proposal)) = applied {
            state.record_install(version, proposal, 0).await;
        }

        let chain = mocks::Chain::new();
        let tracker = Tracker::new();
        let (actor, mailbox) = Actor::new(Config {
            dialer: chain.clone(),
            shell: shell.clone(),
            rng: StepRng::new(0, 1 << 31),
            tracker: tracker.clone(),
            state,
            install_path: install.clone(),
            staging: repo.join("download"),
            binary: "axiom".to_string(),
            filter: Filter::node_upgrades(),
            retry: retry::Policy::new(5, Duration::from_millis(1)),
            mailbox_size: 8,
        });
        let (sender, replacements) = mpsc::channel(8);
        actor.start(sender);
        Harness {
            chain,
            shell,
            tracker,
            mailbox,
            replacements,
            repo,
            install,
        }
    }

    fn upgrade(id: u64, urls: Vec<String>, body: &[u8]) -> Proposal {
        Proposal {
            id,
            kind: Kind::NodeUpgrade,
            strategy: Strategy::Simple,
            proposer: String::new(),
            title: format!("upgrade {id}"),
            description: String::new(),
            block_number: id * 100,
            total_votes: 3,
            pass_votes: Vec::new(),
            reject_votes: Vec::new(),
            status: Status::Approved,
            download_urls: urls,
            check_hash: hex(&Sha256::digest(body)),
        }
    }

    #[tokio::test]
    async fn test_idle() {
        let mut harness = setup("v1.0.0", None).await;
        assert_eq!(harness.mailbox.cycle().await.unwrap(), Outcome::Idle);
        assert_eq!(harness.shell.count("version.sh"), 1);
        assert_eq!(harness.shell.restarts(), 0);
        assert_eq!(harness.chain.dials(), 0);
    }

    #[tokio::test]
    async fn test_already_applied() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", Some(("v1.0.0", 7))).await;
        harness
            .tracker
            .observe(upgrade(7, vec![mirror.url.clone()], RELEASE));

        let outcome = harness.mailbox.cycle().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Current {
                version: "v1.0.0".to_string()
            }
        );
        assert_eq!(mirror.requests(), 0);
        assert_eq!(harness.shell.count("tar"), 0);
        assert_eq!(harness.shell.restarts(), 0);
    }

    #[tokio::test]
    async fn test_applied_version_running_skips_newer_proposal() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", Some(("v1.0.0", 1))).await;
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        let outcome = harness.mailbox.cycle().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Current {
                version: "v1.0.0".to_string()
            }
        );
        assert_eq!(mirror.requests(), 0);
        assert_eq!(harness.shell.restarts(), 0);

        // The skip leaves the slot alone
        assert_eq!(harness.tracker.peek().map(|p| p.id), Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_cycles_install_once() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", None).await;
        harness
            .tracker
            .observe(upgrade(4, vec![mirror.url.clone()], RELEASE));

        let cycles = (0..8).map(|_| {
            let mut mailbox = harness.mailbox.clone();
            async move { mailbox.cycle().await }
        });
        let outcomes = futures::future::join_all(cycles).await;
        let installed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(Outcome::Installed { proposal: 4, .. })))
            .count();
        assert_eq!(installed, 1);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_eq!(mirror.requests(), 1);
        assert_eq!(harness.shell.restarts(), 1);
        assert!(harness.replacements.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_latest_observed_proposal_installed() {
        let stale = Mirror::broken("axiom.tar.gz").await;
        let latest = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", None).await;
        harness
            .tracker
            .observe(upgrade(1, vec![stale.url.clone()], RELEASE));
        harness
            .tracker
            .observe(upgrade(2, vec![latest.url.clone()], RELEASE));

        let outcome = harness.mailbox.cycle().await.unwrap();
        assert!(matches!(outcome, Outcome::Installed { proposal: 2, .. }));
        assert_eq!(stale.requests(), 0);
        assert_eq!(latest.requests(), 1);

        let state = State::open(harness.state_config()).await;
        assert_eq!(state.applied_proposal(), Some(2));
    }

    #[tokio::test]
    async fn test_install_end_to_end() {
        let broken = Mirror::broken("axiom.tar.gz").await;
        let good = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", None).await;
        let urls = vec![broken.url.clone(), good.url.clone()];
        harness.tracker.observe(upgrade(9, urls, RELEASE));

        let outcome = harness.mailbox.cycle().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Installed {
                proposal: 9,
                version: "v2.0.0".to_string()
            }
        );

        // First pick hits the broken mirror, the retry hits the good one
        assert_eq!(broken.requests(), 1);
        assert_eq!(good.requests(), 1);
        assert_eq!(harness.shell.restarts(), 1);
        assert_eq!(
            harness.shell.version(&harness.install).as_deref(),
            Some("v2.0.0")
        );
        assert!(harness.tracker.peek().is_none());
        assert!(!harness.mailbox.is_installing());

        // The loop receives a fresh subscription
        assert!(harness.replacements.next().await.unwrap().is_ok());
        assert_eq!(harness.chain.dials(), 1);
        assert_eq!(harness.chain.subscriptions(), 1);

        // Persisted
        let state = State::open(harness.state_config()).await;
        assert_eq!(state.applied_version(), Some("v2.0.0"));
        assert_eq!(state.applied_proposal(), Some(9));
        assert_eq!(state.cursor(), 900);
        drop(state);

        // The same proposal observed again is a no-op
        harness
            .tracker
            .observe(upgrade(9, vec![good.url.clone()], RELEASE));
        assert_eq!(
            harness.mailbox.cycle().await.unwrap(),
            Outcome::Current {
                version: "v2.0.0".to_string()
            }
        );
        assert_eq!(good.requests(), 1);
        assert_eq!(harness.shell.restarts(), 1);
    }

    #[tokio::test]
    async fn test_install_after_transient_failures() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 4).await;
        let mut harness = setup("v1.0.0", None).await;
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        let outcome = harness.mailbox.cycle().await.unwrap();
        assert!(matches!(outcome, Outcome::Installed { proposal: 2, .. }));
        assert_eq!(mirror.requests(), 5);
        assert_eq!(harness.shell.restarts(), 1);
    }

    #[tokio::test]
    async fn test_fetch_exhausted() {
        let mirror = Mirror::broken("axiom.tar.gz").await;
        let mut harness = setup("v1.0.0", None).await;
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        let err = harness.mailbox.cycle().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Fetch(FetchError::FetchExhausted { attempts: 5, .. })
        ));
        assert_eq!(mirror.requests(), 5);
        assert_eq!(harness.shell.restarts(), 0);

        // The slot was cleared when the download started
        assert!(harness.tracker.peek().is_none());
    }

    #[tokio::test]
    async fn test_hash_mismatch() {
        let mirror = Mirror::start("axiom.tar.gz", b"tampered release", 0).await;
        let mut harness = setup("v1.0.0", Some(("v0.9.0", 1))).await;
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        let err = harness.mailbox.cycle().await.unwrap_err();
        assert!(matches!(err, Error::Fetch(FetchError::HashMismatch { .. })));
        assert_eq!(harness.shell.count("tar"), 0);
        assert_eq!(harness.shell.restarts(), 0);

        // No unpack directory, only the raw download
        assert_eq!(harness.staged(), vec!["axiom.tar.gz".to_string()]);

        // Applied record untouched
        let state = State::open(harness.state_config()).await;
        assert_eq!(state.applied_version(), Some("v0.9.0"));
        assert_eq!(state.applied_proposal(), Some(1));
    }

    #[tokio::test]
    async fn test_restart_failure() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", None).await;
        harness.shell.fail("restart.sh", 1);
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        let err = harness.mailbox.cycle().await.unwrap_err();
        assert!(matches!(err, Error::Restart(_)));
        assert!(!harness.mailbox.is_installing());
        assert_eq!(harness.chain.dials(), 0);

        let state = State::open(harness.state_config()).await;
        assert!(state.applied_version().is_none());
    }

    #[tokio::test]
    async fn test_release_already_running() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v2.0.0", None).await;
        harness
            .tracker
            .observe(upgrade(3, vec![mirror.url.clone()], RELEASE));

        // Nothing was applied yet, so the release is fetched before it shows as running
        let outcome = harness.mailbox.cycle().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Current {
                version: "v2.0.0".to_string()
            }
        );
        assert_eq!(harness.shell.count("tar"), 1);
        assert_eq!(harness.shell.restarts(), 0);

        let state = State::open(harness.state_config()).await;
        assert_eq!(state.applied_version(), Some("v2.0.0"));
        assert_eq!(state.applied_proposal(), Some(3));
    }

    #[tokio::test]
    async fn test_reconnect_retried_next_cycle() {
        let mirror = Mirror::start("axiom.tar.gz", RELEASE, 0).await;
        let mut harness = setup("v1.0.0", None).await;
        harness.chain.fail_dials(5);
        harness
            .tracker
            .observe(upgrade(2, vec![mirror.url.clone()], RELEASE));

        // Installed, but the endpoint never came back
        let err = harness.mailbox.cycle().await.unwrap_err();
        assert!(matches!(err, Error::Reconnect(_)));
        assert!(harness.replacements.next().await.unwrap().is_err());
        assert!(!harness.mailbox.is_installing());
        assert_eq!(harness.shell.restarts(), 1);
        assert_eq!(harness.chain.dials(), 5);

        // The next cycle reconnects before anything else
        assert_eq!(harness.mailbox.cycle().await.unwrap(), Outcome::Idle);
        assert!(harness.replacements.next().await.unwrap().is_ok());
        assert_eq!(harness.chain.dials(), 6);
    }
}
