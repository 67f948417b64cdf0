//! Mock implementations of the chain and the host.
//!
//! [Chain] stands in for the endpoint (it is also what `guardian start --mock` runs against)
//! and [Shell] stands in for `tar`, `version.sh` and `restart.sh`.

mod chain;
pub use chain::{upgrade_proposal, vote_log, Chain, MOCK_CHECK_HASH, MOCK_DOWNLOAD_URLS};
#[cfg(test)]
pub mod mirror;
mod shell;
pub use shell::{Invocation, Shell};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{Client, Dialer, Filter},
        proposal::Proposal,
        shell::{probe_version, restart, Shell as _},
    };
    use rand::Rng;
    use std::{env, path::PathBuf};

    fn temp_dir() -> PathBuf {
        let suffix: u64 = rand::thread_rng().gen();
        env::temp_dir().join(format!("guardian_mocks_{suffix}"))
    }

    #[tokio::test]
    async fn test_chain_backfill_and_live() {
        let chain = Chain::with_upgrade();
        let client = chain.dial().await.unwrap();

        let mut filter = Filter::node_upgrades();
        let logs = client.query_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(Proposal::decode(&logs[0].data).unwrap(), upgrade_proposal());

        // Past the recorded block
        filter.from_block = Some(2);
        assert!(client.query_logs(&filter).await.unwrap().is_empty());
        assert_eq!(chain.queries().len(), 2);

        // Live delivery ignores the block range
        let mut subscription = client.subscribe(&filter).await.unwrap();
        let mut proposal = upgrade_proposal();
        proposal.id = 2;
        chain.propose(&proposal);
        let log = subscription.next().await.unwrap().unwrap();
        assert_eq!(Proposal::decode(&log.data).unwrap().id, 2);
        assert_eq!(chain.live(), 1);

        // Failing drops the subscriber
        chain.fail_subscriptions();
        assert!(subscription.next().await.unwrap().is_err());
        assert_eq!(chain.live(), 0);
    }

    #[tokio::test]
    async fn test_chain_failing_dials() {
        let chain = Chain::new();
        chain.fail_dials(2);
        assert!(chain.dial().await.is_err());
        assert!(chain.dial().await.is_err());
        assert!(chain.dial().await.is_ok());
        assert_eq!(chain.dials(), 3);
    }

    #[tokio::test]
    async fn test_shell_release_lifecycle() {
        let shell = Shell::default();
        let install = temp_dir();
        shell.install(&install, "v1.0.0").unwrap();
        assert_eq!(probe_version(&shell, &install).await.unwrap(), "v1.0.0");

        // Unpack a release
        let release = temp_dir();
        std::fs::create_dir_all(&release).unwrap();
        shell.set_artifact_version("v2.0.0");
        let args = [
            "-zxf".to_string(),
            "release.tar.gz".to_string(),
            "-C".to_string(),
            release.display().to_string(),
        ];
        assert!(shell.run("tar", &args, &install).await.unwrap().success());
        assert_eq!(probe_version(&shell, &release).await.unwrap(), "v2.0.0");

        // Restarting swaps the running release
        restart(&shell, &install, &release.join("axiom")).await.unwrap();
        assert_eq!(shell.version(&install).as_deref(), Some("v2.0.0"));
        assert_eq!(shell.restarts(), 1);
        assert_eq!(shell.count("version.sh"), 2);

        // Injected failures
        shell.fail("restart.sh", 1);
        assert!(restart(&shell, &install, &release.join("axiom")).await.is_err());
        assert_eq!(shell.restarts(), 2);

        std::fs::remove_dir_all(install).unwrap();
        std::fs::remove_dir_all(release).unwrap();
    }
}
