use super::{ingress::Message, Config, Error, Mailbox, Outcome, Replacement};
use crate::{
    chain::{Client, Dialer, Filter},
    fetcher::{self, Fetcher},
    retry,
    shell::{self, Shell},
    state::State,
    tracker::Tracker,
};
use futures::{channel::mpsc, SinkExt, StreamExt};
use rand::RngCore;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Owns the durable state and every side effect of an install.
///
/// Cycles are handled one at a time in the order they were requested.
pub struct Actor<D: Dialer, S: Shell, R: RngCore + Send> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    dialer: D,
    shell: S,
    fetcher: Fetcher<S, R>,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    install_path: PathBuf,
    filter: Filter,
    retry: retry::Policy,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    tracker: Tracker,
    state: State,

    /// Whether the last reconnect failed.
    stale: bool,

    /// Set from restart until the replacement subscription is handed off.
    installing: Arc<AtomicBool>,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    mailbox: mpsc::Receiver<Message>,
}

impl<D: Dialer, S: Shell, R: RngCore + Send + 'static> Actor<D, S, R> {
    /// Create a new actor and the mailbox used to request cycles.
    pub fn new(cfg: Config<D, S, R>) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);
        let installing = Arc::new(AtomicBool::new(false));
        let fetcher = Fetcher::new(
            fetcher::Config {
                staging: cfg.staging,
                binary: cfg.binary,
                retry: cfg.retry,
            },
            cfg.shell.clone(),
            cfg.rng,
        );
        let actor = Self {
            dialer: cfg.dialer,
            shell: cfg.shell,
            fetcher,
            install_path: cfg.install_path,
            filter: cfg.filter,
            retry: cfg.retry,
            tracker: cfg.tracker,
            state: cfg.state,
            stale: false,
            installing: installing.clone(),
            mailbox: receiver,
        };
        (actor, Mailbox::new(sender, installing))
    }

    /// Start handling cycles.
    ///
    /// Subscriptions established after an install (or a failure to establish one) are sent
    /// to `replacements`. The actor exits once every [Mailbox] has been dropped.
    pub fn start(self, replacements: mpsc::Sender<Replacement>) -> JoinHandle<()> {
        tokio::spawn(self.run(replacements))
    }

    async fn run(mut self, mut replacements: mpsc::Sender<Replacement>) {
        while let Some(message) = self.mailbox.next().await {
            match message {
                Message::Cycle { responder } => {
                    let result = self.cycle(&mut replacements).await;
                    match &result {
                        Ok(outcome) => debug!(?outcome, "cycle complete"),
                        Err(err) => error!(%err, "cycle failed"),
                    }
                    let _ = responder.send(result);
                }
            }
        }
        debug!("mailbox closed");
    }

    async fn cycle(
        &mut self,
        replacements: &mut mpsc::Sender<Replacement>,
    ) -> Result<Outcome, Error> {
        // Retry a reconnect that failed in an earlier cycle
        if self.stale {
            self.reconnect(replacements).await?;
        }

        // Check what is running against what was last applied
        let running = shell::probe_version(&self.shell, &self.install_path)
            .await
            .map_err(Error::Probe)?;
        if self.tracker.peek().is_none() {
            debug!(running, "nothing pending");
            return Ok(Outcome::Idle);
        }
        if self.state.applied_version() == Some(running.as_str()) {
            info!(version = running, "upgrade already applied");
            return Ok(Outcome::Current { version: running });
        }

        // The slot is cleared as soon as the download starts
        let Some(proposal) = self.tracker.take() else {
            return Ok(Outcome::Idle);
        };
        info!(
            proposal = proposal.id,
            title = proposal.title,
            block = proposal.block_number,
            mirrors = proposal.download_urls.len(),
            "fetching upgrade"
        );
        let fetched = self
            .fetcher
            .fetch(&proposal.download_urls, &proposal.check_hash)
            .await?;
        if fetched.version == running {
            info!(proposal = proposal.id, version = running, "release already running");
            self.state
                .record_install(&running, proposal.id, proposal.block_number)
                .await;
            return Ok(Outcome::Current { version: running });
        }

        // Swap the binary
        self.installing.store(true, Ordering::Release);
        if let Err(err) = shell::restart(&self.shell, &self.install_path, &fetched.binary).await {
            self.installing.store(false, Ordering::Release);
            return Err(Error::Restart(err));
        }
        self.state
            .record_install(&fetched.version, proposal.id, proposal.block_number)
            .await;
        info!(
            proposal = proposal.id,
            from = running,
            to = fetched.version,
            binary = ?fetched.binary,
            "installed upgrade"
        );

        // The restarted node dropped our connection
        let result = self.reconnect(replacements).await;
        self.installing.store(false, Ordering::Release);
        result?;
        Ok(Outcome::Installed {
            proposal: proposal.id,
            version: fetched.version,
        })
    }

    /// Dial the endpoint and resubscribe, handing the result to the loop.
    async fn reconnect(
        &mut self,
        replacements: &mut mpsc::Sender<Replacement>,
    ) -> Result<(), Error> {
        let dialer = &self.dialer;
        let filter = &self.filter;
        let result = self
            .retry
            .run("reconnect", |_| async move {
                let client = dialer.dial().await?;
                client.subscribe(filter).await
            })
            .await;
        let outcome = match result {
            Ok(subscription) => {
                self.stale = false;
                info!("resubscribed");
                replacements.send(Ok(subscription)).await
            }
            Err(err) => {
                self.stale = true;
                let reason = err.to_string();
                if replacements.send(Err(err)).await.is_err() {
                    warn!("loop stopped before reconnect failure was reported");
                }
                return Err(Error::Reconnect(reason));
            }
        };
        if outcome.is_err() {
            warn!("loop stopped before subscription was handed off");
        }
        Ok(())
    }
}
