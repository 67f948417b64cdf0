//! Reconcile the chain's governance events with the running service.
//!
//! # Startup
//!
//! 1. Open the durable state and dial the endpoint.
//! 2. Backfill: query every vote event from `max(cursor, configured start)` to the configured
//!    end and observe each decoded proposal.
//! 3. Subscribe to new vote events.
//! 4. Start the installer and request one startup cycle.
//!
//! # Loop
//!
//! For every live event a task is spawned that decodes the proposal, observes it and then
//! requests a full cycle (regardless of whether the proposal was actionable). Subscriptions
//! established by the installer after an install replace the current one.
//!
//! A subscription failure while an install is in progress is expected (the node is
//! restarting) and the loop waits for the replacement. If the installer then fails to
//! reconnect, the loop requests another cycle after the retry backoff (a cycle reconnects
//! before anything else once a reconnect has failed) and keeps doing so until a subscription
//! is handed off. A subscription failure outside of an install ends the loop with an error.
//! The loop also ends once the shutdown [Signal] resolves, closing the subscription (in-flight
//! cycles run to completion).

use crate::{
    chain::{self, Client, Dialer, Filter, Log, Subscription},
    installer::{self, Actor, Mailbox, Replacement},
    metadata,
    proposal::Proposal,
    retry,
    shell::Shell,
    signal::Signal,
    state::State,
    tracker::Tracker,
};
use futures::{channel::mpsc, future, StreamExt};
use rand::RngCore;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

/// Errors that can stop the [Engine].
#[derive(Debug, Error)]
pub enum Error {
    #[error("dial failed: {0}")]
    Dial(chain::Error),
    #[error("backfill failed: {0}")]
    Backfill(chain::Error),
    #[error("subscribe failed: {0}")]
    Subscribe(chain::Error),
    #[error("subscription failed: {0}")]
    Subscription(chain::Error),
    #[error("installer stopped")]
    InstallerStopped,
}

/// Configuration for the [Engine].
pub struct Config<D, S, R> {
    /// Establishes connections to the endpoint.
    pub dialer: D,

    /// Runs `tar`, `version.sh` and `restart.sh`.
    pub shell: S,

    /// Source of randomness for mirror selection.
    pub rng: R,

    /// Resolves when the engine should stop.
    pub shutdown: Signal,

    /// Where the cursor and applied version are stored.
    pub state: metadata::Config,

    /// Directory releases are downloaded and unpacked into.
    pub staging: PathBuf,

    /// Directory of the running service.
    pub install_path: PathBuf,

    /// Name of the service binary inside a release.
    pub binary: String,

    /// Events to follow. The block range bounds the backfill.
    pub filter: Filter,

    /// Retry policy for downloads and reconnects.
    pub retry: retry::Policy,

    /// The maximum size of the installer mailbox backlog.
    pub mailbox_size: usize,
}

/// The reconciliation loop.
pub struct Engine<D: Dialer, S: Shell, R: RngCore + Send> {
    cfg: Config<D, S, R>,
}

impl<D: Dialer, S: Shell, R: RngCore + Send + 'static> Engine<D, S, R> {
    pub fn new(cfg: Config<D, S, R>) -> Self {
        Self { cfg }
    }

    /// Backfill, subscribe and start consuming events.
    ///
    /// Returns once the subscription is established. The returned handle resolves when the
    /// loop ends.
    pub async fn start(self) -> Result<JoinHandle<Result<(), Error>>, Error> {
        let Config {
            dialer,
            shell,
            rng,
            shutdown,
            state,
            staging,
            install_path,
            binary,
            filter,
            retry,
            mailbox_size,
        } = self.cfg;
        let state = State::open(state).await;
        let tracker = Tracker::new();

        // Connect
        let client = dialer.dial().await.map_err(Error::Dial)?;

        // Resume scanning where the last install left off
        let configured = filter.from_block.unwrap_or_default();
        let from = configured.max(state.cursor());
        let backfill = Filter {
            from_block: (from > 0).then_some(from),
            ..filter.clone()
        };
        let logs = client
            .query_logs(&backfill)
            .await
            .map_err(Error::Backfill)?;
        for log in &logs {
            observe(&tracker, log);
        }
        info!(
            from,
            cursor = state.cursor(),
            logs = logs.len(),
            pending = ?tracker.peek().map(|p| p.id),
            "backfilled"
        );

        // Follow new events
        let subscription = client
            .subscribe(&filter)
            .await
            .map_err(Error::Subscribe)?;

        // Start the installer
        let (actor, mailbox) = Actor::new(installer::Config {
            dialer,
            shell,
            rng,
            tracker: tracker.clone(),
            state,
            install_path,
            staging,
            binary,
            filter,
            retry,
            mailbox_size,
        });
        let (sender, replacements) = mpsc::channel(mailbox_size);
        actor.start(sender);
        request_cycle(mailbox.clone(), None);

        Ok(tokio::spawn(run(
            Loop {
                subscription: Some(subscription),
                mailbox,
                tracker,
                replacements,
                backoff: retry.backoff,
            },
            shutdown,
        )))
    }
}

enum Event {
    Replacement(Option<Replacement>),
    Log(Option<Result<Log, chain::Error>>),
}

/// State owned by the reconciliation loop.
struct Loop {
    subscription: Option<Subscription>,
    mailbox: Mailbox,
    tracker: Tracker,
    replacements: mpsc::Receiver<Replacement>,

    /// Delay before a cycle is requested to retry a failed reconnect.
    backoff: Duration,
}

async fn run(mut state: Loop, mut shutdown: Signal) -> Result<(), Error> {
    let result = loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("shutdown");
                break Ok(());
            },
            replacement = state.replacements.next() => Event::Replacement(replacement),
            log = next_log(&mut state.subscription) => Event::Log(log),
        };
        let handled = match event {
            Event::Replacement(replacement) => state.replace(replacement),
            Event::Log(Some(Ok(log))) => {
                debug!(block = log.block_number, index = log.log_index, "received event");
                request_cycle(state.mailbox.clone(), Some((state.tracker.clone(), log)));
                Ok(())
            }
            Event::Log(result) => {
                let err = match result {
                    Some(Err(err)) => err,
                    _ => chain::Error::Closed,
                };
                state.lost(err)
            }
        };
        if let Err(err) = handled {
            break Err(err);
        }
    };

    if let Some(mut subscription) = state.subscription.take() {
        subscription.close();
    }
    match &result {
        Ok(()) => info!("stopped"),
        Err(err) => error!(%err, "loop failed"),
    }
    result
}

/// Wait for the next log, or forever if there is no subscription.
async fn next_log(subscription: &mut Option<Subscription>) -> Option<Result<Log, chain::Error>> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => future::pending().await,
    }
}

impl Loop {
    /// Install a replacement subscription from the installer.
    fn replace(&mut self, replacement: Option<Replacement>) -> Result<(), Error> {
        match replacement {
            None => Err(Error::InstallerStopped),
            Some(Ok(replacement)) => {
                if let Some(mut previous) = self.subscription.replace(replacement) {
                    previous.close();
                }
                info!("subscription replaced");
                Ok(())
            }
            Some(Err(err)) if self.subscription.is_none() => {
                warn!(%err, delay = ?self.backoff, "reconnect failed: retrying");
                let mailbox = self.mailbox.clone();
                let delay = self.backoff;
                tokio::spawn(async move {
                    sleep(delay).await;
                    request_cycle(mailbox, None);
                });
                Ok(())
            }
            Some(Err(err)) => {
                warn!(%err, "reconnect failed: keeping current subscription");
                Ok(())
            }
        }
    }

    /// Handle the loss of the live subscription.
    fn lost(&mut self, err: chain::Error) -> Result<(), Error> {
        if let Some(mut previous) = self.subscription.take() {
            previous.close();
        }
        match self.replacements.try_next() {
            Ok(replacement) => self.replace(replacement),
            Err(_) if self.mailbox.is_installing() => {
                warn!(%err, "subscription lost during install: waiting for replacement");
                Ok(())
            }
            Err(_) => Err(Error::Subscription(err)),
        }
    }
}

/// Decode `log` and track the proposal it carries.
fn observe(tracker: &Tracker, log: &Log) {
    match Proposal::decode(&log.data) {
        Ok(proposal) => {
            let id = proposal.id;
            let kind = proposal.kind;
            let status = proposal.status;
            if tracker.observe(proposal) {
                info!(id, block = log.block_number, "tracking approved upgrade");
            } else {
                debug!(id, ?kind, ?status, "ignoring proposal");
            }
        }
        Err(err) => warn!(%err, block = log.block_number, "discarding malformed event"),
    }
}

/// Spawn a task that observes `event` (if any) and then requests a cycle.
fn request_cycle(mut mailbox: Mailbox, event: Option<(Tracker, Log)>) {
    tokio::spawn(async move {
        if let Some((tracker, log)) = &event {
            observe(tracker, log);
        }
        match mailbox.cycle().await {
            Ok(outcome) => debug!(?outcome, "cycle finished"),
            Err(err) => debug!(%err, "cycle failed"),
        }
    });
}
