//! An in-memory chain.

use crate::{
    chain::{self, Filter, Log, Subscription, NODE_MANAGER_ADDRESS, VOTE_EVENT_TOPIC},
    proposal::{Kind, Proposal, Status, Strategy},
};
use alloy::primitives::{Address, B256};
use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Number of logs a mock subscription buffers.
const BACKLOG: usize = 128;

/// Digest of the release served by the default mock mirrors.
pub const MOCK_CHECK_HASH: &str =
    "596d31575d39232ac8b80522e74d7e2c85ce177a0936a38f9616b8ceef3e97d1";

/// Mirrors referenced by the default mock proposal.
pub const MOCK_DOWNLOAD_URLS: [&str; 2] = [
    "http://localhost:9111/axiom-dev.tar.gz",
    "http://localhost:9112/axiom-dev.tar.gz",
];

/// The approved node upgrade announced by [Chain::with_upgrade].
pub fn upgrade_proposal() -> Proposal {
    Proposal {
        id: 1,
        kind: Kind::NodeUpgrade,
        strategy: Strategy::Simple,
        proposer: "0xff00000000000000000000000000000000001001".to_string(),
        title: "mock title".to_string(),
        description: "mock desc".to_string(),
        block_number: 1,
        total_votes: 4,
        pass_votes: vec![
            "0x110000000000000000000000000000000000ffff".to_string(),
            "0x220000000000000000000000000000000000ffff".to_string(),
            "0x330000000000000000000000000000000000ffff".to_string(),
        ],
        reject_votes: Vec::new(),
        status: Status::Approved,
        download_urls: MOCK_DOWNLOAD_URLS.iter().map(|u| u.to_string()).collect(),
        check_hash: MOCK_CHECK_HASH.to_string(),
    }
}

/// Build the vote event the node-manager contract emits for `proposal`.
pub fn vote_log(proposal: &Proposal, log_index: u64) -> Log {
    let proposer: Address = proposal.proposer.parse().unwrap_or_default();
    Log {
        address: NODE_MANAGER_ADDRESS,
        topics: vec![
            VOTE_EVENT_TOPIC,
            proposer.into_word(),
            B256::with_last_byte(u8::from(proposal.kind)),
        ],
        data: Bytes::from(proposal.encode()),
        block_number: proposal.block_number,
        transaction_hash: B256::left_padding_from(&proposal.id.to_be_bytes()),
        log_index,
    }
}

struct Subscriber {
    filter: Filter,
    logs: mpsc::Sender<Log>,
    error: Option<oneshot::Sender<chain::Error>>,
}

#[derive(Default)]
struct State {
    history: Vec<Log>,
    subscribers: Vec<Subscriber>,
    queries: Vec<Filter>,
    dials: usize,
    failing_dials: usize,
    subscriptions: usize,
}

/// A chain whose logs are recorded by the test.
///
/// [chain::Client::query_logs] returns every recorded log matching the filter and live
/// subscribers receive every log recorded after they subscribed.
#[derive(Clone, Default)]
pub struct Chain {
    state: Arc<Mutex<State>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain that has already recorded the vote event of [upgrade_proposal].
    pub fn with_upgrade() -> Self {
        let chain = Self::new();
        chain.propose(&upgrade_proposal());
        chain
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Record the vote event of `proposal`.
    pub fn propose(&self, proposal: &Proposal) -> Log {
        let index = self.lock().history.len() as u64;
        let log = vote_log(proposal, index);
        self.record(log.clone());
        log
    }

    /// Record `log` and deliver it to matching subscribers.
    pub fn record(&self, log: Log) {
        let mut state = self.lock();
        state.history.push(log.clone());
        state.subscribers.retain_mut(|subscriber| {
            if !subscriber.filter.matches(&log) {
                return !subscriber.logs.is_closed();
            }
            match subscriber.logs.try_send(log.clone()) {
                Ok(()) => true,
                Err(err) => !err.is_disconnected(),
            }
        });
    }

    /// Fail every live subscription.
    pub fn fail_subscriptions(&self) {
        let subscribers = std::mem::take(&mut self.lock().subscribers);
        for mut subscriber in subscribers {
            if let Some(error) = subscriber.error.take() {
                let _ = error.send(chain::Error::Unavailable("connection reset".to_string()));
            }
        }
    }

    /// Fail the next `n` dials.
    pub fn fail_dials(&self, n: usize) {
        self.lock().failing_dials = n;
    }

    /// Filters passed to [chain::Client::query_logs].
    pub fn queries(&self) -> Vec<Filter> {
        self.lock().queries.clone()
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    /// Number of subscriptions opened.
    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }

    /// Number of subscriptions still open.
    pub fn live(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.logs.is_closed())
            .count()
    }
}

impl chain::Client for Chain {
    async fn query_logs(&self, filter: &Filter) -> Result<Vec<Log>, chain::Error> {
        let mut state = self.lock();
        state.queries.push(filter.clone());
        Ok(state
            .history
            .iter()
            .filter(|log| filter.matches(log))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, filter: &Filter) -> Result<Subscription, chain::Error> {
        let (subscription, logs, error, _) = Subscription::new(BACKLOG);
        let mut state = self.lock();
        state.subscriptions += 1;
        state.subscribers.push(Subscriber {
            filter: Filter {
                from_block: None,
                to_block: None,
                ..filter.clone()
            },
            logs,
            error: Some(error),
        });
        debug!(subscriptions = state.subscriptions, "mock subscription opened");
        Ok(subscription)
    }
}

impl chain::Dialer for Chain {
    type Client = Self;

    async fn dial(&self) -> Result<Self, chain::Error> {
        let mut state = self.lock();
        state.dials += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(chain::Error::Unavailable("connection refused".to_string()));
        }
        Ok(self.clone())
    }
}
