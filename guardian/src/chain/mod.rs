//! Read governance events from the chain.
//!
//! A [Dialer] establishes a [Client] to the endpoint. The [Client] answers historical log
//! queries (used once at startup to backfill) and opens live [Subscription]s that deliver logs
//! emitted after the point of subscription. Delivering the same log twice is allowed: decoding
//! and observing a proposal is idempotent.
//!
//! [rpc] implements both traits over Ethereum JSON-RPC (WebSocket). `mocks::Chain` is a
//! deterministic substitute for tests and local runs.

use alloy::{
    primitives::{address, b256, Address, B256},
    transports::TransportError,
};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    future::Either,
    StreamExt,
};
use std::future::Future;
use thiserror::Error;

pub mod rpc;

/// Address of the node-manager (governance) contract.
pub const NODE_MANAGER_ADDRESS: Address = address!("0x0000000000000000000000000000000000001001");

/// Signature of the proposal vote event.
pub const VOTE_EVENT_TOPIC: B256 =
    b256!("0xe6bfc3cff2e28bc2ab583f413a459f93526e55a1a46c944572150de96997c84e");

/// Proposal type topic selecting node upgrades.
pub const NODE_UPGRADE_TOPIC: B256 =
    b256!("0x0000000000000000000000000000000000000000000000000000000000000001");

/// Errors that can occur when talking to the chain.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("subscription closed")]
    Closed,
}

/// An event emitted by a contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Selects the logs to query or subscribe to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    /// Contract addresses (any of).
    pub addresses: Vec<Address>,

    /// Topic matrix: position `i` matches any of `topics[i]`, an empty position matches anything.
    pub topics: Vec<Vec<B256>>,

    /// First block to include (genesis when `None`).
    pub from_block: Option<u64>,

    /// Last block to include (latest when `None`).
    pub to_block: Option<u64>,
}

impl Filter {
    /// The vote events of node-upgrade proposals on the node-manager contract.
    pub fn node_upgrades() -> Self {
        Self {
            addresses: vec![NODE_MANAGER_ADDRESS],
            topics: vec![vec![VOTE_EVENT_TOPIC], Vec::new(), vec![NODE_UPGRADE_TOPIC]],
            from_block: None,
            to_block: None,
        }
    }

    /// Whether `log` is selected by the address set, topic matrix and block range.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        for (i, position) in self.topics.iter().enumerate() {
            if position.is_empty() {
                continue;
            }
            let Some(topic) = log.topics.get(i) else {
                return false;
            };
            if !position.contains(topic) {
                return false;
            }
        }
        if self.from_block.is_some_and(|from| log.block_number < from) {
            return false;
        }
        if self.to_block.is_some_and(|to| log.block_number > to) {
            return false;
        }
        true
    }
}

/// A live log stream.
///
/// Logs arrive on one channel and a terminal transport failure on another. Dropping the
/// subscription (or calling [Subscription::close]) releases it at the source.
pub struct Subscription {
    logs: mpsc::Receiver<Log>,
    error: Option<oneshot::Receiver<Error>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    /// Create a new [Subscription] and the handles its producer feeds.
    ///
    /// The producer should stop once the cancel receiver resolves (or is canceled).
    pub fn new(
        backlog: usize,
    ) -> (
        Self,
        mpsc::Sender<Log>,
        oneshot::Sender<Error>,
        oneshot::Receiver<()>,
    ) {
        let (log_sender, logs) = mpsc::channel(backlog);
        let (error_sender, error) = oneshot::channel();
        let (cancel, cancelled) = oneshot::channel();
        (
            Self {
                logs,
                error: Some(error),
                cancel: Some(cancel),
            },
            log_sender,
            error_sender,
            cancelled,
        )
    }

    /// Wait for the next log or the terminal error.
    ///
    /// Returns `None` once the producer has gone away without reporting an error.
    pub async fn next(&mut self) -> Option<Result<Log, Error>> {
        loop {
            let Some(error) = self.error.as_mut() else {
                return self.logs.next().await.map(Ok);
            };
            let polled = tokio::select! {
                biased;
                log = self.logs.next() => Either::Left(log),
                err = error => Either::Right(err),
            };
            match polled {
                Either::Left(Some(log)) => return Some(Ok(log)),
                Either::Left(None) => {
                    // Producer finished: surface an error if it left one
                    let error = self.error.take()?;
                    return error.await.ok().map(Err);
                }
                Either::Right(Ok(err)) => {
                    self.error = None;
                    return Some(Err(err));
                }
                Either::Right(Err(_)) => {
                    self.error = None;
                }
            }
        }
    }

    /// Release the subscription. Safe to call more than once and after a transport failure.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.logs.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection to a chain endpoint.
pub trait Client: Clone + Send + Sync + 'static {
    /// Return all logs matching `filter` at the time of the query.
    fn query_logs(&self, filter: &Filter) -> impl Future<Output = Result<Vec<Log>, Error>> + Send;

    /// Open a live subscription to logs matching `filter`.
    ///
    /// The block range of `filter` is ignored: only logs produced after the subscription is
    /// established are delivered.
    fn subscribe(
        &self,
        filter: &Filter,
    ) -> impl Future<Output = Result<Subscription, Error>> + Send;
}

/// Establishes [Client] connections to a configured endpoint.
pub trait Dialer: Clone + Send + Sync + 'static {
    type Client: Client;

    fn dial(&self) -> impl Future<Output = Result<Self::Client, Error>> + Send;
}
