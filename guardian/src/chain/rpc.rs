//! Ethereum JSON-RPC over WebSocket.
//!
//! Dialing connects an `alloy` provider and checks the endpoint with `eth_chainId`. Historical
//! queries use `eth_getLogs`. Live subscriptions use `eth_subscribe("logs")` and are released
//! with `eth_unsubscribe` once the [Subscription] is closed.

use super::{Error, Filter, Log, Subscription};
use alloy::{
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{self, BlockNumberOrTag},
    transports::ws::WsConnect,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

/// Number of logs buffered by a subscription before forwarding pauses.
const SUBSCRIPTION_BACKLOG: usize = 1_024;

/// Encode `filter` for `eth_getLogs` (with its block range) or `eth_subscribe` (without).
fn encode(filter: &Filter, range: bool) -> types::Filter {
    let mut encoded = types::Filter::new().address(filter.addresses.clone());
    for (slot, position) in encoded.topics.iter_mut().zip(&filter.topics) {
        *slot = position.clone().into();
    }
    if !range {
        return encoded;
    }
    let from = filter.from_block.map_or(BlockNumberOrTag::Earliest, BlockNumberOrTag::Number);
    let to = filter.to_block.map_or(BlockNumberOrTag::Latest, BlockNumberOrTag::Number);
    encoded.from_block(from).to_block(to)
}

/// Convert a log returned by the endpoint, skipping pending and removed (reorged) logs.
fn decode(raw: types::Log) -> Option<Log> {
    if raw.removed {
        return None;
    }
    let block_number = raw.block_number?;
    Some(Log {
        address: raw.inner.address,
        topics: raw.inner.data.topics().to_vec(),
        data: Bytes::copy_from_slice(&raw.inner.data.data),
        block_number,
        transaction_hash: raw.transaction_hash.unwrap_or_default(),
        log_index: raw.log_index.unwrap_or_default(),
    })
}

/// Dials a WebSocket JSON-RPC endpoint.
#[derive(Clone, Debug)]
pub struct Dialer {
    url: String,
}

impl Dialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl super::Dialer for Dialer {
    type Client = Client;

    async fn dial(&self) -> Result<Client, Error> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.url.as_str()))
            .await?
            .erased();
        let chain_id = provider.get_chain_id().await?;
        info!(url = %self.url, chain_id, "connected to endpoint");
        Ok(Client { provider })
    }
}

/// A WebSocket JSON-RPC connection.
#[derive(Clone)]
pub struct Client {
    provider: DynProvider,
}

impl super::Client for Client {
    async fn query_logs(&self, filter: &Filter) -> Result<Vec<Log>, Error> {
        let logs = self.provider.get_logs(&encode(filter, true)).await?;
        Ok(logs.into_iter().filter_map(decode).collect())
    }

    async fn subscribe(&self, filter: &Filter) -> Result<Subscription, Error> {
        let live = self.provider.subscribe_logs(&encode(filter, false)).await?;
        let id = *live.local_id();
        debug!(%id, "subscribed to logs");

        let (subscription, mut logs, error, mut cancelled) =
            Subscription::new(SUBSCRIPTION_BACKLOG);
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let mut stream = live.into_stream();
            let failure = loop {
                tokio::select! {
                    _ = &mut cancelled => break None,
                    raw = stream.next() => {
                        let Some(raw) = raw else {
                            break Some(Error::Closed);
                        };
                        let Some(log) = decode(raw) else {
                            continue;
                        };
                        if logs.send(log).await.is_err() {
                            break None;
                        }
                    },
                }
            };
            match failure {
                Some(err) => {
                    warn!(%id, %err, "subscription lost");
                    let _ = error.send(err);
                }
                None => {
                    if let Err(err) = provider.unsubscribe(id).await {
                        warn!(%id, %err, "unable to unsubscribe");
                    }
                    debug!(%id, "subscription closed");
                }
            }
        });
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Dialer as _, NODE_MANAGER_ADDRESS, NODE_UPGRADE_TOPIC, VOTE_EVENT_TOPIC};
    use alloy::primitives::{self, LogData, B256};
    use tokio::net::TcpListener;
    use types::FilterBlockOption;

    fn raw_log(block_number: Option<u64>, removed: bool) -> types::Log {
        types::Log {
            inner: primitives::Log {
                address: NODE_MANAGER_ADDRESS,
                data: LogData::new_unchecked(
                    vec![VOTE_EVENT_TOPIC],
                    primitives::Bytes::from_static(b"{}"),
                ),
            },
            block_number,
            transaction_hash: Some(B256::with_last_byte(7)),
            log_index: Some(3),
            removed,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_filter() {
        let mut filter = Filter::node_upgrades();
        filter.from_block = Some(500);

        let encoded = encode(&filter, true);
        assert_eq!(
            encoded.block_option,
            FilterBlockOption::Range {
                from_block: Some(BlockNumberOrTag::Number(500)),
                to_block: Some(BlockNumberOrTag::Latest),
            }
        );
        assert!(encoded.address.matches(&NODE_MANAGER_ADDRESS));
        assert!(!encoded.address.matches(&primitives::Address::ZERO));
        assert!(encoded.topics[0].matches(&VOTE_EVENT_TOPIC));
        assert!(encoded.topics[1].is_empty());
        assert!(encoded.topics[2].matches(&NODE_UPGRADE_TOPIC));
        assert!(!encoded.topics[2].matches(&B256::with_last_byte(2)));

        // No range: genesis to latest
        filter.from_block = None;
        assert_eq!(
            encode(&filter, true).block_option,
            FilterBlockOption::Range {
                from_block: Some(BlockNumberOrTag::Earliest),
                to_block: Some(BlockNumberOrTag::Latest),
            }
        );

        // Live subscriptions carry no range
        assert_eq!(
            encode(&filter, false).block_option,
            FilterBlockOption::Range {
                from_block: None,
                to_block: None,
            }
        );
    }

    #[test]
    fn test_decode_log() {
        let log = decode(raw_log(Some(5), false)).unwrap();
        assert_eq!(log.address, NODE_MANAGER_ADDRESS);
        assert_eq!(log.topics, vec![VOTE_EVENT_TOPIC]);
        assert_eq!(log.data, Bytes::from_static(b"{}"));
        assert_eq!(log.block_number, 5);
        assert_eq!(log.transaction_hash, B256::with_last_byte(7));
        assert_eq!(log.log_index, 3);

        // Pending and reorged logs are skipped
        assert!(decode(raw_log(None, false)).is_none());
        assert!(decode(raw_log(Some(5), true)).is_none());
    }

    #[tokio::test]
    async fn test_unreachable() {
        // Bind and immediately drop to find a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = Dialer::new(format!("ws://{addr}")).dial().await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
