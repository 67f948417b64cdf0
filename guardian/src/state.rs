//! Durable bookkeeping for the upgrade loop.
//!
//! [State] keeps three values in [Metadata]:
//! - the next block height to resume scanning from (8-byte big-endian),
//! - the version string of the last applied upgrade (raw UTF-8),
//! - the id of the proposal that produced that version (8-byte big-endian).
//!
//! If the store cannot be opened or written, the failure is logged and [State] keeps serving
//! the in-memory values.

use crate::metadata::{self, Metadata};
use tracing::{debug, error, warn};

const CURSOR_KEY: &str = "nextFromBlock";
const VERSION_KEY: &str = "nextUpgradeVersion";
const PROPOSAL_KEY: &str = "appliedProposal";

/// Cursor and applied-version record.
pub struct State {
    store: Option<Metadata>,

    cursor: u64,
    applied_version: Option<String>,
    applied_proposal: Option<u64>,
}

impl State {
    /// Open the store at `cfg`, falling back to an in-memory state on failure.
    pub async fn open(cfg: metadata::Config) -> Self {
        match Metadata::init(cfg.clone()).await {
            Ok(store) => Self::load(store),
            Err(err) => {
                error!(
                    directory = ?cfg.directory,
                    ?err,
                    "unable to open state: continuing in memory"
                );
                Self::in_memory()
            }
        }
    }

    /// A state that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            store: None,
            cursor: 0,
            applied_version: None,
            applied_proposal: None,
        }
    }

    fn load(store: Metadata) -> Self {
        let cursor = store.get(CURSOR_KEY).and_then(|v| decode_u64(CURSOR_KEY, v));
        let applied_proposal = store
            .get(PROPOSAL_KEY)
            .and_then(|v| decode_u64(PROPOSAL_KEY, v));
        let applied_version = store.get(VERSION_KEY).and_then(|v| {
            String::from_utf8(v.clone())
                .map_err(|_| warn!(key = VERSION_KEY, "ignoring non-utf8 value"))
                .ok()
        });
        debug!(?cursor, ?applied_version, ?applied_proposal, "loaded state");
        Self {
            store: Some(store),
            cursor: cursor.unwrap_or_default(),
            applied_version,
            applied_proposal,
        }
    }

    /// Next block height to resume scanning from (zero when never recorded).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Version string of the last applied upgrade.
    pub fn applied_version(&self) -> Option<&str> {
        self.applied_version.as_deref()
    }

    /// Id of the proposal behind [State::applied_version].
    pub fn applied_proposal(&self) -> Option<u64> {
        self.applied_proposal
    }

    /// Whether values are being written to disk.
    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// Move the cursor forward to `height` and persist it.
    ///
    /// The cursor never moves backwards: returns `false` (and writes nothing) when `height`
    /// is not greater than the current cursor.
    pub async fn advance_cursor(&mut self, height: u64) -> bool {
        if height <= self.cursor {
            return false;
        }
        self.cursor = height;
        if let Some(store) = self.store.as_mut() {
            store.put(CURSOR_KEY, height.to_be_bytes().to_vec());
        }
        self.sync().await;
        true
    }

    /// Record a confirmed install of `version` from `proposal` recorded at `height`.
    ///
    /// All values are committed in a single sync.
    pub async fn record_install(&mut self, version: &str, proposal: u64, height: u64) {
        self.applied_version = Some(version.to_string());
        self.applied_proposal = Some(proposal);
        let cursor = self.cursor.max(height);
        self.cursor = cursor;
        if let Some(store) = self.store.as_mut() {
            store.put(VERSION_KEY, version.as_bytes().to_vec());
            store.put(PROPOSAL_KEY, proposal.to_be_bytes().to_vec());
            store.put(CURSOR_KEY, cursor.to_be_bytes().to_vec());
        }
        self.sync().await;
    }

    async fn sync(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if let Err(err) = store.sync().await {
            error!(?err, "unable to persist state: keeping in-memory values");
        }
    }
}

fn decode_u64(key: &str, value: &[u8]) -> Option<u64> {
    match <[u8; 8]>::try_from(value) {
        Ok(bytes) => Some(u64::from_be_bytes(bytes)),
        Err(_) => {
            warn!(key, len = value.len(), "ignoring malformed value");
            None
        }
    }
}
