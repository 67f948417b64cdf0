//! Install node upgrades approved by on-chain governance.
//!
//! The guardian follows the vote events of the node-manager contract, tracks the most recent
//! approved node-upgrade proposal and installs it: the release is downloaded from one of the
//! proposal's mirrors, verified against its SHA-256 digest, unpacked, and swapped in with the
//! node's own `restart.sh`. The block height and version of the last install are kept on disk
//! so that a restarted guardian neither rescans history nor reinstalls a release.
//!
//! # Status
//!
//! `commonware-guardian` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod chain;
pub mod config;
pub mod engine;
pub mod fetcher;
pub mod installer;
pub mod metadata;
pub mod mocks;
pub mod proposal;
pub mod retry;
pub mod shell;
pub mod signal;
pub mod state;
pub mod telemetry;
pub mod tracker;
pub mod utils;

pub use engine::{Config, Engine, Error};
