//! Decode governance proposals from event payloads.
//!
//! The governance contract emits the JSON encoding of a proposal as the data of each vote
//! event. Only approved [Kind::NodeUpgrade] proposals are [actionable](Proposal::is_actionable);
//! every other proposal is decoded, logged and discarded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when decoding a [Proposal].
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed proposal: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The kind of change a proposal requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Kind {
    /// Elect the council.
    CouncilElect,
    /// Update or upgrade the node software.
    NodeUpgrade,
    /// Add a new node.
    NodeAdd,
    /// Remove a node.
    NodeRemove,
}

impl TryFrom<u8> for Kind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::CouncilElect),
            1 => Ok(Self::NodeUpgrade),
            2 => Ok(Self::NodeAdd),
            3 => Ok(Self::NodeRemove),
            v => Err(format!("unknown proposal kind: {v}")),
        }
    }
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::CouncilElect => 0,
            Kind::NodeUpgrade => 1,
            Kind::NodeAdd => 2,
            Kind::NodeRemove => 3,
        }
    }
}

/// How votes are resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Strategy {
    /// Approved once pass votes exceed half of the votes cast.
    #[default]
    Simple,
}

impl TryFrom<u8> for Strategy {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Simple),
            v => Err(format!("unknown proposal strategy: {v}")),
        }
    }
}

impl From<Strategy> for u8 {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Simple => 0,
        }
    }
}

/// Voting status. [Status::Approved] and [Status::Rejected] are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    Voting,
    Approved,
    Rejected,
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Voting),
            1 => Ok(Self::Approved),
            2 => Ok(Self::Rejected),
            v => Err(format!("unknown proposal status: {v}")),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Voting => 0,
            Status::Approved => 1,
            Status::Rejected => 2,
        }
    }
}

/// A governance proposal as recorded by the node-manager contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Proposal {
    /// Sequence number assigned by the contract.
    #[serde(rename = "ID")]
    pub id: u64,

    #[serde(rename = "Type")]
    pub kind: Kind,

    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub proposer: String,

    #[serde(default)]
    pub title: String,

    #[serde(rename = "Desc", default)]
    pub description: String,

    /// Height at which the proposal was recorded.
    #[serde(default)]
    pub block_number: u64,

    /// Votes that could be cast (not every voter is required to vote).
    #[serde(default)]
    pub total_votes: u64,

    #[serde(default, deserialize_with = "nullable")]
    pub pass_votes: Vec<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub reject_votes: Vec<String>,

    pub status: Status,

    /// Mirrors serving the same release artifact (only set for [Kind::NodeUpgrade]).
    #[serde(default, deserialize_with = "nullable")]
    pub download_urls: Vec<String>,

    /// Hex-encoded SHA-256 digest of the release artifact.
    #[serde(default)]
    pub check_hash: String,
}

/// Treat an explicit `null` list as empty.
fn nullable<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Proposal {
    /// Decode a proposal from the data of a governance event.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode the proposal the way the contract emits it.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("proposal serialization is infallible")
    }

    /// Whether the guardian should install this proposal.
    pub fn is_actionable(&self) -> bool {
        self.kind == Kind::NodeUpgrade && self.status == Status::Approved
    }
}
