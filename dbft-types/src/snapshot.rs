use multisig::{Envelope, Unchecked};
use serde::{Deserialize, Serialize};

use crate::ledger::StoreError;
use crate::message::{ChangeView, Commit, PrepareVote, Proposal};
use crate::{Height, Payload, Transaction, ViewNumber};

/// Round state written before a commit leaves the node.
///
/// Restoring it after a crash re-creates the commit that was promised
/// instead of signing a different one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub height: Height,
    pub view: ViewNumber,
    pub proposal: Option<Envelope<Payload<Proposal>, Unchecked>>,
    pub preparations: Vec<Envelope<Payload<PrepareVote>, Unchecked>>,
    pub commits: Vec<Envelope<Payload<Commit>, Unchecked>>,
    pub change_views: Vec<Envelope<Payload<ChangeView>, Unchecked>>,
    pub last_change_views: Vec<Envelope<Payload<ChangeView>, Unchecked>>,
    pub transactions: Vec<Transaction>,
}

impl RoundSnapshot {
    pub fn new(height: Height, view: ViewNumber) -> Self {
        Self {
            height,
            view,
            proposal: None,
            preparations: Vec::new(),
            commits: Vec::new(),
            change_views: Vec::new(),
            last_change_views: Vec::new(),
            transactions: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (s, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(s)
    }
}
