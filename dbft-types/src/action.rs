use std::fmt;
use std::time::Duration;

use multisig::KeyId;

use crate::{Block, Message, RoundTag, TxHash};

/// Instructions the engine hands to its runtime.
///
/// Actions must be executed in the order they are returned.
#[derive(Debug, Clone)]
pub enum Action {
    /// Replace the armed timer with one firing after the given delay.
    ResetTimer(RoundTag, Duration),

    /// Send a message to all committee members.
    Broadcast(Message),

    /// Send a message to one committee member.
    SendTo(KeyId, Message),

    /// Ask peers for transaction bodies we do not have.
    RequestTransactions(Vec<TxHash>),

    /// Tell peers about transactions included in our proposal.
    AnnounceTransactions(Vec<TxHash>),

    /// Hand a finalized block to the ledger.
    PersistBlock(Block),
}

impl Action {
    pub fn is_persist(&self) -> bool {
        matches!(self, Self::PersistBlock(_))
    }

    /// The message carried by this action, if any.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Broadcast(m) | Self::SendTo(_, m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ResetTimer(tag, d) => write!(f, "ResetTimer({tag},{}ms)", d.as_millis()),
            Action::Broadcast(m) => write!(f, "Broadcast({m})"),
            Action::SendTo(to, m) => write!(f, "SendTo({to},{m})"),
            Action::RequestTransactions(h) => write!(f, "RequestTransactions({})", h.len()),
            Action::AnnounceTransactions(h) => write!(f, "AnnounceTransactions({})", h.len()),
            Action::PersistBlock(b) => write!(f, "PersistBlock({b})"),
        }
    }
}
