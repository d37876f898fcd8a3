mod action;
mod block;
mod comm;
mod height;
mod ledger;
mod message;
mod recovery;
mod snapshot;
mod time;

pub mod mem;

pub use action::Action;
pub use block::{Block, BlockHash, Header, Transaction, TxHash};
pub use comm::{Comm, CommError, Inbound};
pub use height::{Height, RoundTag, ViewNumber};
pub use ledger::{Ledger, LedgerError, Mempool, RecoveryStore, StoreError, VerifyResult};
pub use message::{ChangeView, ChangeViewReason, Commit, Message, Payload, PrepareVote};
pub use message::{Proposal, ProposalHash, RecoveryRequest};
pub use recovery::{ChangeViewCompact, CommitCompact, PreparationCompact, RecoveryMessage};
pub use snapshot::RoundSnapshot;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
