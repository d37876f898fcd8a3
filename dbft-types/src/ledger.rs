use std::io;

use crate::{Block, Header, Height, RoundSnapshot, Transaction, TxHash};

/// Read access to the chain and the single write the engine asks for.
pub trait Ledger: Send + Sync {
    /// Height of the last persisted block.
    fn current_height(&self) -> Height;

    /// Header of the last persisted block.
    fn current_header(&self) -> Header;

    fn contains_transaction(&self, h: &TxHash) -> bool;

    fn get_transaction(&self, h: &TxHash) -> Option<Transaction>;

    /// Append a block to the chain.
    fn persist_block(&self, b: Block) -> Result<(), LedgerError>;
}

/// Outcome of re-verifying a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Succeed,
    /// The transaction is well-formed but violates local policy.
    PolicyFail,
    Invalid,
}

impl VerifyResult {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Succeed)
    }
}

/// Pending transactions.
pub trait Mempool: Send + Sync {
    /// All verified transactions, highest priority first.
    fn verified_transactions(&self) -> Vec<Transaction>;

    /// Lookup among verified transactions only.
    fn get_verified(&self, h: &TxHash) -> Option<Transaction>;

    /// Lookup among all transactions, verified or not.
    fn get(&self, h: &TxHash) -> Option<Transaction>;

    fn reverify(&self, tx: &Transaction) -> VerifyResult;

    /// Drop transactions that made it into a block.
    fn update_pool(&self, _: &Block) {}
}

/// Durable storage for the round snapshot.
pub trait RecoveryStore: Send {
    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError>;

    fn save(&mut self, s: &RoundSnapshot) -> Result<(), StoreError>;
}

impl<T: RecoveryStore + ?Sized> RecoveryStore for Box<T> {
    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError> {
        (**self).load()
    }

    fn save(&mut self, s: &RoundSnapshot) -> Result<(), StoreError> {
        (**self).save(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("bincode encode error: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    #[error("bincode decode error: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("block {found} does not follow {expected}")]
    NotNext { expected: Height, found: Height },

    #[error("block does not extend the chain tip")]
    PrevHashMismatch,

    #[error("invalid block witness")]
    InvalidWitness,
}
