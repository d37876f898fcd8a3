use std::fmt;

use bytes::Bytes;
use committable::{Commitment, Committable, RawCommitmentBuilder};
use multisig::{Certificate, Committee, KeyId};
use serde::{Deserialize, Serialize};

use crate::{Height, Timestamp};

pub type TxHash = Commitment<Transaction>;
pub type BlockHash = Commitment<Header>;

/// An opaque transaction.
///
/// Execution semantics belong to the ledger; consensus only cares about the
/// hash, the encoded size and the declared fees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    nonce: u64,
    system_fee: u64,
    network_fee: u64,
    data: Bytes,
}

impl Transaction {
    pub fn new<B: Into<Bytes>>(nonce: u64, system_fee: u64, network_fee: u64, data: B) -> Self {
        Self {
            nonce,
            system_fee,
            network_fee,
            data: data.into(),
        }
    }

    pub fn hash(&self) -> TxHash {
        self.commit()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn system_fee(&self) -> u64 {
        self.system_fee
    }

    pub fn network_fee(&self) -> u64 {
        self.network_fee
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Size of the transaction in its wire encoding.
    pub fn size(&self) -> usize {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("serializing a `Transaction` never fails")
            .len()
    }
}

impl Committable for Transaction {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Transaction")
            .u64_field("nonce", self.nonce)
            .u64_field("system_fee", self.system_fee)
            .u64_field("network_fee", self.network_fee)
            .var_size_field("data", &self.data)
            .finalize()
    }
}

/// A block header.
///
/// The commitment of a header is the data every commit signature is made over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    version: u32,
    prev_hash: BlockHash,
    height: Height,
    timestamp: Timestamp,
    nonce: u64,
    primary: KeyId,
    transactions: Vec<TxHash>,
}

impl Header {
    pub fn new(
        version: u32,
        prev_hash: BlockHash,
        height: Height,
        timestamp: Timestamp,
        nonce: u64,
        primary: KeyId,
        transactions: Vec<TxHash>,
    ) -> Self {
        Self {
            version,
            prev_hash,
            height,
            timestamp,
            nonce,
            primary,
            transactions,
        }
    }

    pub fn genesis(timestamp: Timestamp) -> Self {
        Self {
            version: 0,
            prev_hash: RawCommitmentBuilder::new("Genesis").finalize(),
            height: Height::genesis(),
            timestamp,
            nonce: 0,
            primary: KeyId::default(),
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.commit()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.prev_hash
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn primary(&self) -> KeyId {
        self.primary
    }

    pub fn transactions(&self) -> &[TxHash] {
        &self.transactions
    }
}

impl Committable for Header {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Header")
            .u64_field("version", self.version.into())
            .field("prev_hash", self.prev_hash)
            .field("height", self.height.commit())
            .u64_field("timestamp", *self.timestamp)
            .u64_field("nonce", self.nonce)
            .u64_field("primary", self.primary.into())
            .array_field("transactions", &self.transactions)
            .finalize()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header({},{},{})",
            self.height,
            self.primary,
            self.transactions.len()
        )
    }
}

/// A finalized block: header, transaction bodies and a quorum of commit signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    witness: Certificate<Header>,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(witness: Certificate<Header>, transactions: Vec<Transaction>) -> Self {
        Self {
            witness,
            transactions,
        }
    }

    pub fn genesis(timestamp: Timestamp) -> Self {
        Self {
            witness: Certificate::new(Header::genesis(timestamp), []),
            transactions: Vec::new(),
        }
    }

    pub fn header(&self) -> &Header {
        self.witness.data()
    }

    pub fn height(&self) -> Height {
        self.header().height()
    }

    pub fn hash(&self) -> BlockHash {
        *self.witness.commitment()
    }

    pub fn witness(&self) -> &Certificate<Header> {
        &self.witness
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Check the witness and that the bodies match the header's hash list.
    pub fn is_valid(&self, c: &Committee) -> bool {
        let hashes = self.header().transactions();
        self.witness.is_valid(c)
            && hashes.len() == self.transactions.len()
            && hashes
                .iter()
                .zip(&self.transactions)
                .all(|(h, t)| *h == t.hash())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({},{})", self.height(), self.hash())
    }
}
