use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use dbft_types::{Comm, CommError, Inbound, Message, Transaction, TxHash};
use multisig::{PublicKey, Unchecked, Validated};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

type Peers = Arc<HashMap<PublicKey, mpsc::UnboundedSender<(PublicKey, Vec<u8>)>>>;

/// What travels between the parties of a `LocalNet`.
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "Message<S>: Serialize",
    deserialize = "Message<S>: Deserialize<'de>"
))]
enum Frame<S> {
    Message(Message<S>),
    GetTransactions(Vec<TxHash>),
    Inventory(Vec<TxHash>),
    Transactions(Vec<Transaction>),
}

/// An in-process network between a fixed set of parties.
///
/// Frames travel in their wire encoding, tagged with the sender's key.
/// A broadcast reaches every party but the sender.
#[derive(Debug)]
pub struct LocalNet {
    peers: Peers,
    inbound: HashMap<PublicKey, mpsc::UnboundedReceiver<(PublicKey, Vec<u8>)>>,
}

impl LocalNet {
    pub fn new<I>(parties: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let mut peers = HashMap::new();
        let mut inbound = HashMap::new();
        for k in parties {
            let (tx, rx) = mpsc::unbounded_channel();
            peers.insert(k, tx);
            inbound.insert(k, rx);
        }
        Self {
            peers: Arc::new(peers),
            inbound,
        }
    }

    /// Take the endpoint of the given party.
    ///
    /// Returns `None` if the party is unknown or its endpoint was taken before.
    pub fn join(&mut self, k: PublicKey) -> Option<LocalComm> {
        let rx = self.inbound.remove(&k)?;
        Some(LocalComm {
            me: k,
            peers: self.peers.clone(),
            rx,
        })
    }
}

/// One party's endpoint of a `LocalNet`.
#[derive(Debug)]
pub struct LocalComm {
    me: PublicKey,
    peers: Peers,
    rx: mpsc::UnboundedReceiver<(PublicKey, Vec<u8>)>,
}

impl LocalComm {
    pub fn public_key(&self) -> PublicKey {
        self.me
    }

    fn to_all(&self, f: &Frame<Validated>) -> Result<(), CommError<Infallible>> {
        let bytes = bincode::serde::encode_to_vec(f, bincode::config::standard())?;
        for (k, tx) in self.peers.iter().filter(|(k, _)| **k != self.me) {
            if tx.send((self.me, bytes.clone())).is_err() {
                debug!(node = %self.me, peer = %k, "peer is gone")
            }
        }
        Ok(())
    }

    fn to_one(&self, to: PublicKey, f: &Frame<Validated>) -> Result<(), CommError<Infallible>> {
        let bytes = bincode::serde::encode_to_vec(f, bincode::config::standard())?;
        let tx = self.peers.get(&to).ok_or(CommError::Closed)?;
        tx.send((self.me, bytes)).map_err(|_| CommError::Closed)
    }
}

#[async_trait]
impl Comm for LocalComm {
    type Err = CommError<Infallible>;

    async fn broadcast(&mut self, msg: Message<Validated>) -> Result<(), Self::Err> {
        self.to_all(&Frame::Message(msg))
    }

    async fn send(&mut self, to: PublicKey, msg: Message<Validated>) -> Result<(), Self::Err> {
        self.to_one(to, &Frame::Message(msg))
    }

    async fn receive(&mut self) -> Result<Inbound, Self::Err> {
        let (from, bytes) = self.rx.recv().await.ok_or(CommError::Closed)?;
        let (frame, _): (Frame<Unchecked>, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(match frame {
            Frame::Message(m) => Inbound::Message(m),
            Frame::GetTransactions(h) => Inbound::TransactionRequest(from, h),
            Frame::Inventory(h) => Inbound::TransactionAnnouncement(from, h),
            Frame::Transactions(t) => Inbound::Transactions(t),
        })
    }

    async fn request_transactions(&mut self, h: Vec<TxHash>) -> Result<(), Self::Err> {
        self.to_all(&Frame::GetTransactions(h))
    }

    async fn announce_transactions(&mut self, h: Vec<TxHash>) -> Result<(), Self::Err> {
        self.to_all(&Frame::Inventory(h))
    }

    async fn send_transactions(&mut self, to: PublicKey, t: Vec<Transaction>) -> Result<(), Self::Err> {
        self.to_one(to, &Frame::Transactions(t))
    }
}
