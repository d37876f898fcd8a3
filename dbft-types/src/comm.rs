use std::error::Error;

use async_trait::async_trait;
use multisig::{PublicKey, Unchecked, Validated};

use crate::{Message, Transaction, TxHash};

/// Something received from a peer.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message(Message<Unchecked>),
    /// A peer asks for the bodies of these transactions.
    TransactionRequest(PublicKey, Vec<TxHash>),
    /// A peer advertises transactions it holds.
    TransactionAnnouncement(PublicKey, Vec<TxHash>),
    /// Transaction bodies sent by a peer.
    Transactions(Vec<Transaction>),
}

/// Types that provide broadcast and 1:1 message communication.
#[async_trait]
pub trait Comm {
    type Err: Error + Send + Sync + 'static;

    /// Send a message to all nodes.
    async fn broadcast(&mut self, msg: Message<Validated>) -> Result<(), Self::Err>;

    /// Send a message to one node.
    async fn send(&mut self, to: PublicKey, msg: Message<Validated>) -> Result<(), Self::Err>;

    /// Await the next inbound item.
    ///
    /// Messages are returned as received and must be validated by the caller.
    async fn receive(&mut self) -> Result<Inbound, Self::Err>;

    /// Ask peers for the bodies of the given transactions.
    async fn request_transactions(&mut self, _: Vec<TxHash>) -> Result<(), Self::Err> {
        Ok(())
    }

    /// Advertise transactions to peers.
    async fn announce_transactions(&mut self, _: Vec<TxHash>) -> Result<(), Self::Err> {
        Ok(())
    }

    /// Answer a transaction request.
    async fn send_transactions(&mut self, _: PublicKey, _: Vec<Transaction>) -> Result<(), Self::Err> {
        Ok(())
    }
}

#[async_trait]
impl<T: Comm + Send> Comm for Box<T> {
    type Err = T::Err;

    async fn broadcast(&mut self, msg: Message<Validated>) -> Result<(), Self::Err> {
        (**self).broadcast(msg).await
    }

    async fn send(&mut self, to: PublicKey, msg: Message<Validated>) -> Result<(), Self::Err> {
        (**self).send(to, msg).await
    }

    async fn receive(&mut self) -> Result<Inbound, Self::Err> {
        (**self).receive().await
    }

    async fn request_transactions(&mut self, h: Vec<TxHash>) -> Result<(), Self::Err> {
        (**self).request_transactions(h).await
    }

    async fn announce_transactions(&mut self, h: Vec<TxHash>) -> Result<(), Self::Err> {
        (**self).announce_transactions(h).await
    }

    async fn send_transactions(&mut self, to: PublicKey, t: Vec<Transaction>) -> Result<(), Self::Err> {
        (**self).send_transactions(to, t).await
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CommError<E> {
    #[error("network error: {0}")]
    Net(#[source] E),

    #[error("bincode encode error: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    #[error("bincode decode error: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),

    #[error("channel closed")]
    Closed,
}
