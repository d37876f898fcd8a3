use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;

use dbft_consensus::{Consensus, ConsensusError};
use dbft_types::{Action, Block, Comm, Inbound, Ledger, Mempool, Message, RoundTag, Transaction};
use dbft_types::TxHash;
use futures::{FutureExt, future::BoxFuture};
use multisig::{PublicKey, Unchecked};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Capacity of the event queue.
const EVENT_CAPACITY: usize = 1024;

/// Capacity of the committed block stream.
const BLOCK_CAPACITY: usize = 128;

/// Inputs of a `Coordinator` besides the network.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message obtained outside of the coordinator's `Comm`.
    Inbound(Message<Unchecked>),
    /// A timer fired, e.g. one driven by an external scheduler.
    TimerFired(RoundTag),
    /// A block was persisted by someone else, e.g. by block sync.
    HeightPersisted(Block),
    /// A transaction was added to the mempool.
    MempoolArrival(Transaction),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
#[error("coordinator has stopped")]
pub struct Closed(());

/// Cheaply cloneable access to a running `Coordinator`.
#[derive(Debug, Clone)]
pub struct Handle {
    events: mpsc::Sender<Event>,
    blocks: broadcast::Sender<Block>,
}

impl Handle {
    pub async fn send(&self, e: Event) -> Result<(), Closed> {
        self.events.send(e).await.map_err(|_| Closed(()))
    }

    pub async fn shutdown(&self) -> Result<(), Closed> {
        self.send(Event::Shutdown).await
    }

    /// Receive every block committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.blocks.subscribe()
    }
}

/// Drives a `Consensus` instance with network, timer and application events.
pub struct Coordinator<C> {
    consensus: Consensus,
    comm: C,
    ledger: Arc<dyn Ledger>,
    mempool: Arc<dyn Mempool>,
    events: mpsc::Receiver<Event>,
    handle: Handle,
}

impl<C: Comm + Send> Coordinator<C> {
    /// Create a coordinator.
    ///
    /// `ledger` and `mempool` must be the instances given to `consensus`.
    pub fn new(
        consensus: Consensus,
        comm: C,
        ledger: Arc<dyn Ledger>,
        mempool: Arc<dyn Mempool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let (blocks, _) = broadcast::channel(BLOCK_CAPACITY);
        Self {
            consensus,
            comm,
            ledger,
            mempool,
            events: rx,
            handle: Handle { events: tx, blocks },
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn consensus(&self) -> &Consensus {
        &self.consensus
    }

    /// Run until shutdown.
    pub async fn go(mut self) -> Result<(), ConsensusError> {
        let mut timer: BoxFuture<'static, RoundTag> = pending().boxed();

        info!(node = %self.consensus.public_key(), "starting coordinator");

        let actions = self.consensus.start()?;
        self.execute(actions, &mut timer).await?;

        loop {
            let actions = tokio::select! { biased;
                tag = &mut timer => {
                    timer = pending().boxed();
                    self.consensus.timeout(tag)?
                }
                event = self.events.recv() => match event {
                    Some(Event::Shutdown) | None => {
                        info!(node = %self.consensus.public_key(), "coordinator shutting down");
                        return Ok(())
                    }
                    Some(e) => self.on_event(e)?
                },
                inbound = self.comm.receive() => match inbound {
                    Ok(Inbound::Message(m)) => self.on_event(Event::Inbound(m))?,
                    Ok(Inbound::Transactions(txs)) => {
                        let mut actions = Vec::new();
                        for tx in txs {
                            actions.extend(self.on_event(Event::MempoolArrival(tx))?)
                        }
                        actions
                    }
                    Ok(Inbound::TransactionRequest(from, h)) => {
                        self.serve_transactions(from, h).await;
                        continue
                    }
                    Ok(Inbound::TransactionAnnouncement(from, h)) => {
                        self.fetch_transactions(from, h).await;
                        continue
                    }
                    Err(err) => {
                        warn!(node = %self.consensus.public_key(), %err, "error receiving message");
                        continue
                    }
                }
            };
            self.execute(actions, &mut timer).await?
        }
    }

    fn on_event(&mut self, e: Event) -> Result<Vec<Action>, ConsensusError> {
        match e {
            Event::Inbound(m) => self.consensus.handle_message(m),
            Event::TimerFired(tag) => self.consensus.timeout(tag),
            Event::HeightPersisted(b) => {
                let _ = self.handle.blocks.send(b.clone());
                self.consensus.block_persisted(&b)
            }
            Event::MempoolArrival(tx) => self.consensus.mempool_transaction(tx),
            Event::Shutdown => Ok(Vec::new()),
        }
    }

    /// Send a peer the bodies we have of the transactions it asked for.
    async fn serve_transactions(&mut self, to: PublicKey, hashes: Vec<TxHash>) {
        let txs = hashes
            .iter()
            .filter_map(|h| self.mempool.get(h).or_else(|| self.ledger.get_transaction(h)))
            .collect::<Vec<_>>();
        if txs.is_empty() {
            return;
        }
        debug!(node = %self.consensus.public_key(), peer = %to, txs = %txs.len(), "serving transactions");
        if let Err(err) = self.comm.send_transactions(to, txs).await {
            warn!(node = %self.consensus.public_key(), %err, "failed to send transactions")
        }
    }

    /// Ask for announced transactions we do not know.
    async fn fetch_transactions(&mut self, from: PublicKey, hashes: Vec<TxHash>) {
        let missing = hashes
            .into_iter()
            .filter(|h| self.mempool.get(h).is_none() && !self.ledger.contains_transaction(h))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return;
        }
        debug!(node = %self.consensus.public_key(), peer = %from, txs = %missing.len(), "fetching announced transactions");
        if let Err(err) = self.comm.request_transactions(missing).await {
            warn!(node = %self.consensus.public_key(), %err, "failed to request transactions")
        }
    }

    /// Execute actions in order.
    ///
    /// Persisting a block produces the actions of the next height, which are
    /// executed before returning.
    async fn execute(
        &mut self,
        actions: Vec<Action>,
        timer: &mut BoxFuture<'static, RoundTag>,
    ) -> Result<(), ConsensusError> {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::ResetTimer(tag, d) => {
                    *timer = sleep(d).map(move |_| tag).fuse().boxed();
                }
                Action::Broadcast(m) => {
                    if let Err(err) = self.comm.broadcast(m).await {
                        warn!(node = %self.consensus.public_key(), %err, "failed to broadcast message")
                    }
                }
                Action::SendTo(to, m) => {
                    let Some(k) = self.consensus.committee().get_key(to).copied() else {
                        debug!(node = %self.consensus.public_key(), %to, "unknown recipient");
                        continue;
                    };
                    if let Err(err) = self.comm.send(k, m).await {
                        warn!(node = %self.consensus.public_key(), %err, "failed to send message")
                    }
                }
                Action::RequestTransactions(h) => {
                    if let Err(err) = self.comm.request_transactions(h).await {
                        warn!(node = %self.consensus.public_key(), %err, "failed to request transactions")
                    }
                }
                Action::AnnounceTransactions(h) => {
                    if let Err(err) = self.comm.announce_transactions(h).await {
                        warn!(node = %self.consensus.public_key(), %err, "failed to announce transactions")
                    }
                }
                Action::PersistBlock(b) => {
                    if let Err(err) = self.ledger.persist_block(b.clone()) {
                        error!(node = %self.consensus.public_key(), block = %b, %err, "failed to persist block");
                        continue;
                    }
                    self.mempool.update_pool(&b);
                    let _ = self.handle.blocks.send(b.clone());
                    queue.extend(self.consensus.block_persisted(&b)?)
                }
            }
        }
        Ok(())
    }
}
