use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dbft_consensus::{Consensus, ConsensusConfig};
use dbft_types::mem::{MemLedger, MemPool, MemStore};
use dbft_types::{Action, Block, Clock, Height, Ledger, ManualClock, Mempool, Message};
use dbft_types::{RoundTag, Timestamp, Transaction};
use multisig::{Committee, KeyId, Keypair, Unchecked};
use tracing::debug;

use super::interceptor::Interceptor;

pub const START: u64 = 1_000_000;
pub const BLOCK_TIME: Duration = Duration::from_secs(1);

/// Upper bound of messages delivered by one call to `process`.
const MAX_DELIVERIES: usize = 100_000;

pub fn default_config() -> ConsensusConfig {
    ConsensusConfig::default().with_block_time(BLOCK_TIME)
}

pub struct Node {
    pub consensus: Consensus,
    pub ledger: MemLedger,
    pub pool: MemPool,
    pub store: MemStore,
    config: ConsensusConfig,
    queue: VecDeque<Message<Unchecked>>,
    timer: Option<(RoundTag, Timestamp)>,
    online: bool,
}

/// Mock the network.
///
/// Nodes share a manual clock which only moves when a timer is fired.
pub struct FakeNetwork {
    keys: Vec<Keypair>,
    committee: Committee,
    clock: ManualClock,
    nodes: BTreeMap<KeyId, Node>,
    interceptor: Interceptor,
    sent: Vec<(KeyId, Message)>,
}

impl FakeNetwork {
    pub fn new(n: u8) -> Self {
        Self::with_configs(n, |_| default_config())
    }

    pub fn with_configs<F>(n: u8, config: F) -> Self
    where
        F: Fn(KeyId) -> ConsensusConfig,
    {
        let keys = (0..n).map(|i| Keypair::from_seed([i + 1; 32]).unwrap()).collect::<Vec<_>>();
        let committee = Committee::new(keys.iter().map(|k| k.public_key()));
        let clock = ManualClock::new(Timestamp::from(START));
        let mut nodes = BTreeMap::new();
        for i in 0..n {
            let k = KeyId::from(i);
            let ledger = MemLedger::new(Timestamp::from(0), committee.clone());
            let pool = MemPool::new();
            let store = MemStore::new();
            let config = config(k);
            let consensus = Self::make_consensus(&keys, &committee, &clock, k, &config, &ledger, &pool, &store);
            nodes.insert(
                k,
                Node {
                    consensus,
                    ledger,
                    pool,
                    store,
                    config,
                    queue: VecDeque::new(),
                    timer: None,
                    online: true,
                },
            );
        }
        Self {
            keys,
            committee,
            clock,
            nodes,
            interceptor: Interceptor::default(),
            sent: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn make_consensus(
        keys: &[Keypair],
        committee: &Committee,
        clock: &ManualClock,
        k: KeyId,
        config: &ConsensusConfig,
        ledger: &MemLedger,
        pool: &MemPool,
        store: &MemStore,
    ) -> Consensus {
        Consensus::new(
            keys[usize::from(k)].clone(),
            committee.clone(),
            config.clone(),
            Arc::new(ledger.clone()),
            Arc::new(pool.clone()),
            store.clone(),
        )
        .expect("committee member")
        .with_clock(clock.clone())
    }

    /// Take a node off the network. It neither sends nor receives.
    pub fn silence(&mut self, k: KeyId) {
        let n = self.nodes.get_mut(&k).expect("known node");
        n.online = false;
        n.queue.clear();
        n.timer = None;
    }

    pub fn set_interceptor(&mut self, i: Interceptor) {
        self.interceptor = i
    }

    pub fn keys(&self) -> &[Keypair] {
        &self.keys
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn node(&self, k: KeyId) -> &Node {
        &self.nodes[&k]
    }

    pub fn consensus(&self, k: KeyId) -> &Consensus {
        &self.nodes[&k].consensus
    }

    pub fn online(&self) -> impl Iterator<Item = (KeyId, &Node)> {
        self.nodes.iter().filter(|(_, n)| n.online).map(|(k, n)| (*k, n))
    }

    /// The lowest ledger height of all online nodes.
    pub fn min_height(&self) -> Height {
        self.online()
            .map(|(_, n)| n.ledger.current_height())
            .min()
            .unwrap_or_default()
    }

    /// All messages sent so far.
    pub fn sent(&self) -> &[(KeyId, Message)] {
        &self.sent
    }

    /// Add a transaction to the mempool of every node.
    pub fn add_transaction(&mut self, tx: Transaction) {
        for n in self.nodes.values() {
            n.pool.add_verified(tx.clone())
        }
    }

    /// Put a message into the inbound queue of a node.
    pub fn inject(&mut self, to: KeyId, m: Message<Unchecked>) {
        if let Some(n) = self.nodes.get_mut(&to).filter(|n| n.online) {
            n.queue.push_back(m)
        }
    }

    pub fn start(&mut self) {
        let online = self.online().map(|(k, _)| k).collect::<Vec<_>>();
        for k in online {
            let actions = self.nodes.get_mut(&k).unwrap().consensus.start().unwrap();
            self.execute(k, actions)
        }
    }

    /// Replace the engine of a node by a fresh one on top of the same ledger,
    /// mempool and recovery store, and start it.
    ///
    /// Returns the actions of the restarted node.
    pub fn restart(&mut self, k: KeyId) -> Vec<Action> {
        let n = self.nodes.get_mut(&k).expect("known node");
        n.consensus = Self::make_consensus(
            &self.keys,
            &self.committee,
            &self.clock,
            k,
            &n.config,
            &n.ledger,
            &n.pool,
            &n.store,
        );
        n.queue.clear();
        n.timer = None;
        let actions = n.consensus.start().unwrap();
        self.execute(k, actions.clone());
        actions
    }

    /// Deliver messages until every queue is empty.
    ///
    /// Returns the number of messages delivered.
    pub fn process(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progress = false;
            let ids = self.nodes.keys().copied().collect::<Vec<_>>();
            for k in ids {
                if let Some(m) = self.nodes.get_mut(&k).and_then(|n| n.queue.pop_front()) {
                    self.deliver(k, m);
                    delivered += 1;
                    progress = true
                }
            }
            if !progress || delivered >= MAX_DELIVERIES {
                return delivered;
            }
        }
    }

    /// Number of queued messages per node.
    pub fn queued(&self, k: KeyId) -> usize {
        self.nodes[&k].queue.len()
    }

    /// Deliver the message at the given queue position.
    pub fn deliver_at(&mut self, k: KeyId, i: usize) {
        if let Some(m) = self.nodes.get_mut(&k).and_then(|n| n.queue.remove(i)) {
            self.deliver(k, m)
        }
    }

    /// Drop the message at the given queue position.
    pub fn drop_at(&mut self, k: KeyId, i: usize) {
        if let Some(n) = self.nodes.get_mut(&k) {
            n.queue.remove(i);
        }
    }

    /// Nodes with an armed timer.
    pub fn timers(&self) -> Vec<KeyId> {
        self.online()
            .filter(|(_, n)| n.timer.is_some())
            .map(|(k, _)| k)
            .collect()
    }

    /// Fire the timer of one node, advancing the clock if necessary.
    pub fn fire_timer(&mut self, k: KeyId) {
        let Some((tag, at)) = self.nodes.get_mut(&k).and_then(|n| n.timer.take()) else {
            return;
        };
        if at > self.clock.now() {
            self.clock.set(at)
        }
        debug!(node = %k, %tag, "timer fired");
        let actions = self.nodes.get_mut(&k).unwrap().consensus.timeout(tag).unwrap();
        self.execute(k, actions)
    }

    /// Advance the clock to the earliest deadline and fire all timers due.
    ///
    /// Returns `false` if no timer is armed.
    pub fn fire_next_timer(&mut self) -> bool {
        let Some(at) = self.online().filter_map(|(_, n)| n.timer.map(|t| t.1)).min() else {
            return false;
        };
        if at > self.clock.now() {
            self.clock.set(at)
        }
        let now = self.clock.now();
        let due = self
            .online()
            .filter(|(_, n)| n.timer.is_some_and(|t| t.1 <= now))
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        for k in due {
            self.fire_timer(k)
        }
        true
    }

    /// Alternate between delivering messages and firing timers until the
    /// predicate holds or `max_timers` timers fired.
    pub fn run_until<P>(&mut self, max_timers: usize, pred: P) -> bool
    where
        P: Fn(&Self) -> bool,
    {
        for _ in 0..=max_timers {
            self.process();
            if pred(self) {
                return true;
            }
            if !self.fire_next_timer() {
                return false;
            }
        }
        false
    }

    fn deliver(&mut self, to: KeyId, m: Message<Unchecked>) {
        for m in self.interceptor.intercept_message(to, m) {
            let Some(n) = self.nodes.get_mut(&to).filter(|n| n.online) else {
                return;
            };
            let actions = n.consensus.handle_message(m).unwrap();
            self.execute(to, actions)
        }
    }

    fn execute(&mut self, from: KeyId, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(a) = queue.pop_front() {
            match a {
                Action::ResetTimer(tag, d) => {
                    let at = self.clock.now() + d;
                    self.nodes.get_mut(&from).unwrap().timer = Some((tag, at))
                }
                Action::Broadcast(m) => {
                    for (k, n) in self.nodes.iter_mut() {
                        if *k != from && n.online {
                            n.queue.push_back(m.clone().into_unchecked())
                        }
                    }
                    self.sent.push((from, m))
                }
                Action::SendTo(to, m) => {
                    self.inject(to, m.clone().into_unchecked());
                    self.sent.push((from, m))
                }
                Action::RequestTransactions(hashes) => {
                    for h in hashes {
                        let found = self
                            .nodes
                            .iter()
                            .filter(|(k, _)| **k != from)
                            .find_map(|(_, n)| n.pool.get(&h));
                        if let Some(tx) = found {
                            let n = self.nodes.get_mut(&from).unwrap();
                            n.pool.add_verified(tx.clone());
                            queue.extend(n.consensus.mempool_transaction(tx).unwrap())
                        }
                    }
                }
                Action::AnnounceTransactions(_) => {}
                Action::PersistBlock(b) => {
                    let n = self.nodes.get_mut(&from).unwrap();
                    n.ledger.persist_block(b.clone()).unwrap();
                    n.pool.update_pool(&b);
                    queue.extend(n.consensus.block_persisted(&b).unwrap())
                }
            }
        }
    }
}

/// Assert that no two nodes persisted different blocks at the same height.
pub fn assert_consistent(net: &FakeNetwork) {
    let chains = net
        .nodes
        .values()
        .map(|n| n.ledger.blocks())
        .collect::<Vec<Vec<Block>>>();
    for a in &chains {
        for b in &chains {
            for (x, y) in a.iter().zip(b) {
                assert_eq!(x.hash(), y.hash(), "forked at height {}", x.height())
            }
        }
    }
}
