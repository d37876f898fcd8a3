//! In-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use multisig::Committee;
use parking_lot::{Mutex, RwLock};

use crate::ledger::{LedgerError, StoreError, VerifyResult};
use crate::{Block, Header, Height, Ledger, Mempool, RecoveryStore, RoundSnapshot, Timestamp};
use crate::{Transaction, TxHash};

/// A chain of blocks kept in memory.
///
/// Blocks are only appended if their witness is a quorum of the committee.
#[derive(Debug, Clone)]
pub struct MemLedger {
    committee: Committee,
    inner: Arc<RwLock<Chain>>,
}

#[derive(Debug)]
struct Chain {
    blocks: Vec<Block>,
    index: HashMap<TxHash, Transaction>,
}

impl MemLedger {
    pub fn new(genesis: Timestamp, committee: Committee) -> Self {
        Self {
            committee,
            inner: Arc::new(RwLock::new(Chain {
                blocks: vec![Block::genesis(genesis)],
                index: HashMap::new(),
            })),
        }
    }

    pub fn block(&self, h: Height) -> Option<Block> {
        self.inner.read().blocks.get(h.u32() as usize).cloned()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.read().blocks.clone()
    }
}

impl Ledger for MemLedger {
    fn current_height(&self) -> Height {
        let c = self.inner.read();
        Height::from(c.blocks.len() as u32 - 1)
    }

    fn current_header(&self) -> Header {
        let c = self.inner.read();
        c.blocks
            .last()
            .map(|b| b.header().clone())
            .expect("chain contains at least the genesis block")
    }

    fn contains_transaction(&self, h: &TxHash) -> bool {
        self.inner.read().index.contains_key(h)
    }

    fn get_transaction(&self, h: &TxHash) -> Option<Transaction> {
        self.inner.read().index.get(h).cloned()
    }

    fn persist_block(&self, b: Block) -> Result<(), LedgerError> {
        let mut c = self.inner.write();
        let tip = c.blocks.last().expect("chain contains at least the genesis block");
        let expected = tip.height() + 1;
        if b.height() != expected {
            return Err(LedgerError::NotNext {
                expected,
                found: b.height(),
            });
        }
        if b.header().prev_hash() != tip.hash() {
            return Err(LedgerError::PrevHashMismatch);
        }
        if !b.is_valid(&self.committee) {
            return Err(LedgerError::InvalidWitness);
        }
        for t in b.transactions() {
            c.index.insert(t.hash(), t.clone());
        }
        c.blocks.push(b);
        Ok(())
    }
}

/// Verified and unverified transactions kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemPool {
    inner: Arc<RwLock<Pool>>,
}

#[derive(Debug, Default)]
struct Pool {
    verified: HashMap<TxHash, Transaction>,
    unverified: HashMap<TxHash, Transaction>,
    verdicts: HashMap<TxHash, VerifyResult>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_verified(&self, tx: Transaction) {
        let mut p = self.inner.write();
        let h = tx.hash();
        p.unverified.remove(&h);
        p.verified.insert(h, tx);
    }

    pub fn add_unverified(&self, tx: Transaction) {
        let mut p = self.inner.write();
        let h = tx.hash();
        if !p.verified.contains_key(&h) {
            p.unverified.insert(h, tx);
        }
    }

    /// Fix the outcome of re-verifying the given transaction.
    pub fn set_verdict(&self, h: TxHash, r: VerifyResult) {
        self.inner.write().verdicts.insert(h, r);
    }

    pub fn len(&self) -> usize {
        let p = self.inner.read();
        p.verified.len() + p.unverified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Mempool for MemPool {
    fn verified_transactions(&self) -> Vec<Transaction> {
        let mut txs = self.inner.read().verified.values().cloned().collect::<Vec<_>>();
        txs.sort_by(|a, b| {
            b.network_fee()
                .cmp(&a.network_fee())
                .then_with(|| {
                    let (x, y) = (a.hash(), b.hash());
                    <_ as AsRef<[u8]>>::as_ref(&x).cmp(<_ as AsRef<[u8]>>::as_ref(&y))
                })
        });
        txs
    }

    fn get_verified(&self, h: &TxHash) -> Option<Transaction> {
        self.inner.read().verified.get(h).cloned()
    }

    fn get(&self, h: &TxHash) -> Option<Transaction> {
        let p = self.inner.read();
        p.verified.get(h).or_else(|| p.unverified.get(h)).cloned()
    }

    fn reverify(&self, tx: &Transaction) -> VerifyResult {
        let mut p = self.inner.write();
        let h = tx.hash();
        let r = p.verdicts.get(&h).copied().unwrap_or(VerifyResult::Succeed);
        if r.is_ok() {
            p.unverified.remove(&h);
            p.verified.insert(h, tx.clone());
        }
        r
    }

    fn update_pool(&self, b: &Block) {
        let hashes = b.header().transactions().iter().collect::<HashSet<_>>();
        let mut p = self.inner.write();
        p.verified.retain(|h, _| !hashes.contains(h));
        p.unverified.retain(|h, _| !hashes.contains(h));
    }
}

/// A recovery store in memory.
///
/// Clones share the stored snapshot, which allows simulating restarts.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl RecoveryStore for MemStore {
    fn load(&self) -> Result<Option<RoundSnapshot>, StoreError> {
        self.inner
            .lock()
            .as_deref()
            .map(RoundSnapshot::decode)
            .transpose()
    }

    fn save(&mut self, s: &RoundSnapshot) -> Result<(), StoreError> {
        let bytes = s.encode()?;
        *self.inner.lock() = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use multisig::{Certificate, KeyId, Keypair};

    use super::*;

    fn keys() -> Vec<Keypair> {
        (0..4u8)
            .map(|i| Keypair::from_seed([i + 1; 32]).unwrap())
            .collect()
    }

    fn header(prev: &Header, txs: &[Transaction]) -> Header {
        Header::new(
            0,
            prev.hash(),
            prev.height() + 1,
            prev.timestamp() + std::time::Duration::from_secs(1),
            0,
            KeyId::default(),
            txs.iter().map(|t| t.hash()).collect(),
        )
    }

    /// A block signed by the first `n` keys.
    fn block(keys: &[Keypair], n: usize, prev: &Header, txs: Vec<Transaction>) -> Block {
        let h = header(prev, &txs);
        let c = h.hash();
        let sigs = keys
            .iter()
            .take(n)
            .enumerate()
            .map(|(i, k)| (KeyId::from(i as u8), k.sign(c.as_ref())));
        Block::new(Certificate::new(h, sigs), txs)
    }

    #[test]
    fn ledger_appends_in_order() {
        let keys = keys();
        let l = MemLedger::new(
            Timestamp::from(1000),
            Committee::new(keys.iter().map(|k| k.public_key())),
        );
        let tx = Transaction::new(1, 10, 1, vec![1u8, 2, 3]);
        let b1 = block(&keys, 3, &l.current_header(), vec![tx.clone()]);
        l.persist_block(b1.clone()).unwrap();
        assert_eq!(l.current_height(), Height::from(1));
        assert!(l.contains_transaction(&tx.hash()));

        // Same block again is not the next one.
        assert!(matches!(
            l.persist_block(b1),
            Err(LedgerError::NotNext { .. })
        ));

        let b2 = block(&keys, 3, &Header::genesis(Timestamp::from(7)), Vec::new());
        assert!(l.persist_block(b2).is_err());
    }

    #[test]
    fn ledger_rejects_invalid_witness() {
        let keys = keys();
        let l = MemLedger::new(
            Timestamp::from(1000),
            Committee::new(keys.iter().map(|k| k.public_key())),
        );
        let tip = l.current_header();

        let short = block(&keys, 2, &tip, Vec::new());
        assert!(matches!(
            l.persist_block(short),
            Err(LedgerError::InvalidWitness)
        ));

        // Quorum of signatures but the bodies do not match the header.
        let tx = Transaction::new(1, 0, 0, Bytes::new());
        let h = header(&tip, &[tx]);
        let c = h.hash();
        let sigs = keys
            .iter()
            .take(3)
            .enumerate()
            .map(|(i, k)| (KeyId::from(i as u8), k.sign(c.as_ref())));
        let missing = Block::new(Certificate::new(h, sigs), Vec::new());
        assert!(matches!(
            l.persist_block(missing),
            Err(LedgerError::InvalidWitness)
        ));

        assert_eq!(l.current_height(), Height::from(0));
        l.persist_block(block(&keys, 4, &tip, Vec::new())).unwrap();
        assert_eq!(l.current_height(), Height::from(1));
    }

    #[test]
    fn pool_orders_by_fee() {
        let p = MemPool::new();
        for fee in [5, 1, 9, 3] {
            p.add_verified(Transaction::new(fee, 0, fee, Bytes::new()));
        }
        let fees = p
            .verified_transactions()
            .iter()
            .map(|t| t.network_fee())
            .collect::<Vec<_>>();
        assert_eq!(fees, [9, 5, 3, 1]);
    }

    #[test]
    fn reverify_promotes() {
        let p = MemPool::new();
        let a = Transaction::new(1, 0, 0, Bytes::new());
        let b = Transaction::new(2, 0, 0, Bytes::new());
        p.add_unverified(a.clone());
        p.add_unverified(b.clone());
        p.set_verdict(b.hash(), VerifyResult::PolicyFail);
        assert_eq!(p.reverify(&a), VerifyResult::Succeed);
        assert_eq!(p.reverify(&b), VerifyResult::PolicyFail);
        assert!(p.get_verified(&a.hash()).is_some());
        assert!(p.get_verified(&b.hash()).is_none());
        assert!(p.get(&b.hash()).is_some());
    }

    #[test]
    fn store_is_shared_between_clones() {
        let mut s = MemStore::new();
        let t = s.clone();
        assert!(t.load().unwrap().is_none());
        let snap = RoundSnapshot::new(Height::from(3), 1.into());
        s.save(&snap).unwrap();
        assert_eq!(t.load().unwrap(), Some(snap));
    }
}
