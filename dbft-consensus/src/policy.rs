//! Block size and fee limits.

use dbft_types::Transaction;

use crate::ConsensusConfig;

/// Size of a 64 byte signature plus its index.
const WITNESS_ENTRY_SIZE: usize = 1 + 64;

/// Fixed part of an encoded header: version, previous hash, height,
/// timestamp, nonce and primary index.
const HEADER_BASE_SIZE: usize = 4 + 32 + 4 + 8 + 8 + 1;

/// Upper bounds a block must respect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_transactions: usize,
    pub max_size: usize,
    pub max_system_fee: u64,
}

impl From<&ConsensusConfig> for BlockLimits {
    fn from(c: &ConsensusConfig) -> Self {
        Self {
            max_transactions: c.max_transactions_per_block,
            max_size: c.max_block_size,
            max_system_fee: c.max_block_system_fee,
        }
    }
}

/// Length of a variable length integer prefix.
fn var_size(n: usize) -> usize {
    match n {
        0..0xfd => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Expected size of a block without its transaction bodies.
///
/// `m` signatures make up the witness, every transaction adds its hash to
/// the header.
pub fn header_size(m: usize, txs: usize) -> usize {
    HEADER_BASE_SIZE + var_size(m) + m * WITNESS_ENTRY_SIZE + var_size(txs) + 32 * txs
}

pub fn expected_block_size<'a, I>(m: usize, txs: I) -> usize
where
    I: IntoIterator<Item = &'a Transaction>,
    I::IntoIter: ExactSizeIterator,
{
    let txs = txs.into_iter();
    let base = header_size(m, txs.len());
    txs.fold(base, |acc, t| acc + t.size())
}

pub fn expected_system_fee<'a, I>(txs: I) -> u64
where
    I: IntoIterator<Item = &'a Transaction>,
{
    txs.into_iter()
        .fold(0u64, |acc, t| acc.saturating_add(t.system_fee()))
}

/// Take transactions in the given order until a limit is hit.
///
/// At most `max_transactions` are considered, and selection stops at the first
/// transaction that would push the block over the size or fee limit.
pub fn select_batch<I>(txs: I, limits: &BlockLimits, m: usize) -> Vec<Transaction>
where
    I: IntoIterator<Item = Transaction>,
{
    let candidates = txs
        .into_iter()
        .take(limits.max_transactions)
        .collect::<Vec<_>>();

    let mut size = header_size(m, candidates.len());
    let mut fee = 0u64;
    let mut batch = Vec::with_capacity(candidates.len());

    for tx in candidates {
        size += tx.size();
        if size > limits.max_size {
            break;
        }
        fee = fee.saturating_add(tx.system_fee());
        if fee > limits.max_system_fee {
            break;
        }
        batch.push(tx)
    }

    batch
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn tx(nonce: u64, fee: u64, len: usize) -> Transaction {
        Transaction::new(nonce, fee, 0, Bytes::from(vec![0; len]))
    }

    fn limits() -> BlockLimits {
        BlockLimits {
            max_transactions: 512,
            max_size: 262_144,
            max_system_fee: 150_000_000_000,
        }
    }

    #[test]
    fn stops_at_first_fee_overflow() {
        let l = BlockLimits {
            max_system_fee: 10,
            ..limits()
        };
        let txs = vec![tx(1, 4, 10), tx(2, 4, 10), tx(3, 4, 10), tx(4, 1, 10)];
        let b = select_batch(txs, &l, 3);
        // The fourth one would fit, but selection stops at the third.
        assert_eq!(b.iter().map(|t| t.nonce()).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn respects_transaction_count() {
        let l = BlockLimits {
            max_transactions: 3,
            ..limits()
        };
        let b = select_batch((0..10).map(|i| tx(i, 0, 1)), &l, 1);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn batch_is_a_prefix_within_limits() {
        arbtest::arbtest(|u| {
            let l = BlockLimits {
                max_transactions: u.int_in_range(0..=64)?,
                max_size: u.int_in_range(0..=8192)?,
                max_system_fee: u.int_in_range(0..=1000)?,
            };
            let m = u.int_in_range(1..=7)?;
            let mut txs = Vec::new();
            for i in 0..u.int_in_range(0..=80u64)? {
                txs.push(tx(i, u.int_in_range(0..=100)?, u.int_in_range(0..=300)?));
            }
            let b = select_batch(txs.clone(), &l, m);
            assert!(b.len() <= l.max_transactions);
            assert_eq!(b[..], txs[..b.len()]);
            assert!(expected_system_fee(&b) <= l.max_system_fee);
            if !b.is_empty() {
                let n = txs.len().min(l.max_transactions);
                let size = header_size(m, n) + b.iter().map(|t| t.size()).sum::<usize>();
                assert!(size <= l.max_size);
            }
            Ok(())
        });
    }
}
