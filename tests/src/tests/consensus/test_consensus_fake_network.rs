use dbft::logging;
use dbft_consensus::ConsensusConfig;
use dbft_types::{ChangeViewReason, Height, Ledger, Message, Transaction, ViewNumber};
use multisig::KeyId;

use crate::tests::consensus::helpers::fake_network::{
    BLOCK_TIME, FakeNetwork, START, assert_consistent, default_config,
};
use crate::tests::consensus::helpers::interceptor::Interceptor;

fn tx(i: u64) -> Transaction {
    Transaction::new(i, 1, 10 + i, vec![i as u8; 16])
}

#[test]
fn test_multi_height_consensus() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    net.add_transaction(tx(1));
    net.add_transaction(tx(2));
    net.start();

    assert!(net.run_until(50, |n| n.min_height() >= Height::from(5)));
    assert_consistent(&net);

    let blocks = net.node(KeyId::from(0)).ledger.blocks();
    for b in &blocks[1..] {
        assert!(b.is_valid(net.committee()));
    }

    // The first proposer picks up everything in the mempool:
    let first = &blocks[1];
    assert_eq!(first.transactions().len(), 2);
    assert_eq!(first.header().primary(), KeyId::from(1));

    // Without failures no view changes happen and proposers rotate per height:
    for (i, b) in blocks.iter().enumerate().skip(1) {
        assert_eq!(b.header().primary(), KeyId::from((i % 4) as u8));
    }
    for (_, n) in net.online() {
        assert_eq!(n.consensus.view(), ViewNumber::zero());
        assert!(n.pool.is_empty());
    }
}

#[test]
fn test_silent_primary_is_replaced() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    net.silence(KeyId::from(1));
    net.start();

    assert!(net.run_until(10, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);

    let b = net.node(KeyId::from(0)).ledger.current_header();
    assert_eq!(b.primary(), KeyId::from(2));

    let reasons = net
        .sent()
        .iter()
        .filter_map(|(_, m)| match m {
            Message::ChangeView(e) => Some(e.data().body().reason()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(reasons.len(), 3);
    assert!(reasons.iter().all(|r| *r == ChangeViewReason::Timeout));
}

#[test]
fn test_liveness_with_f_silent_nodes() {
    logging::init_logging();

    let mut net = FakeNetwork::new(7);
    net.silence(KeyId::from(3));
    net.silence(KeyId::from(5));
    net.start();

    assert!(net.run_until(200, |n| n.min_height() >= Height::from(8)));
    assert_consistent(&net);

    for b in &net.node(KeyId::from(0)).ledger.blocks()[1..] {
        assert!(b.is_valid(net.committee()));
        assert_ne!(b.header().primary(), KeyId::from(3));
        assert_ne!(b.header().primary(), KeyId::from(5));
    }
}

#[test]
fn test_block_over_size_limit_is_rejected() {
    logging::init_logging();

    // Only the first proposer accepts large blocks:
    let mut net = FakeNetwork::with_configs(4, |k| {
        if k == KeyId::from(1) {
            default_config()
        } else {
            ConsensusConfig {
                max_block_size: 300,
                ..default_config()
            }
        }
    });
    let large = Transaction::new(1, 1, 1000, vec![7u8; 512]);
    net.add_transaction(large.clone());
    net.start();

    assert!(net.run_until(10, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);

    let rejected = net.sent().iter().any(|(_, m)| match m {
        Message::ChangeView(e) => e.data().body().reason() == ChangeViewReason::BlockRejectedByPolicy,
        _ => false,
    });
    assert!(rejected);

    let b = net.node(KeyId::from(0)).ledger.block(Height::from(1)).unwrap();
    assert_eq!(b.header().primary(), KeyId::from(2));
    assert!(b.transactions().is_empty());
    assert!(!net.node(KeyId::from(0)).ledger.contains_transaction(&large.hash()));
}

#[test]
fn test_block_over_fee_limit_is_rejected_by_every_voter() {
    logging::init_logging();

    // Only the first proposer accepts expensive blocks:
    let mut net = FakeNetwork::with_configs(4, |k| {
        if k == KeyId::from(1) {
            default_config()
        } else {
            ConsensusConfig {
                max_block_system_fee: 100,
                ..default_config()
            }
        }
    });
    let a = Transaction::new(1, 60, 20, vec![1u8; 16]);
    let b = Transaction::new(2, 50, 10, vec![2u8; 16]);
    net.add_transaction(a.clone());
    net.add_transaction(b.clone());
    net.start();

    assert!(net.run_until(10, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);

    let mut rejecting = net
        .sent()
        .iter()
        .filter_map(|(k, m)| match m {
            Message::ChangeView(e)
                if e.data().view() == ViewNumber::zero()
                    && e.data().body().reason() == ChangeViewReason::BlockRejectedByPolicy =>
            {
                Some(*k)
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    rejecting.sort();
    rejecting.dedup();
    assert_eq!(rejecting, [KeyId::from(0), KeyId::from(2), KeyId::from(3)]);

    let voted = net.sent().iter().any(|(_, m)| match m {
        Message::PrepareVote(e) => e.data().view() == ViewNumber::zero(),
        _ => false,
    });
    assert!(!voted);

    // The next proposer stays below the ceiling:
    let blk = net.node(KeyId::from(0)).ledger.block(Height::from(1)).unwrap();
    assert_eq!(blk.header().primary(), KeyId::from(2));
    assert_eq!(blk.transactions(), [a]);
    assert!(!net.node(KeyId::from(0)).ledger.contains_transaction(&b.hash()));
}

#[test]
fn test_missing_transactions_are_fetched() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    let t = tx(9);
    net.node(KeyId::from(1)).pool.add_verified(t.clone());
    net.start();

    assert!(net.run_until(5, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);

    for (_, n) in net.online() {
        assert!(n.ledger.contains_transaction(&t.hash()));
    }
}

#[test]
fn test_progress_extends_the_timer() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    net.set_interceptor(Interceptor::drop_if(|_, m| matches!(m, Message::PrepareVote(_))));
    net.start();
    net.process();

    // A backup saw the proposal and voted, each of which grants 2/M block times:
    let c = net.consensus(KeyId::from(2));
    assert!(c.round().has_proposal());
    assert!(!c.is_commit_sent());
    let d = c.deadline().unwrap();
    assert_eq!(u64::from(d.expires_at()), START + 2 * 1000 + 2 * 666);
    assert!(d.delay() > BLOCK_TIME * 2);
}
