use std::sync::Arc;
use std::time::Duration;

use dbft::net::LocalNet;
use dbft::{Consensus, ConsensusConfig, Coordinator, Event, MemLedger, MemPool, MemStore, logging};
use dbft_types::{Height, Ledger, Timestamp, Transaction};
use multisig::{Committee, Keypair};
use tokio::task::JoinSet;
use tokio::time::timeout;

#[tokio::test]
async fn test_coordinators_over_local_net() {
    logging::init_logging();

    let keys = (0..4).map(|i| Keypair::from_seed([i + 1; 32]).unwrap()).collect::<Vec<_>>();
    let committee = Committee::new(keys.iter().map(|k| k.public_key()));
    let config = ConsensusConfig::default().with_block_time(Duration::from_millis(100));
    let genesis = Timestamp::now();

    let mut net = LocalNet::new(keys.iter().map(|k| k.public_key()));
    let mut handles = Vec::new();
    let mut ledgers = Vec::new();
    let mut pools = Vec::new();
    let mut tasks = JoinSet::new();

    for k in &keys {
        let ledger = Arc::new(MemLedger::new(genesis, committee.clone()));
        let pool = Arc::new(MemPool::new());
        let consensus = Consensus::new(
            k.clone(),
            committee.clone(),
            config.clone(),
            ledger.clone(),
            pool.clone(),
            MemStore::new(),
        )
        .unwrap();
        let comm = net.join(k.public_key()).unwrap();
        let c = Coordinator::new(consensus, comm, ledger.clone(), pool.clone());
        handles.push(c.handle());
        ledgers.push(ledger);
        pools.push(pool);
        tasks.spawn(c.go());
    }

    let mut blocks = handles[0].subscribe();

    let tx = Transaction::new(1, 1, 10, vec![1u8; 32]);
    for (p, h) in pools.iter().zip(&handles) {
        p.add_verified(tx.clone());
        h.send(Event::MempoolArrival(tx.clone())).await.unwrap();
    }

    let mut heights = Vec::new();
    timeout(Duration::from_secs(30), async {
        while heights.len() < 3 {
            let b = blocks.recv().await.unwrap();
            heights.push(b.height())
        }
    })
    .await
    .expect("blocks are produced");

    assert_eq!(heights, [Height::from(1), Height::from(2), Height::from(3)]);

    for h in &handles {
        h.shutdown().await.unwrap()
    }
    while let Some(r) = tasks.join_next().await {
        r.unwrap().unwrap()
    }

    let reference = ledgers[0].blocks();
    assert!(reference.iter().any(|b| b.transactions().contains(&tx)));
    for l in &ledgers[1..] {
        for (a, b) in l.blocks().iter().zip(&reference) {
            assert_eq!(a.hash(), b.hash())
        }
        assert!(l.current_height() >= Height::from(2));
    }
}

#[tokio::test]
async fn test_missing_transactions_are_fetched() {
    logging::init_logging();

    let keys = (0..4).map(|i| Keypair::from_seed([i + 1; 32]).unwrap()).collect::<Vec<_>>();
    let committee = Committee::new(keys.iter().map(|k| k.public_key()));
    let config = ConsensusConfig::default().with_block_time(Duration::from_millis(100));
    let genesis = Timestamp::now();

    let mut net = LocalNet::new(keys.iter().map(|k| k.public_key()));
    let mut coordinators = Vec::new();
    let mut ledgers = Vec::new();

    let tx = Transaction::new(3, 1, 10, vec![7u8; 16]);

    for (i, k) in keys.iter().enumerate() {
        let ledger = Arc::new(MemLedger::new(genesis, committee.clone()));
        let pool = Arc::new(MemPool::new());
        // Only the proposer of height 1 has the body.
        if i == 1 {
            pool.add_verified(tx.clone())
        }
        let consensus = Consensus::new(
            k.clone(),
            committee.clone(),
            config.clone(),
            ledger.clone(),
            pool.clone(),
            MemStore::new(),
        )
        .unwrap();
        let comm = net.join(k.public_key()).unwrap();
        coordinators.push(Coordinator::new(consensus, comm, ledger.clone(), pool));
        ledgers.push(ledger);
    }

    let handles = coordinators.iter().map(|c| c.handle()).collect::<Vec<_>>();
    let mut streams = handles.iter().map(|h| h.subscribe()).collect::<Vec<_>>();

    let mut tasks = JoinSet::new();
    for c in coordinators {
        tasks.spawn(c.go());
    }

    for s in &mut streams {
        timeout(Duration::from_secs(30), async {
            loop {
                let b = s.recv().await.unwrap();
                if b.transactions().contains(&tx) {
                    break
                }
            }
        })
        .await
        .expect("block with the transaction is committed")
    }

    for h in &handles {
        h.shutdown().await.unwrap()
    }
    while let Some(r) = tasks.join_next().await {
        r.unwrap().unwrap()
    }

    for l in &ledgers {
        assert!(l.contains_transaction(&tx.hash()))
    }
}
