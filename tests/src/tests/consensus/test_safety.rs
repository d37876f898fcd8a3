use arbtest::arbtest;
use dbft::logging;
use dbft_types::{Height, Ledger, Message, Payload, Proposal, Timestamp, ViewNumber};
use multisig::{Envelope, KeyId, Unchecked};

use crate::tests::consensus::helpers::fake_network::{FakeNetwork, START, assert_consistent};

const HONEST: [u8; 3] = [0, 2, 3];
const BYZANTINE: u8 = 1;

/// A proposal of the (byzantine) first proposer.
fn proposal(net: &FakeNetwork, nonce: u64) -> Message<Unchecked> {
    let prev = net.node(KeyId::from(0)).ledger.current_header().hash();
    let p = Proposal::new(0, prev, Timestamp::from(START), nonce, Vec::new());
    let d = Payload::new(Height::from(1), ViewNumber::zero(), KeyId::from(BYZANTINE), p);
    Message::Proposal(Envelope::signed(d, &net.keys()[usize::from(BYZANTINE)])).into_unchecked()
}

#[test]
fn test_equivocating_primary_cannot_split_commits() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    net.silence(KeyId::from(BYZANTINE));
    net.start();

    let (a, b) = (proposal(&net, 1), proposal(&net, 2));
    net.inject(KeyId::from(0), a.clone());
    net.inject(KeyId::from(2), a);
    net.inject(KeyId::from(3), b);

    net.run_until(20, |_| false);
    assert_consistent(&net);

    // Only the proposal that reached a quorum gets commits:
    assert!(net.consensus(KeyId::from(0)).is_commit_sent());
    assert!(net.consensus(KeyId::from(2)).is_commit_sent());
    assert!(!net.consensus(KeyId::from(3)).is_commit_sent());
    assert!(net.node(KeyId::from(3)).ledger.current_height().is_genesis());
}

#[test]
fn test_no_fork_under_arbitrary_scheduling() {
    arbtest(|u| {
        let mut net = FakeNetwork::new(4);
        net.silence(KeyId::from(BYZANTINE));
        net.start();

        // The byzantine proposer hands out two different proposals:
        let (a, b) = (proposal(&net, 1), proposal(&net, 2));
        for k in HONEST {
            let p = if u.arbitrary()? { a.clone() } else { b.clone() };
            net.inject(KeyId::from(k), p)
        }

        for _ in 0..u.int_in_range(10..=400)? {
            let k = KeyId::from(*u.choose(&HONEST)?);
            match u.int_in_range(0..=9u8)? {
                0 => {
                    let timers = net.timers();
                    if !timers.is_empty() {
                        let t = *u.choose(&timers)?;
                        net.fire_timer(t)
                    }
                }
                1 => {
                    if net.queued(k) > 0 {
                        let i = u.choose_index(net.queued(k))?;
                        net.drop_at(k, i)
                    }
                }
                _ => {
                    if net.queued(k) > 0 {
                        let i = u.choose_index(net.queued(k))?;
                        net.deliver_at(k, i)
                    }
                }
            }
        }

        assert_consistent(&net);

        for (_, n) in net.online() {
            for b in &n.ledger.blocks()[1..] {
                assert!(b.is_valid(net.committee()))
            }
        }

        Ok(())
    });
}
