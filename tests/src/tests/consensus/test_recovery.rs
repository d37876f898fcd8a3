use dbft::logging;
use dbft_types::{Action, Height, Ledger, Message};
use multisig::KeyId;

use crate::tests::consensus::helpers::fake_network::{FakeNetwork, assert_consistent};
use crate::tests::consensus::helpers::interceptor::Interceptor;

fn own_commit(net: &FakeNetwork, k: KeyId) -> Option<Message> {
    net.sent()
        .iter()
        .find(|(from, m)| *from == k && matches!(m, Message::Commit(_)))
        .map(|(_, m)| m.clone())
}

#[test]
fn test_restarted_node_resends_its_commit() {
    logging::init_logging();

    let mut net = FakeNetwork::new(4);
    net.set_interceptor(Interceptor::drop_if(|_, m| matches!(m, Message::Commit(_))));
    net.start();
    net.process();

    let k = KeyId::from(0);
    assert!(net.consensus(k).is_commit_sent());
    assert!(!net.node(k).store.is_empty());
    let before = own_commit(&net, k).expect("node committed");

    let actions = net.restart(k);

    // The restored node keeps its commit and shares the very same one again:
    assert!(net.consensus(k).is_commit_sent());
    let resent = actions
        .iter()
        .find_map(|a| match a {
            Action::Broadcast(m @ Message::Commit(_)) => Some(m.clone()),
            _ => None,
        })
        .expect("commit is sent again");
    assert_eq!(resent, before);

    net.set_interceptor(Interceptor::default());
    assert!(net.run_until(5, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);
}

#[test]
fn test_node_missing_the_round_recovers_it() {
    logging::init_logging();

    let late = KeyId::from(3);

    let mut net = FakeNetwork::new(4);
    net.set_interceptor(Interceptor::drop_if(move |to, m| {
        to == late || matches!(m, Message::Commit(_))
    }));
    net.start();
    net.process();

    assert!(!net.consensus(late).round().has_proposal());
    for i in 0..3 {
        assert!(net.consensus(KeyId::from(i)).is_commit_sent());
    }

    net.set_interceptor(Interceptor::default());
    assert!(net.run_until(5, |n| n.min_height() >= Height::from(1)));
    assert_consistent(&net);

    // Committed members resend their commits in recovery messages once
    // their timer expires; the late node rebuilds the round from them:
    assert!(net.sent().iter().any(|(from, m)| *from != late && matches!(m, Message::Recovery(_))));
    assert!(own_commit(&net, late).is_some());
    assert_eq!(
        net.node(late).ledger.current_header(),
        net.node(KeyId::from(0)).ledger.current_header()
    );
}

#[test]
fn test_snapshot_is_ignored_when_configured() {
    logging::init_logging();

    let mut net = FakeNetwork::with_configs(4, |_| dbft_consensus::ConsensusConfig {
        ignore_recovery_logs: true,
        ..crate::tests::consensus::helpers::fake_network::default_config()
    });
    net.set_interceptor(Interceptor::drop_if(|_, m| matches!(m, Message::Commit(_))));
    net.start();
    net.process();

    let k = KeyId::from(0);
    assert!(net.consensus(k).is_commit_sent());

    let actions = net.restart(k);
    assert!(!net.consensus(k).is_commit_sent());
    assert!(actions.iter().all(|a| !matches!(a.message(), Some(Message::Commit(_)))));
    assert!(actions.iter().any(|a| matches!(a.message(), Some(Message::RecoveryRequest(_)))));
}
