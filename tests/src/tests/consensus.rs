mod helpers;
mod test_consensus_fake_network;
mod test_recovery;
mod test_safety;
