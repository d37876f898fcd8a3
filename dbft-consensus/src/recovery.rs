use dbft_types::{ChangeViewCompact, CommitCompact, PreparationCompact, RecoveryMessage};

use crate::context::RoundState;

/// Compact the round state into a recovery message.
///
/// Commits are only shared once we committed ourselves.
pub fn assemble(r: &RoundState, m: usize, commit_sent: bool) -> RecoveryMessage {
    let change_views = r
        .last_change_views()
        .values()
        .take(m)
        .map(ChangeViewCompact::new)
        .collect();

    let proposal = r.proposal().map(|e| e.data().body().clone());

    let preparation_hash = if proposal.is_none() {
        r.most_common_preparation()
    } else {
        None
    };

    let preparations = r
        .proposal()
        .map(PreparationCompact::new)
        .into_iter()
        .chain(r.preparations().values().map(PreparationCompact::new))
        .collect();

    let commits = if commit_sent {
        r.commits().values().map(CommitCompact::new).collect()
    } else {
        Vec::new()
    };

    RecoveryMessage::new(
        change_views,
        proposal,
        preparation_hash,
        preparations,
        commits,
    )
}
