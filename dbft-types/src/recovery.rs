use std::collections::HashSet;

use committable::{Commitment, Committable, RawCommitmentBuilder};
use multisig::{Committee, Envelope, KeyId, Signature, Unchecked};
use serde::{Deserialize, Serialize};

use crate::message::{ChangeView, ChangeViewReason, Commit, PrepareVote, Proposal};
use crate::{Height, Message, Payload, ProposalHash, Timestamp, ViewNumber};

/// A change view without its common fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeViewCompact {
    pub validator: KeyId,
    pub original_view: ViewNumber,
    pub new_view: ViewNumber,
    pub reason: ChangeViewReason,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

/// The signature of a proposal or prepare vote.
///
/// The proposer's entry signs the proposal carried next to it, all other
/// entries sign a prepare vote for that proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreparationCompact {
    pub validator: KeyId,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitCompact {
    pub validator: KeyId,
    pub view: ViewNumber,
    pub block_signature: Signature,
    pub signature: Signature,
}

/// Everything a node knows about the current round, in compact form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecoveryMessage {
    change_views: Vec<ChangeViewCompact>,
    proposal: Option<Proposal>,
    preparation_hash: Option<ProposalHash>,
    preparations: Vec<PreparationCompact>,
    commits: Vec<CommitCompact>,
}

impl ChangeViewCompact {
    pub fn new(e: &Envelope<Payload<ChangeView>, impl Sized>) -> Self {
        let d = e.data();
        Self {
            validator: d.validator(),
            original_view: d.view(),
            new_view: d.body().new_view(),
            reason: d.body().reason(),
            timestamp: d.body().timestamp(),
            signature: *e.signature(),
        }
    }
}

impl PreparationCompact {
    pub fn new<B: Committable>(e: &Envelope<Payload<B>, impl Sized>) -> Self {
        Self {
            validator: e.data().validator(),
            signature: *e.signature(),
        }
    }
}

impl CommitCompact {
    pub fn new(e: &Envelope<Payload<Commit>, impl Sized>) -> Self {
        Self {
            validator: e.data().validator(),
            view: e.data().view(),
            block_signature: *e.data().body().signature(),
            signature: *e.signature(),
        }
    }
}

impl RecoveryMessage {
    pub fn new(
        change_views: Vec<ChangeViewCompact>,
        proposal: Option<Proposal>,
        preparation_hash: Option<ProposalHash>,
        preparations: Vec<PreparationCompact>,
        commits: Vec<CommitCompact>,
    ) -> Self {
        Self {
            change_views,
            proposal,
            preparation_hash,
            preparations,
            commits,
        }
    }

    pub fn change_views(&self) -> &[ChangeViewCompact] {
        &self.change_views
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    pub fn preparation_hash(&self) -> Option<ProposalHash> {
        self.preparation_hash
    }

    pub fn preparations(&self) -> &[PreparationCompact] {
        &self.preparations
    }

    pub fn commits(&self) -> &[CommitCompact] {
        &self.commits
    }

    /// Size bounds and index sanity.
    ///
    /// At most `M` change views, every index addresses a committee member and
    /// appears at most once per section.
    pub fn is_well_formed(&self, c: &Committee) -> bool {
        fn unique<I: Iterator<Item = KeyId>>(it: I, c: &Committee) -> bool {
            let mut seen = HashSet::new();
            for i in it {
                if c.get_key(i).is_none() || !seen.insert(i) {
                    return false;
                }
            }
            true
        }
        self.change_views.len() <= c.quorum_size().get()
            && unique(self.change_views.iter().map(|p| p.validator), c)
            && unique(self.preparations.iter().map(|p| p.validator), c)
            && unique(self.commits.iter().map(|p| p.validator), c)
    }

    /// Reconstruct the change view messages.
    pub fn change_view_messages(&self, h: Height, c: &Committee) -> Vec<Message<Unchecked>> {
        self.change_views
            .iter()
            .filter_map(|p| {
                let k = c.get_key(p.validator)?;
                let b = ChangeView::new(p.new_view, p.reason, p.timestamp);
                let d = Payload::new(h, p.original_view, p.validator, b);
                Some(Message::ChangeView(Envelope::from_parts(d, p.signature, *k)))
            })
            .collect()
    }

    /// Reconstruct the proposal of the given proposer, if present.
    pub fn proposal_message(
        &self,
        h: Height,
        v: ViewNumber,
        primary: KeyId,
        c: &Committee,
    ) -> Option<Message<Unchecked>> {
        let p = self.proposal.clone()?;
        let s = self.preparations.iter().find(|s| s.validator == primary)?;
        let k = c.get_key(primary)?;
        let d = Payload::new(h, v, primary, p);
        Some(Message::Proposal(Envelope::from_parts(d, s.signature, *k)))
    }

    /// Reconstruct the prepare votes of everyone except the proposer.
    ///
    /// The proposal hash is taken from the message if present, else `local`
    /// (the hash of the proposal the receiver already holds) is used.
    pub fn prepare_vote_messages(
        &self,
        h: Height,
        v: ViewNumber,
        primary: KeyId,
        local: Option<ProposalHash>,
        c: &Committee,
    ) -> Vec<Message<Unchecked>> {
        let hash = self.preparation_hash.or_else(|| {
            self.proposal
                .clone()
                .map(|p| Payload::new(h, v, primary, p).commit())
                .or(local)
        });
        let Some(hash) = hash else {
            return Vec::new();
        };
        self.preparations
            .iter()
            .filter(|p| p.validator != primary)
            .filter_map(|p| {
                let k = c.get_key(p.validator)?;
                let d = Payload::new(h, v, p.validator, PrepareVote::new(hash));
                Some(Message::PrepareVote(Envelope::from_parts(d, p.signature, *k)))
            })
            .collect()
    }

    /// Reconstruct the commit messages.
    pub fn commit_messages(&self, h: Height, c: &Committee) -> Vec<Message<Unchecked>> {
        self.commits
            .iter()
            .filter_map(|p| {
                let k = c.get_key(p.validator)?;
                let d = Payload::new(h, p.view, p.validator, Commit::new(p.block_signature));
                Some(Message::Commit(Envelope::from_parts(d, p.signature, *k)))
            })
            .collect()
    }
}

impl Committable for ChangeViewCompact {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("ChangeViewCompact")
            .u64_field("validator", self.validator.into())
            .u64_field("original_view", self.original_view.into())
            .u64_field("new_view", self.new_view.into())
            .u64_field("reason", self.reason.into())
            .u64_field("timestamp", *self.timestamp)
            .field("signature", self.signature.commit())
            .finalize()
    }
}

impl Committable for PreparationCompact {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("PreparationCompact")
            .u64_field("validator", self.validator.into())
            .field("signature", self.signature.commit())
            .finalize()
    }
}

impl Committable for CommitCompact {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("CommitCompact")
            .u64_field("validator", self.validator.into())
            .u64_field("view", self.view.into())
            .field("block_signature", self.block_signature.commit())
            .field("signature", self.signature.commit())
            .finalize()
    }
}

impl Committable for RecoveryMessage {
    fn commit(&self) -> Commitment<Self> {
        let cvs = self.change_views.iter().map(|p| p.commit()).collect::<Vec<_>>();
        let pre = self.preparations.iter().map(|p| p.commit()).collect::<Vec<_>>();
        let com = self.commits.iter().map(|p| p.commit()).collect::<Vec<_>>();
        RawCommitmentBuilder::new("RecoveryMessage")
            .array_field("change_views", &cvs)
            .optional("proposal", &self.proposal)
            .optional("preparation_hash", &self.preparation_hash.map(Hashed))
            .array_field("preparations", &pre)
            .array_field("commits", &com)
            .finalize()
    }
}

/// Adapter to commit to an optional commitment.
struct Hashed(ProposalHash);

impl Committable for Hashed {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Hashed")
            .field("hash", self.0)
            .finalize()
    }
}
