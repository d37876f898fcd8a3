use core::fmt;
use std::collections::HashSet;

use committable::{Commitment, Committable, RawCommitmentBuilder};
use multisig::{Committee, Envelope, KeyId, PublicKey, Signature, Unchecked, Validated};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::recovery::RecoveryMessage;
use crate::{BlockHash, Height, Timestamp, TxHash, ViewNumber};

pub type ProposalHash = Commitment<Payload<Proposal>>;

/// A consensus message.
///
/// Every message is signed by the sender's committee key and carries the
/// height, view and committee index of its sender.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Message<Status = Validated> {
    /// A request to move to a higher view.
    ChangeView(Envelope<Payload<ChangeView>, Status>),

    /// The block template of the proposer.
    Proposal(Envelope<Payload<Proposal>, Status>),

    /// A vote for the proposal.
    PrepareVote(Envelope<Payload<PrepareVote>, Status>),

    /// A signature over the final block header.
    Commit(Envelope<Payload<Commit>, Status>),

    /// A request for round information.
    RecoveryRequest(Envelope<Payload<RecoveryRequest>, Status>),

    /// A compact bundle of round information.
    Recovery(Envelope<Payload<RecoveryMessage>, Status>),
}

/// The fields common to all consensus messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload<B> {
    height: Height,
    view: ViewNumber,
    validator: KeyId,
    body: B,
}

impl<B> Payload<B> {
    pub fn new(height: Height, view: ViewNumber, validator: KeyId, body: B) -> Self {
        Self {
            height,
            view,
            validator,
            body,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn validator(&self) -> KeyId {
        self.validator
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeViewReason {
    Timeout,
    ChangeAgreement,
    TxNotFound,
    TxRejectedByPolicy,
    TxInvalid,
    BlockRejectedByPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeView {
    new_view: ViewNumber,
    reason: ChangeViewReason,
    timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proposal {
    version: u32,
    prev_hash: BlockHash,
    timestamp: Timestamp,
    nonce: u64,
    transactions: Vec<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrepareVote {
    proposal: ProposalHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoveryRequest {
    timestamp: Timestamp,
}

impl ChangeView {
    pub fn new(new_view: ViewNumber, reason: ChangeViewReason, timestamp: Timestamp) -> Self {
        Self {
            new_view,
            reason,
            timestamp,
        }
    }

    pub fn new_view(&self) -> ViewNumber {
        self.new_view
    }

    pub fn reason(&self) -> ChangeViewReason {
        self.reason
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Proposal {
    pub fn new(
        version: u32,
        prev_hash: BlockHash,
        timestamp: Timestamp,
        nonce: u64,
        transactions: Vec<TxHash>,
    ) -> Self {
        Self {
            version,
            prev_hash,
            timestamp,
            nonce,
            transactions,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.prev_hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn transactions(&self) -> &[TxHash] {
        &self.transactions
    }
}

impl PrepareVote {
    pub fn new(proposal: ProposalHash) -> Self {
        Self { proposal }
    }

    pub fn proposal(&self) -> ProposalHash {
        self.proposal
    }
}

impl Commit {
    pub fn new(signature: Signature) -> Self {
        Self { signature }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl RecoveryRequest {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

macro_rules! with_envelope {
    ($m:expr, $e:ident => $body:expr) => {
        match $m {
            Message::ChangeView($e) => $body,
            Message::Proposal($e) => $body,
            Message::PrepareVote($e) => $body,
            Message::Commit($e) => $body,
            Message::RecoveryRequest($e) => $body,
            Message::Recovery($e) => $body,
        }
    };
}

impl<S> Message<S> {
    pub fn height(&self) -> Height {
        with_envelope!(self, e => e.data().height())
    }

    pub fn view(&self) -> ViewNumber {
        with_envelope!(self, e => e.data().view())
    }

    pub fn validator(&self) -> KeyId {
        with_envelope!(self, e => e.data().validator())
    }

    pub fn signing_key(&self) -> &PublicKey {
        with_envelope!(self, e => e.signing_key())
    }

    /// The hash identifying this message, excluding its signature.
    pub fn hash(&self) -> Commitment<Self> {
        let builder = RawCommitmentBuilder::new("MessageHash");
        match self {
            Self::ChangeView(e) => builder.field("change-view", e.commitment()),
            Self::Proposal(e) => builder.field("proposal", e.commitment()),
            Self::PrepareVote(e) => builder.field("prepare-vote", e.commitment()),
            Self::Commit(e) => builder.field("commit", e.commitment()),
            Self::RecoveryRequest(e) => builder.field("recovery-request", e.commitment()),
            Self::Recovery(e) => builder.field("recovery", e.commitment()),
        }
        .finalize()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChangeView(_) => "ChangeView",
            Self::Proposal(_) => "Proposal",
            Self::PrepareVote(_) => "PrepareVote",
            Self::Commit(_) => "Commit",
            Self::RecoveryRequest(_) => "RecoveryRequest",
            Self::Recovery(_) => "Recovery",
        }
    }
}

impl Message<Validated> {
    pub fn into_unchecked(self) -> Message<Unchecked> {
        match self {
            Self::ChangeView(e) => Message::ChangeView(e.into_unchecked()),
            Self::Proposal(e) => Message::Proposal(e.into_unchecked()),
            Self::PrepareVote(e) => Message::PrepareVote(e.into_unchecked()),
            Self::Commit(e) => Message::Commit(e.into_unchecked()),
            Self::RecoveryRequest(e) => Message::RecoveryRequest(e.into_unchecked()),
            Self::Recovery(e) => Message::Recovery(e.into_unchecked()),
        }
    }
}

/// The sender's index must address the key that signed the message.
fn is_sender<B>(e: &Envelope<Payload<B>, Unchecked>, c: &Committee) -> bool
where
    Payload<B>: Committable,
{
    let i = e.data().validator();
    match c.get_key(i) {
        Some(k) if k == e.signing_key() => true,
        Some(k) => {
            warn!(signer = %e.signing_key(), index = %i, key = %k, "signer != committee member");
            false
        }
        None => {
            warn!(signer = %e.signing_key(), index = %i, "validator index out of range");
            false
        }
    }
}

impl Message<Unchecked> {
    /// Authenticate the message and apply structural checks.
    ///
    /// Returns `None` if the message must be discarded.
    pub fn validated(self, c: &Committee) -> Option<Message<Validated>> {
        macro_rules! envelope {
            ($e:expr) => {{
                if !is_sender(&$e, c) {
                    return None;
                }
                let Some(e) = $e.validated(c) else {
                    warn!("invalid envelope signature");
                    return None;
                };
                e
            }};
        }

        match self {
            Self::ChangeView(e) => {
                let e = envelope!(e);
                // A change view must target a later view than the one it was sent in:
                if e.data().body().new_view() <= e.data().view() {
                    warn!(
                        signer   = %e.signing_key(),
                        view     = %e.data().view(),
                        new_view = %e.data().body().new_view(),
                        "change view does not target a higher view"
                    );
                    return None;
                }
                Some(Message::ChangeView(e))
            }
            Self::Proposal(e) => {
                let e = envelope!(e);
                let hashes = e.data().body().transactions();
                // Every transaction hash must be unique:
                if hashes.iter().collect::<HashSet<_>>().len() != hashes.len() {
                    warn!(signer = %e.signing_key(), "proposal with duplicate transactions");
                    return None;
                }
                Some(Message::Proposal(e))
            }
            Self::PrepareVote(e) => Some(Message::PrepareVote(envelope!(e))),
            Self::Commit(e) => Some(Message::Commit(envelope!(e))),
            Self::RecoveryRequest(e) => Some(Message::RecoveryRequest(envelope!(e))),
            Self::Recovery(e) => {
                let e = envelope!(e);
                if !e.data().body().is_well_formed(c) {
                    warn!(signer = %e.signing_key(), "malformed recovery message");
                    return None;
                }
                Some(Message::Recovery(e))
            }
        }
    }
}

impl Message<Unchecked> {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .ok()
            .map(|(msg, _)| msg)
    }
}

impl<S: Serialize> Message<S> {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        bincode::serde::encode_into_std_write(self, buf, bincode::config::standard())
            .expect("serializing a `Message` never fails");
    }

    pub fn to_vec(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("serializing a `Message` never fails")
    }
}

impl<S> fmt::Display for Message<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, v, i) = (self.height(), self.view(), self.validator());
        match self {
            Self::ChangeView(e) => {
                let b = e.data().body();
                write!(f, "ChangeView({h},{v},{i},{},{})", b.new_view, b.reason)
            }
            Self::Proposal(e) => {
                let n = e.data().body().transactions.len();
                write!(f, "Proposal({h},{v},{i},{n})")
            }
            Self::PrepareVote(_) => write!(f, "PrepareVote({h},{v},{i})"),
            Self::Commit(_) => write!(f, "Commit({h},{v},{i})"),
            Self::RecoveryRequest(_) => write!(f, "RecoveryRequest({h},{v},{i})"),
            Self::Recovery(_) => write!(f, "Recovery({h},{v},{i})"),
        }
    }
}

impl fmt::Display for ChangeViewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ChangeAgreement => "change-agreement",
            Self::TxNotFound => "tx-not-found",
            Self::TxRejectedByPolicy => "tx-rejected-by-policy",
            Self::TxInvalid => "tx-invalid",
            Self::BlockRejectedByPolicy => "block-rejected-by-policy",
        };
        f.write_str(s)
    }
}

impl From<ChangeViewReason> for u64 {
    fn from(r: ChangeViewReason) -> Self {
        match r {
            ChangeViewReason::Timeout => 0,
            ChangeViewReason::ChangeAgreement => 1,
            ChangeViewReason::TxNotFound => 2,
            ChangeViewReason::TxRejectedByPolicy => 3,
            ChangeViewReason::TxInvalid => 4,
            ChangeViewReason::BlockRejectedByPolicy => 5,
        }
    }
}

impl<B: Committable> Committable for Payload<B> {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Payload")
            .field("height", self.height.commit())
            .u64_field("view", self.view.into())
            .u64_field("validator", self.validator.into())
            .field("body", self.body.commit())
            .finalize()
    }
}

impl Committable for ChangeView {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("ChangeView")
            .u64_field("new_view", self.new_view.into())
            .u64_field("reason", self.reason.into())
            .u64_field("timestamp", *self.timestamp)
            .finalize()
    }
}

impl Committable for Proposal {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Proposal")
            .u64_field("version", self.version.into())
            .field("prev_hash", self.prev_hash)
            .u64_field("timestamp", *self.timestamp)
            .u64_field("nonce", self.nonce)
            .array_field("transactions", &self.transactions)
            .finalize()
    }
}

impl Committable for PrepareVote {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("PrepareVote")
            .field("proposal", self.proposal)
            .finalize()
    }
}

impl Committable for Commit {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("Commit")
            .field("signature", self.signature.commit())
            .finalize()
    }
}

impl Committable for RecoveryRequest {
    fn commit(&self) -> Commitment<Self> {
        RawCommitmentBuilder::new("RecoveryRequest")
            .u64_field("timestamp", *self.timestamp)
            .finalize()
    }
}

impl<S> Committable for Message<S> {
    fn commit(&self) -> Commitment<Self> {
        let builder = RawCommitmentBuilder::new("Message");
        match self {
            Self::ChangeView(e) => builder.field("change-view", e.commit()),
            Self::Proposal(e) => builder.field("proposal", e.commit()),
            Self::PrepareVote(e) => builder.field("prepare-vote", e.commit()),
            Self::Commit(e) => builder.field("commit", e.commit()),
            Self::RecoveryRequest(e) => builder.field("recovery-request", e.commit()),
            Self::Recovery(e) => builder.field("recovery", e.commit()),
        }
        .finalize()
    }
}

#[cfg(test)]
mod tests {
    use multisig::Keypair;

    use super::*;
    use crate::{Header, Transaction};

    fn keys(n: u8) -> (Vec<Keypair>, Committee) {
        let keys = (0..n).map(|i| Keypair::from_seed([i + 1; 32]).unwrap()).collect::<Vec<_>>();
        let committee = Committee::new(keys.iter().map(|k| k.public_key()));
        (keys, committee)
    }

    fn change_view(k: &Keypair, i: u8, view: u8, new_view: u8) -> Message<Unchecked> {
        let b = ChangeView::new(new_view.into(), ChangeViewReason::Timeout, Timestamp::from(1));
        let d = Payload::new(Height::from(1), view.into(), KeyId::from(i), b);
        Message::ChangeView(Envelope::signed(d, k)).into_unchecked()
    }

    #[test]
    fn change_view_must_target_a_higher_view() {
        let (keys, c) = keys(4);
        assert!(change_view(&keys[0], 0, 0, 1).validated(&c).is_some());
        assert!(change_view(&keys[0], 0, 2, 2).validated(&c).is_none());
        assert!(change_view(&keys[0], 0, 3, 1).validated(&c).is_none());
    }

    #[test]
    fn duplicate_transactions_are_rejected() {
        let (keys, c) = keys(4);
        let h = Transaction::new(1, 0, 0, vec![1u8]).hash();
        let proposal = |txs: Vec<TxHash>| {
            let prev = Header::genesis(Timestamp::from(0)).hash();
            let p = Proposal::new(0, prev, Timestamp::from(2), 0, txs);
            let d = Payload::new(Height::from(1), ViewNumber::zero(), KeyId::from(1), p);
            Message::Proposal(Envelope::signed(d, &keys[1])).into_unchecked()
        };
        assert!(proposal(vec![h]).validated(&c).is_some());
        assert!(proposal(vec![h, h]).validated(&c).is_none());
    }

    #[test]
    fn index_must_belong_to_the_signer() {
        arbtest::arbtest(|u| {
            let (keys, c) = keys(u.int_in_range(1..=7)?);
            let signer = u.choose_index(keys.len())?;
            let claimed = u.int_in_range(0..=7u8)?;
            let m = change_view(&keys[signer], claimed, 0, 1);
            assert_eq!(
                m.validated(&c).is_some(),
                usize::from(claimed) == signer,
                "signer = {signer}, claimed = {claimed}"
            );
            Ok(())
        });
    }
}
