use std::collections::{BTreeMap, HashMap};

use dbft_types::{ChangeView, Commit, Header, Height, Payload, PrepareVote, Proposal};
use dbft_types::{ProposalHash, RoundTag, Transaction, TxHash, ViewNumber};
use multisig::{Committee, Envelope, KeyId, Validated};

pub type ProposalEnvelope = Envelope<Payload<Proposal>, Validated>;
pub type PrepareVoteEnvelope = Envelope<Payload<PrepareVote>, Validated>;
pub type CommitEnvelope = Envelope<Payload<Commit>, Validated>;
pub type ChangeViewEnvelope = Envelope<Payload<ChangeView>, Validated>;

/// Everything known about the round at one height.
///
/// Vote slots are keyed by committee index. The proposer's preparation slot
/// is its proposal, all other preparation slots hold prepare votes.
#[derive(Debug, Clone)]
pub struct RoundState {
    height: Height,
    view: ViewNumber,
    primary: KeyId,
    version: u32,
    prev: Header,
    proposal: Option<ProposalEnvelope>,
    preparations: BTreeMap<KeyId, PrepareVoteEnvelope>,
    commits: BTreeMap<KeyId, CommitEnvelope>,
    change_views: BTreeMap<KeyId, ChangeViewEnvelope>,
    last_change_views: BTreeMap<KeyId, ChangeViewEnvelope>,
    transactions: HashMap<TxHash, Transaction>,
    block_sent: bool,
}

impl RoundState {
    /// Fresh state at view 0 of the height after `prev`.
    pub fn new(prev: Header, version: u32, primary: KeyId) -> Self {
        Self {
            height: prev.height() + 1,
            view: ViewNumber::zero(),
            primary,
            version,
            prev,
            proposal: None,
            preparations: BTreeMap::new(),
            commits: BTreeMap::new(),
            change_views: BTreeMap::new(),
            last_change_views: BTreeMap::new(),
            transactions: HashMap::new(),
            block_sent: false,
        }
    }

    /// Move to a higher view of the same height.
    ///
    /// Commits and change views survive, proposal, votes and transactions
    /// are dropped.
    pub fn reset_view(&mut self, view: ViewNumber, primary: KeyId) {
        self.last_change_views = self
            .change_views
            .iter()
            .filter(|(_, e)| e.data().body().new_view() >= view)
            .map(|(i, e)| (*i, e.clone()))
            .collect();
        self.view = view;
        self.primary = primary;
        self.proposal = None;
        self.preparations.clear();
        self.transactions.clear();
        self.block_sent = false;
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn tag(&self) -> RoundTag {
        RoundTag::new(self.height, self.view)
    }

    pub fn primary(&self) -> KeyId {
        self.primary
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn prev(&self) -> &Header {
        &self.prev
    }

    pub fn proposal(&self) -> Option<&ProposalEnvelope> {
        self.proposal.as_ref()
    }

    pub fn has_proposal(&self) -> bool {
        self.proposal.is_some()
    }

    pub fn proposal_hash(&self) -> Option<ProposalHash> {
        self.proposal.as_ref().map(|e| e.commitment())
    }

    pub fn set_proposal(&mut self, e: ProposalEnvelope) {
        self.proposal = Some(e)
    }

    /// The transaction hashes of the proposal, empty without one.
    pub fn tx_hashes(&self) -> &[TxHash] {
        self.proposal
            .as_ref()
            .map(|e| e.data().body().transactions())
            .unwrap_or_default()
    }

    /// The header the proposal describes.
    pub fn header(&self) -> Option<Header> {
        let p = self.proposal.as_ref()?.data().body();
        Some(Header::new(
            p.version(),
            p.prev_hash(),
            self.height,
            p.timestamp(),
            p.nonce(),
            self.primary,
            p.transactions().to_vec(),
        ))
    }

    pub fn preparations(&self) -> &BTreeMap<KeyId, PrepareVoteEnvelope> {
        &self.preparations
    }

    pub fn has_preparation(&self, i: KeyId) -> bool {
        if i == self.primary {
            self.proposal.is_some()
        } else {
            self.preparations.contains_key(&i)
        }
    }

    pub fn add_preparation(&mut self, e: PrepareVoteEnvelope) {
        self.preparations.insert(e.data().validator(), e);
    }

    /// Drop prepare votes that do not vote for the given proposal.
    pub fn retain_preparations(&mut self, h: ProposalHash) {
        self.preparations
            .retain(|_, e| e.data().body().proposal() == h)
    }

    pub fn count_preparations(&self) -> usize {
        usize::from(self.proposal.is_some()) + self.preparations.len()
    }

    /// The hash most prepare votes agree on.
    pub fn most_common_preparation(&self) -> Option<ProposalHash> {
        let mut counts: HashMap<ProposalHash, usize> = HashMap::new();
        for e in self.preparations.values() {
            *counts.entry(e.data().body().proposal()).or_default() += 1
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| bytes(&b.0).cmp(bytes(&a.0))))
            .map(|(h, _)| h)
    }

    pub fn commits(&self) -> &BTreeMap<KeyId, CommitEnvelope> {
        &self.commits
    }

    pub fn commit_of(&self, i: KeyId) -> Option<&CommitEnvelope> {
        self.commits.get(&i)
    }

    pub fn add_commit(&mut self, e: CommitEnvelope) {
        self.commits.insert(e.data().validator(), e);
    }

    /// Drop commits of the current view that do not sign the proposed header.
    ///
    /// Returns the indices of the dropped commits.
    pub fn drop_invalid_commits(&mut self, c: &Committee) -> Vec<KeyId> {
        let Some(header) = self.header() else {
            return Vec::new();
        };
        let hash = header.hash();
        let invalid = self
            .current_commits()
            .filter(|e| {
                let k = c.get_key(e.data().validator());
                !k.is_some_and(|k| k.is_valid(hash.as_ref(), e.data().body().signature()))
            })
            .map(|e| e.data().validator())
            .collect::<Vec<_>>();
        for i in &invalid {
            self.commits.remove(i);
        }
        invalid
    }

    /// Commits of the current view.
    pub fn current_commits(&self) -> impl Iterator<Item = &CommitEnvelope> {
        self.commits
            .values()
            .filter(|e| e.data().view() == self.view)
    }

    pub fn count_committed(&self) -> usize {
        self.commits.len()
    }

    pub fn change_views(&self) -> &BTreeMap<KeyId, ChangeViewEnvelope> {
        &self.change_views
    }

    pub fn last_change_views(&self) -> &BTreeMap<KeyId, ChangeViewEnvelope> {
        &self.last_change_views
    }

    /// The highest view the given member has asked for.
    pub fn requested_view(&self, i: KeyId) -> Option<ViewNumber> {
        self.change_views
            .get(&i)
            .map(|e| e.data().body().new_view())
    }

    pub fn add_change_view(&mut self, e: ChangeViewEnvelope) {
        self.change_views.insert(e.data().validator(), e);
    }

    pub fn add_last_change_view(&mut self, e: ChangeViewEnvelope) {
        self.last_change_views.insert(e.data().validator(), e);
    }

    pub fn transactions(&self) -> &HashMap<TxHash, Transaction> {
        &self.transactions
    }

    pub fn add_transaction(&mut self, t: Transaction) {
        self.transactions.insert(t.hash(), t);
    }

    pub fn has_transaction(&self, h: &TxHash) -> bool {
        self.transactions.contains_key(h)
    }

    /// Hashes of the proposal we have no body for.
    pub fn missing_transactions(&self) -> Vec<TxHash> {
        self.tx_hashes()
            .iter()
            .filter(|h| !self.transactions.contains_key(h))
            .copied()
            .collect()
    }

    /// A proposal is present and every transaction it lists is resolved.
    pub fn all_resolved(&self) -> bool {
        self.proposal.is_some()
            && self
                .tx_hashes()
                .iter()
                .all(|h| self.transactions.contains_key(h))
    }

    /// The resolved transactions in proposal order.
    pub fn ordered_transactions(&self) -> Option<Vec<Transaction>> {
        self.tx_hashes()
            .iter()
            .map(|h| self.transactions.get(h).cloned())
            .collect()
    }

    pub fn block_sent(&self) -> bool {
        self.block_sent
    }

    pub fn set_block_sent(&mut self) {
        self.block_sent = true
    }
}

fn bytes(h: &ProposalHash) -> &[u8] {
    h.as_ref()
}
