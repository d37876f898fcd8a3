mod config;
mod context;
mod metrics;
mod quorum;
mod recovery;

pub mod policy;
pub mod timer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use committable::Commitment;
use dbft_types::{Action, Block, ChangeView, ChangeViewReason, Clock, Commit, Height, Ledger};
use dbft_types::{Mempool, Message, Payload, PrepareVote, Proposal, RecoveryMessage};
use dbft_types::{RecoveryRequest, RecoveryStore, RoundSnapshot, RoundTag, StoreError};
use dbft_types::{SystemClock, Timestamp, Transaction, VerifyResult, ViewNumber};
use multisig::{Certificate, Committee, Envelope, KeyId, Keypair, PublicKey, Unchecked, Validated};
use tracing::{debug, error, info, trace, warn};

use crate::context::{ChangeViewEnvelope, CommitEnvelope, PrepareVoteEnvelope, ProposalEnvelope};
use crate::policy::BlockLimits;
use crate::timer::Deadline;

pub use config::ConsensusConfig;
pub use context::RoundState;
pub use metrics::ConsensusMetrics;
pub use quorum::{Quorum, Role, primary_index, role_of};

/// Errors the engine can not recover from.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsensusError {
    #[error("{0} is not a committee member")]
    NotAMember(PublicKey),

    #[error("own commit at {height}/{view} conflicts with the current block")]
    CommitConflict { height: Height, view: ViewNumber },

    #[error("no proposal to commit to at {height}/{view}")]
    NoProposal { height: Height, view: ViewNumber },

    #[error("failed to persist round snapshot: {0}")]
    Store(#[from] StoreError),
}

/// The dBFT consensus state machine.
///
/// The engine performs no I/O of its own. Inputs are messages, timer expiries
/// and ledger or mempool notifications; outputs are `Action`s the caller must
/// execute in order. Only the round snapshot is written synchronously, before
/// a commit is handed out.
pub struct Consensus {
    /// The public and private key of this node.
    keypair: Keypair,

    /// Our committee index, `None` if we only watch.
    key_id: Option<KeyId>,

    /// The current committee.
    committee: Committee,

    /// Quorum parameters of the current committee.
    quorum: Quorum,

    /// Committee to switch to at the next height.
    next_committee: Option<Committee>,

    config: ConsensusConfig,
    limits: BlockLimits,

    ledger: Arc<dyn Ledger>,
    mempool: Arc<dyn Mempool>,
    store: Box<dyn RecoveryStore>,
    clock: Arc<dyn Clock>,

    /// State of the current round.
    round: RoundState,

    /// The armed timer.
    deadline: Option<Deadline>,

    /// Height of the last message we got from each member.
    last_seen: HashMap<PublicKey, Height>,

    /// Recovery requests answered at this height.
    known_hashes: HashSet<Commitment<Message>>,

    /// Set while processing a recovery message.
    recovering: bool,

    started: bool,

    /// Height and time of the last block we assembled.
    last_block: Option<(Height, Timestamp)>,

    metrics: ConsensusMetrics,
}

impl Consensus {
    /// Create a validator.
    ///
    /// The keypair must belong to a committee member.
    pub fn new<S>(
        keypair: Keypair,
        committee: Committee,
        config: ConsensusConfig,
        ledger: Arc<dyn Ledger>,
        mempool: Arc<dyn Mempool>,
        store: S,
    ) -> Result<Self, ConsensusError>
    where
        S: RecoveryStore + 'static,
    {
        if !committee.contains_key(&keypair.public_key()) {
            return Err(ConsensusError::NotAMember(keypair.public_key()));
        }
        Ok(Self::create(
            keypair,
            committee,
            config,
            ledger,
            mempool,
            Box::new(store),
        ))
    }

    /// Create a node that follows the committee without taking part.
    ///
    /// Should its key be part of a later committee, it becomes a validator
    /// from that height on.
    pub fn observer<S>(
        keypair: Keypair,
        committee: Committee,
        config: ConsensusConfig,
        ledger: Arc<dyn Ledger>,
        mempool: Arc<dyn Mempool>,
        store: S,
    ) -> Self
    where
        S: RecoveryStore + 'static,
    {
        Self::create(
            keypair,
            committee,
            config,
            ledger,
            mempool,
            Box::new(store),
        )
    }

    fn create(
        keypair: Keypair,
        committee: Committee,
        config: ConsensusConfig,
        ledger: Arc<dyn Ledger>,
        mempool: Arc<dyn Mempool>,
        store: Box<dyn RecoveryStore>,
    ) -> Self {
        let key_id = committee.get_index(&keypair.public_key());
        let quorum = Quorum::from(&committee);
        let prev = ledger.current_header();
        let primary = primary_index(prev.height() + 1, ViewNumber::zero(), quorum.n);
        let last_seen = committee
            .parties()
            .map(|k| (*k, prev.height()))
            .collect();
        Self {
            round: RoundState::new(prev, config.block_version, primary),
            limits: BlockLimits::from(&config),
            keypair,
            key_id,
            committee,
            quorum,
            next_committee: None,
            config,
            ledger,
            mempool,
            store,
            clock: Arc::new(SystemClock),
            deadline: None,
            last_seen,
            known_hashes: HashSet::new(),
            recovering: false,
            started: false,
            last_block: None,
            metrics: ConsensusMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, m: ConsensusMetrics) -> Self {
        self.metrics = m;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, c: C) -> Self {
        self.clock = Arc::new(c);
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn key_id(&self) -> Option<KeyId> {
        self.key_id
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn height(&self) -> Height {
        self.round.height()
    }

    pub fn view(&self) -> ViewNumber {
        self.round.view()
    }

    pub fn round(&self) -> &RoundState {
        &self.round
    }

    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    pub fn role(&self) -> Role {
        role_of(self.key_id, self.round.primary())
    }

    pub fn is_watch_only(&self) -> bool {
        self.key_id.is_none()
    }

    /// Stage a committee to take over at the next height.
    pub fn set_next_committee(&mut self, c: Committee) {
        self.next_committee = Some(c)
    }

    /// Our commit slot is filled.
    pub fn is_commit_sent(&self) -> bool {
        self.key_id
            .is_some_and(|i| self.round.commit_of(i).is_some())
    }

    /// We asked to move past the current view.
    pub fn is_view_changing(&self) -> bool {
        self.key_id
            .and_then(|i| self.round.requested_view(i))
            .is_some_and(|v| v > self.round.view())
    }

    /// Number of members we have not heard from recently.
    pub fn count_failed(&self) -> usize {
        let h = self.round.height() - 1;
        self.committee
            .parties()
            .filter(|k| self.last_seen.get(k).is_none_or(|s| *s < h))
            .count()
    }

    fn is_primary(&self) -> bool {
        self.key_id == Some(self.round.primary())
    }

    fn is_backup(&self) -> bool {
        self.key_id.is_some_and(|i| i != self.round.primary())
    }

    fn response_sent(&self) -> bool {
        self.key_id.is_some_and(|i| self.round.has_preparation(i))
    }

    fn more_than_f_committed_or_lost(&self) -> bool {
        self.round.count_committed() + self.count_failed() > self.quorum.f
    }

    fn not_accepting_due_to_view_changing(&self) -> bool {
        self.is_view_changing() && !self.more_than_f_committed_or_lost()
    }

    /// (Re-)start consensus.
    ///
    /// A snapshot of a round in which we already committed is restored and the
    /// commit sent again. Otherwise we start at view 0 and ask peers what they
    /// know about the current round.
    pub fn start(&mut self) -> Result<Vec<Action>, ConsensusError> {
        if self.started {
            return Ok(Vec::new());
        }
        self.started = true;

        info!(node = %self.public_key(), height = %self.round.height(), "start consensus");

        let mut actions = Vec::new();

        if !self.config.ignore_recovery_logs {
            match self.store.load() {
                Ok(Some(s)) => {
                    if self.restore(s) && self.is_commit_sent() {
                        actions.extend(self.check_preparations()?);
                        return Ok(actions);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(node = %self.public_key(), %err, "failed to load round snapshot")
                }
            }
        }

        actions.extend(self.initialize(ViewNumber::zero()));

        if let Some(me) = self.key_id {
            actions.push(Action::Broadcast(self.recovery_request(me)))
        }

        Ok(actions)
    }

    /// Main entry point to process a `Message`.
    pub fn handle_message(&mut self, m: Message<Unchecked>) -> Result<Vec<Action>, ConsensusError> {
        if !self.started {
            return Ok(Vec::new());
        }
        let Some(m) = self.validate(m) else {
            return Ok(Vec::new());
        };
        let actions = self.dispatch(m)?;

        trace!(
            node    = %self.public_key(),
            height  = %self.round.height(),
            view    = %self.round.view(),
            actions = ?actions.iter().map(|a| a.to_string()).collect::<Vec<_>>()
        );

        Ok(actions)
    }

    /// The armed timer expired.
    pub fn timeout(&mut self, tag: RoundTag) -> Result<Vec<Action>, ConsensusError> {
        if !self.started || self.key_id.is_none() || self.round.block_sent() {
            return Ok(Vec::new());
        }

        if tag != self.round.tag() {
            debug!(node = %self.public_key(), %tag, round = %self.round.tag(), "stale timeout");
            return Ok(Vec::new());
        }

        if self.is_primary() && !self.round.has_proposal() {
            return self.send_proposal();
        }

        if let Some(me) = self.key_id.filter(|_| self.is_commit_sent()) {
            info!(
                node   = %self.public_key(),
                height = %self.round.height(),
                view   = %self.round.view(),
                "sending recovery message to resend commit"
            );
            let m = self.recovery_message(me);
            let t = self.reset_timer(timer::backoff(self.config.block_time(), 1));
            return Ok(vec![Action::Broadcast(m), t]);
        }

        let reason = if self.round.has_proposal() && !self.round.all_resolved() {
            ChangeViewReason::TxNotFound
        } else {
            ChangeViewReason::Timeout
        };

        Ok(self.request_change_view(reason))
    }

    /// A block has been appended to the ledger.
    ///
    /// Starts the next height at view 0.
    pub fn block_persisted(&mut self, b: &Block) -> Result<Vec<Action>, ConsensusError> {
        if !self.started {
            return Ok(Vec::new());
        }

        if self.ledger.current_height() < self.round.height() {
            debug!(
                node   = %self.public_key(),
                block  = %b,
                height = %self.round.height(),
                "ledger has not reached the round height"
            );
            return Ok(Vec::new());
        }

        info!(
            node   = %self.public_key(),
            height = %b.height(),
            hash   = %b.hash(),
            txs    = %b.transactions().len(),
            "block persisted"
        );

        if b.height() == self.round.height() {
            let d = b.header().timestamp().since(self.round.prev().timestamp());
            self.metrics.block_time.add_point(d.as_secs_f64());
        }

        self.known_hashes.clear();

        Ok(self.initialize(ViewNumber::zero()))
    }

    /// A transaction arrived in the mempool.
    pub fn mempool_transaction(&mut self, tx: Transaction) -> Result<Vec<Action>, ConsensusError> {
        if !self.started
            || !self.is_backup()
            || self.not_accepting_due_to_view_changing()
            || !self.round.has_proposal()
            || self.response_sent()
            || self.round.block_sent()
        {
            return Ok(Vec::new());
        }

        let h = tx.hash();

        if self.round.has_transaction(&h) || !self.round.tx_hashes().contains(&h) {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        self.add_transaction(tx, true, &mut actions)?;
        Ok(actions)
    }

    /// Height, sender and signature checks.
    ///
    /// Records when we last heard from the sender.
    fn validate(&mut self, m: Message<Unchecked>) -> Option<Message> {
        if self.round.block_sent() {
            return None;
        }

        if m.height() != self.round.height() {
            if m.height() > self.round.height() {
                warn!(
                    node     = %self.public_key(),
                    expected = %m.height(),
                    current  = %(self.round.height() - 1),
                    "chain is behind"
                );
            }
            self.metrics.dropped_messages.add(1);
            return None;
        }

        let Some(m) = m.validated(&self.committee) else {
            self.metrics.dropped_messages.add(1);
            return None;
        };

        self.last_seen.insert(*m.signing_key(), m.height());

        Some(m)
    }

    fn dispatch(&mut self, m: Message) -> Result<Vec<Action>, ConsensusError> {
        debug!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %self.round.view(),
            msg    = %m,
            "handle message"
        );

        let hash = m.hash();

        match m {
            Message::ChangeView(e) => Ok(self.handle_change_view(e, hash)),
            Message::Proposal(e) => self.handle_proposal(e),
            Message::PrepareVote(e) => self.handle_prepare_vote(e),
            Message::Commit(e) => Ok(self.handle_commit(e)),
            Message::RecoveryRequest(e) => {
                Ok(self.handle_recovery_request(e.data().validator(), hash))
            }
            Message::Recovery(e) => {
                self.recovering = true;
                let actions = self.handle_recovery_message(e);
                self.recovering = false;
                actions
            }
        }
    }

    /// Handle a change view request.
    ///
    /// A request for a view we are already in tells us the sender is behind,
    /// which we treat like a recovery request. The change view ledger only
    /// ever moves up per sender.
    fn handle_change_view(
        &mut self,
        e: ChangeViewEnvelope,
        hash: Commitment<Message>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        let i = e.data().validator();
        let new_view = e.data().body().new_view();

        if new_view <= self.round.view() {
            actions.extend(self.handle_recovery_request(i, hash));
        }

        if self.is_commit_sent() {
            return actions;
        }

        if new_view <= self.round.requested_view(i).unwrap_or_default() {
            return actions;
        }

        info!(
            node     = %self.public_key(),
            height   = %self.round.height(),
            view     = %e.data().view(),
            index    = %i,
            new_view = %new_view,
            reason   = %e.data().body().reason(),
            "change view received"
        );

        self.round.add_change_view(e);
        actions.extend(self.check_expected_view(new_view));
        actions
    }

    /// Handle the proposal of the current primary.
    fn handle_proposal(&mut self, e: ProposalEnvelope) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();

        if self.round.has_proposal() || self.not_accepting_due_to_view_changing() {
            return Ok(actions);
        }

        let d = e.data();
        let p = d.body();

        if d.validator() != self.round.primary() || d.view() != self.round.view() {
            debug!(
                node    = %self.public_key(),
                index   = %d.validator(),
                view    = %d.view(),
                primary = %self.round.primary(),
                "proposal not from the current primary"
            );
            return Ok(actions);
        }

        if p.version() != self.round.version() || p.prev_hash() != self.round.prev().hash() {
            warn!(
                node    = %self.public_key(),
                version = %p.version(),
                prev    = %p.prev_hash(),
                "proposal does not extend our chain"
            );
            return Ok(actions);
        }

        if p.transactions().len() > self.limits.max_transactions {
            warn!(
                node = %self.public_key(),
                txs  = %p.transactions().len(),
                max  = %self.limits.max_transactions,
                "proposal has too many transactions"
            );
            return Ok(actions);
        }

        let now = self.clock.now();
        let latest = now + self.config.block_time() * 8;

        if p.timestamp() <= self.round.prev().timestamp() || p.timestamp() > latest {
            warn!(
                node      = %self.public_key(),
                timestamp = %*p.timestamp(),
                prev      = %*self.round.prev().timestamp(),
                "timestamp incorrect"
            );
            return Ok(actions);
        }

        if p.transactions().iter().any(|h| self.ledger.contains_transaction(h)) {
            warn!(node = %self.public_key(), "invalid proposal: transaction already exists");
            return Ok(actions);
        }

        info!(
            node   = %self.public_key(),
            height = %d.height(),
            view   = %d.view(),
            index  = %d.validator(),
            txs    = %p.transactions().len(),
            "proposal received"
        );

        actions.extend(self.extend_timer(2));

        self.round.retain_preparations(e.commitment());
        self.round.set_proposal(e);

        // Commits received before the proposal are checked against its header.
        self.drop_invalid_commits();

        if self.round.tx_hashes().is_empty() {
            self.check_prepare_response(&mut actions)?;
            return Ok(actions);
        }

        let hashes = self.round.tx_hashes().to_vec();
        let mut unverified = Vec::new();

        for h in &hashes {
            if let Some(tx) = self.mempool.get_verified(h) {
                if !self.add_transaction(tx, false, &mut actions)? {
                    return Ok(actions);
                }
            } else if let Some(tx) = self.mempool.get(h) {
                unverified.push(tx)
            }
        }

        for tx in unverified {
            if !self.add_transaction(tx, true, &mut actions)? {
                return Ok(actions);
            }
        }

        let missing = self.round.missing_transactions();
        if !missing.is_empty() {
            debug!(node = %self.public_key(), missing = %missing.len(), "requesting transactions");
            actions.push(Action::RequestTransactions(missing))
        }

        Ok(actions)
    }

    /// Handle a vote for the proposal of the current view.
    fn handle_prepare_vote(
        &mut self,
        e: PrepareVoteEnvelope,
    ) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();

        let i = e.data().validator();

        if e.data().view() != self.round.view() || i == self.round.primary() {
            return Ok(actions);
        }

        if self.round.has_preparation(i) || self.not_accepting_due_to_view_changing() {
            return Ok(actions);
        }

        if let Some(h) = self.round.proposal_hash() {
            if e.data().body().proposal() != h {
                debug!(node = %self.public_key(), index = %i, "prepare vote for other proposal");
                return Ok(actions);
            }
        }

        actions.extend(self.extend_timer(2));

        info!(
            node   = %self.public_key(),
            height = %e.data().height(),
            view   = %e.data().view(),
            index  = %i,
            "prepare vote received"
        );

        self.round.add_preparation(e);

        if self.key_id.is_none() || self.is_commit_sent() {
            return Ok(actions);
        }

        if self.round.has_proposal() {
            actions.extend(self.check_preparations()?);
        }

        Ok(actions)
    }

    /// Handle a commit of some member.
    ///
    /// Commits of other views are kept, they count once we get there.
    fn handle_commit(&mut self, e: CommitEnvelope) -> Vec<Action> {
        let mut actions = Vec::new();

        let i = e.data().validator();

        if let Some(existing) = self.round.commit_of(i) {
            if existing.commitment() != e.commitment() {
                warn!(
                    node     = %self.public_key(),
                    height   = %e.data().height(),
                    index    = %i,
                    view     = %e.data().view(),
                    existing = %existing.data().view(),
                    "rejected commit"
                );
            }
            return actions;
        }

        if e.data().view() != self.round.view() {
            self.round.add_commit(e);
            return actions;
        }

        actions.extend(self.extend_timer(4));

        info!(
            node   = %self.public_key(),
            height = %e.data().height(),
            view   = %e.data().view(),
            index  = %i,
            nc     = %self.round.count_committed(),
            nf     = %self.count_failed(),
            "commit received"
        );

        let Some(header) = self.round.header() else {
            self.round.add_commit(e);
            return actions;
        };

        let valid = self
            .committee
            .get_key(i)
            .is_some_and(|k| k.is_valid(header.hash().as_ref(), e.data().body().signature()));

        if valid {
            self.round.add_commit(e);
            actions.extend(self.check_commits());
        } else {
            warn!(node = %self.public_key(), index = %i, "invalid block signature");
        }

        actions
    }

    /// Answer a recovery request.
    ///
    /// Every request is answered at most once, and unless we committed
    /// ourselves, only by the `f + 1` members following the requester.
    fn handle_recovery_request(
        &mut self,
        requester: KeyId,
        hash: Commitment<Message>,
    ) -> Vec<Action> {
        if !self.known_hashes.insert(hash) {
            return Vec::new();
        }

        debug!(
            node   = %self.public_key(),
            height = %self.round.height(),
            index  = %requester,
            "recovery request received"
        );

        let Some(me) = self.key_id else {
            return Vec::new();
        };

        if !self.is_commit_sent() {
            let n = self.quorum.n;
            let (r, me) = (usize::from(requester), usize::from(me));
            let chosen = (1..=self.quorum.f + 1).any(|i| (r + i) % n == me);
            if !chosen {
                return Vec::new();
            }
        }

        info!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %self.round.view(),
            to     = %requester,
            "sending recovery message"
        );

        vec![Action::SendTo(requester, self.recovery_message(me))]
    }

    /// Replay what a peer knows about the round.
    ///
    /// Every reconstructed message passes the same checks as one received
    /// from the network.
    fn handle_recovery_message(
        &mut self,
        e: Envelope<Payload<RecoveryMessage>, Validated>,
    ) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();

        let (h, v) = (e.data().height(), e.data().view());
        let msg = e.data().body();

        info!(
            node   = %self.public_key(),
            height = %h,
            view   = %v,
            index  = %e.data().validator(),
            "recovery message received"
        );

        let mut change_views = (0, 0);
        let mut proposals = (0, 0);
        let mut votes = (0, 0);
        let mut commits = (0, 0);

        if v > self.round.view() && !self.is_commit_sent() {
            let ms = msg.change_view_messages(h, &self.committee);
            change_views.1 = ms.len();
            for m in ms {
                if let Some(m) = self.validate(m) {
                    change_views.0 += 1;
                    actions.extend(self.dispatch(m)?)
                }
            }
        }

        if v == self.round.view()
            && !self.not_accepting_due_to_view_changing()
            && !self.is_commit_sent()
        {
            let primary = self.round.primary();
            if !self.round.has_proposal() {
                if let Some(m) = msg.proposal_message(h, v, primary, &self.committee) {
                    proposals.1 = 1;
                    if let Some(m) = self.validate(m) {
                        proposals.0 = 1;
                        actions.extend(self.dispatch(m)?)
                    }
                } else if self.is_primary() {
                    actions.extend(self.send_proposal()?)
                }
            }
            let local = self.round.proposal_hash();
            let ms = msg.prepare_vote_messages(h, v, primary, local, &self.committee);
            votes.1 = ms.len();
            for m in ms {
                if let Some(m) = self.validate(m) {
                    votes.0 += 1;
                    actions.extend(self.dispatch(m)?)
                }
            }
        }

        if v <= self.round.view() {
            let ms = msg.commit_messages(h, &self.committee);
            commits.1 = ms.len();
            for m in ms {
                if let Some(m) = self.validate(m) {
                    commits.0 += 1;
                    actions.extend(self.dispatch(m)?)
                }
            }
        }

        info!(
            node         = %self.public_key(),
            change_views = %format!("{}/{}", change_views.0, change_views.1),
            proposals    = %format!("{}/{}", proposals.0, proposals.1),
            votes        = %format!("{}/{}", votes.0, votes.1),
            commits      = %format!("{}/{}", commits.0, commits.1),
            "recovery finished"
        );

        Ok(actions)
    }

    /// Move to `view` once a quorum asked for it (or a higher one).
    fn check_expected_view(&mut self, view: ViewNumber) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.round.view() >= view {
            return actions;
        }

        let n = self
            .round
            .change_views()
            .values()
            .filter(|e| e.data().body().new_view() >= view)
            .count();

        if n < self.quorum.m {
            return actions;
        }

        if let Some(me) = self.key_id {
            if self.round.requested_view(me).is_none_or(|v| v < view) {
                let m = self.change_view(me, ChangeViewReason::ChangeAgreement);
                actions.push(Action::Broadcast(m))
            }
        }

        actions.extend(self.initialize(view));
        actions
    }

    /// Once the proposal is complete, vote for it unless it breaks the block limits.
    ///
    /// Returns `false` if a view change has been requested instead.
    fn check_prepare_response(&mut self, actions: &mut Vec<Action>) -> Result<bool, ConsensusError> {
        if !self.round.all_resolved() {
            return Ok(true);
        }

        // A primary that recovered its own proposal acts as a backup but does not vote.
        let Some(me) = self.key_id.filter(|i| *i != self.round.primary()) else {
            return Ok(true);
        };

        let size = policy::expected_block_size(self.quorum.m, self.round.transactions().values());

        if size > self.limits.max_size {
            warn!(
                node   = %self.public_key(),
                height = %self.round.height(),
                size   = %size,
                max    = %self.limits.max_size,
                "rejected block: size exceeds policy"
            );
            actions.extend(self.request_change_view(ChangeViewReason::BlockRejectedByPolicy));
            return Ok(false);
        }

        let fee = policy::expected_system_fee(self.round.transactions().values());

        if fee > self.limits.max_system_fee {
            warn!(
                node   = %self.public_key(),
                height = %self.round.height(),
                fee    = %fee,
                max    = %self.limits.max_system_fee,
                "rejected block: system fee exceeds policy"
            );
            actions.extend(self.request_change_view(ChangeViewReason::BlockRejectedByPolicy));
            return Ok(false);
        }

        actions.extend(self.extend_timer(2));

        let Some(hash) = self.round.proposal_hash() else {
            return Ok(true);
        };

        info!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %self.round.view(),
            "sending prepare vote"
        );

        let d = Payload::new(self.round.height(), self.round.view(), me, PrepareVote::new(hash));
        let e = Envelope::signed(d, &self.keypair);
        self.round.add_preparation(e.clone());
        actions.push(Action::Broadcast(Message::PrepareVote(e)));
        actions.extend(self.check_preparations()?);

        Ok(true)
    }

    /// Commit once a quorum prepared and all transactions are known.
    fn check_preparations(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();

        if self.round.count_preparations() < self.quorum.m || !self.round.all_resolved() {
            return Ok(actions);
        }

        let Some(me) = self.key_id else {
            return Ok(actions);
        };

        let commit = self.make_commit(me)?;

        info!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %self.round.view(),
            "sending commit"
        );

        self.save()?;

        actions.push(Action::Broadcast(Message::Commit(commit)));
        actions.push(self.reset_timer(self.config.block_time()));
        actions.extend(self.check_commits());

        Ok(actions)
    }

    /// Assemble the block once a quorum committed in the current view.
    fn check_commits(&mut self) -> Vec<Action> {
        self.drop_invalid_commits();

        if self.round.current_commits().count() < self.quorum.m || !self.round.all_resolved() {
            return Vec::new();
        }

        let (Some(header), Some(txs)) = (self.round.header(), self.round.ordered_transactions())
        else {
            return Vec::new();
        };

        let sigs = self
            .round
            .current_commits()
            .take(self.quorum.m)
            .map(|e| (e.data().validator(), *e.data().body().signature()))
            .collect::<Vec<_>>();

        let block = Block::new(Certificate::new(header, sigs), txs);

        self.round.set_block_sent();
        self.last_block = Some((self.round.height(), self.clock.now()));
        self.metrics.committed_blocks.add(1);
        self.metrics.block_transactions.set(block.transactions().len());

        info!(
            node   = %self.public_key(),
            height = %block.height(),
            hash   = %block.hash(),
            txs    = %block.transactions().len(),
            "sending block"
        );

        vec![Action::PersistBlock(block)]
    }

    /// Reset the round at the given view and arm the timer.
    fn initialize(&mut self, view: ViewNumber) -> Vec<Action> {
        if view.is_zero() {
            self.reset_height()
        } else {
            let p = primary_index(self.round.height(), view, self.quorum.n);
            let prev = self.round.primary();
            self.round.reset_view(view, p);
            self.metrics.view_changes.add(1);
            warn!(
                node    = %self.public_key(),
                height  = %self.round.height(),
                view    = %view,
                primary = %prev,
                "view changed"
            );
        }

        self.metrics.height.set(self.round.height().u32() as usize);
        self.metrics.view.set(view.u8().into());

        info!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %view,
            index  = ?self.key_id,
            role   = %self.role(),
            "initialize"
        );

        if self.key_id.is_none() {
            return Vec::new();
        }

        self.last_seen.insert(self.public_key(), self.round.height());

        let bt = self.config.block_time();

        let delay = if self.is_primary() && !self.recovering {
            let now = self.clock.now();
            let elapsed = self
                .last_block
                .filter(|(h, _)| *h + 1 == self.round.height())
                .map(|(_, t)| now.since(t));
            timer::proposer_delay(bt, elapsed)
        } else {
            timer::view_timeout(bt, view)
        };

        vec![self.reset_timer(delay)]
    }

    /// Begin the height after the ledger tip.
    fn reset_height(&mut self) {
        let mut changed = false;

        if let Some(c) = self.next_committee.take() {
            if c != self.committee {
                self.key_id = c.get_index(&self.public_key());
                self.quorum = Quorum::from(&c);
                self.committee = c;
                changed = true;
                info!(
                    node  = %self.public_key(),
                    size  = %self.quorum.n,
                    index = ?self.key_id,
                    "committee changed"
                );
            }
        }

        let prev = self.ledger.current_header();
        let height = prev.height();
        let primary = primary_index(height + 1, ViewNumber::zero(), self.quorum.n);

        if changed {
            let mut last_seen = HashMap::new();
            for k in self.committee.parties() {
                let h = self.last_seen.get(k).copied().unwrap_or(height);
                last_seen.insert(*k, h);
            }
            self.last_seen = last_seen;
        }

        self.round = RoundState::new(prev, self.config.block_version, primary);
    }

    /// Ask to move to the next view.
    ///
    /// If too many members already committed or went silent, a change view
    /// can not succeed and we ask for recovery instead.
    fn request_change_view(&mut self, reason: ChangeViewReason) -> Vec<Action> {
        let Some(me) = self.key_id else {
            return Vec::new();
        };

        let expected = self.round.view().next();
        let delay = timer::view_timeout(self.config.block_time(), expected);
        let mut actions = vec![self.reset_timer(delay)];

        if self.more_than_f_committed_or_lost() {
            info!(
                node   = %self.public_key(),
                height = %self.round.height(),
                view   = %self.round.view(),
                nc     = %self.round.count_committed(),
                nf     = %self.count_failed(),
                "sending recovery request"
            );
            actions.push(Action::Broadcast(self.recovery_request(me)));
        } else {
            info!(
                node   = %self.public_key(),
                height = %self.round.height(),
                view   = %self.round.view(),
                nv     = %expected,
                nc     = %self.round.count_committed(),
                nf     = %self.count_failed(),
                reason = %reason,
                "sending change view"
            );
            actions.push(Action::Broadcast(self.change_view(me, reason)));
            actions.extend(self.check_expected_view(expected));
        }

        actions
    }

    /// Propose a block from the best transactions of the mempool.
    fn send_proposal(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let Some(me) = self.key_id else {
            return Ok(Vec::new());
        };

        let txs = policy::select_batch(
            self.mempool.verified_transactions(),
            &self.limits,
            self.quorum.m,
        );

        let now = self.clock.now();
        let timestamp = now.max(self.round.prev().timestamp() + Duration::from_millis(1));
        let hashes = txs.iter().map(|t| t.hash()).collect::<Vec<_>>();

        let p = Proposal::new(
            self.round.version(),
            self.round.prev().hash(),
            timestamp,
            rand::random(),
            hashes.clone(),
        );

        info!(
            node   = %self.public_key(),
            height = %self.round.height(),
            view   = %self.round.view(),
            txs    = %hashes.len(),
            "sending proposal"
        );

        let d = Payload::new(self.round.height(), self.round.view(), me, p);
        let e = Envelope::signed(d, &self.keypair);
        self.round.set_proposal(e.clone());
        self.drop_invalid_commits();
        for t in txs {
            self.round.add_transaction(t)
        }

        let mut actions = vec![Action::Broadcast(Message::Proposal(e))];

        if self.quorum.n == 1 {
            actions.extend(self.check_preparations()?)
        }

        if !hashes.is_empty() {
            actions.push(Action::AnnounceTransactions(hashes))
        }

        let delay = timer::proposal_timeout(self.config.block_time(), self.round.view());
        actions.push(self.reset_timer(delay));

        Ok(actions)
    }

    /// Resolve a transaction of the proposal.
    ///
    /// Returns `false` if the transaction was rejected and a view change requested.
    fn add_transaction(
        &mut self,
        tx: Transaction,
        verify: bool,
        actions: &mut Vec<Action>,
    ) -> Result<bool, ConsensusError> {
        if verify {
            let r = self.mempool.reverify(&tx);
            if !r.is_ok() {
                warn!(node = %self.public_key(), tx = %tx.hash(), result = ?r, "rejected transaction");
                let reason = if r == VerifyResult::PolicyFail {
                    ChangeViewReason::TxRejectedByPolicy
                } else {
                    ChangeViewReason::TxInvalid
                };
                actions.extend(self.request_change_view(reason));
                return Ok(false);
            }
        }
        self.round.add_transaction(tx);
        self.check_prepare_response(actions)
    }

    /// Sign our commit for the current block.
    ///
    /// A commit once made is never replaced. Asking for one that differs from
    /// the commit we already hold is a safety violation.
    fn make_commit(&mut self, me: KeyId) -> Result<CommitEnvelope, ConsensusError> {
        let (height, view) = (self.round.height(), self.round.view());

        let Some(header) = self.round.header() else {
            return Err(ConsensusError::NoProposal { height, view });
        };

        let hash = header.hash();

        if let Some(c) = self.round.commit_of(me) {
            let pk = self.public_key();
            if c.data().view() == view && pk.is_valid(hash.as_ref(), c.data().body().signature()) {
                return Ok(c.clone());
            }
            error!(
                node     = %pk,
                height   = %height,
                view     = %view,
                existing = %c.data().view(),
                "conflicting own commit"
            );
            return Err(ConsensusError::CommitConflict { height, view });
        }

        let s = self.keypair.sign_deterministically(hash.as_ref());
        let d = Payload::new(height, view, me, Commit::new(s));
        let e = Envelope::signed(d, &self.keypair);
        self.round.add_commit(e.clone());
        Ok(e)
    }

    fn change_view(&mut self, me: KeyId, reason: ChangeViewReason) -> Message {
        let b = ChangeView::new(self.round.view().next(), reason, self.clock.now());
        let d = Payload::new(self.round.height(), self.round.view(), me, b);
        let e = Envelope::signed(d, &self.keypair);
        self.round.add_change_view(e.clone());
        Message::ChangeView(e)
    }

    fn recovery_request(&self, me: KeyId) -> Message {
        let b = RecoveryRequest::new(self.clock.now());
        let d = Payload::new(self.round.height(), self.round.view(), me, b);
        Message::RecoveryRequest(Envelope::signed(d, &self.keypair))
    }

    fn recovery_message(&self, me: KeyId) -> Message {
        let b = recovery::assemble(&self.round, self.quorum.m, self.is_commit_sent());
        let d = Payload::new(self.round.height(), self.round.view(), me, b);
        self.metrics.recovery_messages_sent.add(1);
        Message::Recovery(Envelope::signed(d, &self.keypair))
    }

    fn reset_timer(&mut self, d: Duration) -> Action {
        let tag = self.round.tag();
        self.deadline = Some(Deadline::new(tag, self.clock.now(), d));
        Action::ResetTimer(tag, d)
    }

    /// Grant more time for a sign of progress.
    fn extend_timer(&mut self, k: u32) -> Option<Action> {
        if self.key_id.is_none() || self.is_view_changing() || self.is_commit_sent() {
            return None;
        }
        let d = self.deadline?;
        let add = timer::extension(self.config.block_time(), k, self.quorum.m);
        let next = d.extended(self.clock.now(), add)?;
        Some(self.reset_timer(next))
    }

    /// Forget commits of the current view that sign a different block.
    fn drop_invalid_commits(&mut self) {
        for i in self.round.drop_invalid_commits(&self.committee) {
            warn!(node = %self.public_key(), index = %i, "dropping commit for other block");
        }
    }

    fn save(&mut self) -> Result<(), ConsensusError> {
        let s = self.snapshot();
        self.store.save(&s).map_err(|err| {
            error!(node = %self.public_key(), %err, "failed to persist round snapshot");
            ConsensusError::Store(err)
        })
    }

    fn snapshot(&self) -> RoundSnapshot {
        let r = &self.round;
        RoundSnapshot {
            height: r.height(),
            view: r.view(),
            proposal: r.proposal().cloned().map(Envelope::into_unchecked),
            preparations: r
                .preparations()
                .values()
                .cloned()
                .map(Envelope::into_unchecked)
                .collect(),
            commits: r
                .commits()
                .values()
                .cloned()
                .map(Envelope::into_unchecked)
                .collect(),
            change_views: r
                .change_views()
                .values()
                .cloned()
                .map(Envelope::into_unchecked)
                .collect(),
            last_change_views: r
                .last_change_views()
                .values()
                .cloned()
                .map(Envelope::into_unchecked)
                .collect(),
            transactions: r.transactions().values().cloned().collect(),
        }
    }

    /// Rebuild the round from a snapshot of the current height.
    fn restore(&mut self, s: RoundSnapshot) -> bool {
        if s.height != self.round.height() {
            info!(
                node     = %self.public_key(),
                snapshot = %s.height,
                height   = %self.round.height(),
                "ignoring round snapshot of other height"
            );
            return false;
        }

        let c = self.committee.clone();

        if !s.view.is_zero() {
            let p = primary_index(s.height, s.view, self.quorum.n);
            self.round.reset_view(s.view, p);
        }
        if let Some(e) = s.proposal.and_then(|e| e.validated(&c)) {
            self.round.set_proposal(e)
        }
        for e in s.preparations.into_iter().filter_map(|e| e.validated(&c)) {
            self.round.add_preparation(e)
        }
        for e in s.commits.into_iter().filter_map(|e| e.validated(&c)) {
            self.round.add_commit(e)
        }
        for e in s.change_views.into_iter().filter_map(|e| e.validated(&c)) {
            self.round.add_change_view(e)
        }
        for e in s.last_change_views.into_iter().filter_map(|e| e.validated(&c)) {
            self.round.add_last_change_view(e)
        }
        for t in s.transactions {
            self.round.add_transaction(t)
        }
        self.drop_invalid_commits();

        info!(
            node        = %self.public_key(),
            height      = %self.round.height(),
            view        = %self.round.view(),
            commit_sent = %self.is_commit_sent(),
            "restored round snapshot"
        );

        true
    }
}
