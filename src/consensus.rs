//! The consensus state machine: role transitions, elections, log
//! replication, the commitment rule, and the apply loop. This is the one
//! module every other piece of the crate exists to serve.
//!
//! Election and replication live in one core rather than two cooperating
//! structs, since pre-vote and the snapshot path both straddle election and
//! replication state — a pre-vote response can trigger a real election,
//! which immediately needs the log's last index/term, and an `AppendEntries`
//! whose `prev_log_index` precedes the log's first index has to redirect
//! into the snapshot path rather than just reject. `tick` and
//! `handle_message` are the two event entry points, `propose` is the
//! client-facing third; all three return an outbox of messages to send.

use crate::config::Config;
use crate::error::ConsensusError;
use crate::log_store::LogStore;
use crate::message::Message;
use crate::meta_store::{MetaStore, PersistentMeta};
use crate::peer::Peer;
use crate::snapshot::SnapshotStaging;
use crate::state_machine::StateMachine;
use crate::timer::Ticker;
use crate::types::{Entry, EntryKind, LogIndex, NodeId, RoleTag, Term};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Outbound messages produced by a single step.
pub type Outbox = Vec<(NodeId, Message)>;

/// What a single `tick` / `handle_message` / `propose` call produced:
/// messages to send, and entries newly delivered to the state machine.
#[derive(Debug, Default)]
pub struct StepResult {
    pub outbox: Outbox,
    pub applied: Vec<Entry>,
}

/// The role a node occupies, carrying exactly the state that role needs.
/// Tagged variant rather than subclassing; peers live only on `Leader`.
enum Role {
    Follower,
    PreCandidate { votes: HashSet<NodeId> },
    Candidate { votes: HashSet<NodeId> },
    Leader { peers: HashMap<NodeId, Peer> },
}

pub struct ConsensusCore {
    node_id: NodeId,
    config: Config,
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Box<dyn LogStore>,
    meta: Box<dyn MetaStore>,
    sm: Box<dyn StateMachine>,
    commit_index: LogIndex,
    applied_index: LogIndex,
    ticker: Ticker,
    /// At most one `ConfigChange` may be uncommitted at a time.
    pending_config_change: bool,
    snapshot_staging: SnapshotStaging,
    applied_buffer: Vec<Entry>,
    /// Set on `StorageFailure`: the node stops participating and must be
    /// externally restarted. Every public entry point becomes a no-op.
    halted: bool,
}

impl ConsensusCore {
    pub fn new(
        node_id: NodeId,
        config: Config,
        log: Box<dyn LogStore>,
        meta: Box<dyn MetaStore>,
        sm: Box<dyn StateMachine>,
    ) -> Self {
        let persisted = meta.load();
        let (commit_index, applied_index) = log.commit_meta();
        let ticker = Ticker::new(config.base_election_timeout, config.heartbeat_interval);
        let mut core = Self {
            node_id,
            config,
            role: Role::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            leader_id: None,
            log,
            meta,
            sm,
            commit_index,
            applied_index: applied_index.min(commit_index),
            ticker,
            pending_config_change: false,
            snapshot_staging: SnapshotStaging::new(),
            applied_buffer: Vec::new(),
            halted: false,
        };
        core.recompute_pending_config_change();
        core
    }

    // ---- accessors -----------------------------------------------------

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn role_tag(&self) -> RoleTag {
        match &self.role {
            Role::Follower => RoleTag::Follower,
            Role::PreCandidate { .. } => RoleTag::PreCandidate,
            Role::Candidate { .. } => RoleTag::Candidate,
            Role::Leader { .. } => RoleTag::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn match_index_of(&self, peer: &NodeId) -> Option<LogIndex> {
        match &self.role {
            Role::Leader { peers } => peers.get(peer).map(|p| p.match_index),
            _ => None,
        }
    }

    // ---- public entry points -------------------------------------------

    /// Advance the election/heartbeat timers by one tick.
    pub fn tick(&mut self) -> StepResult {
        if self.halted {
            return StepResult::default();
        }
        let (election_fired, heartbeat_fired) = self.ticker.tick();
        let outbox = match &self.role {
            Role::Leader { .. } => {
                if heartbeat_fired {
                    self.broadcast_append_entries()
                } else {
                    Vec::new()
                }
            }
            _ => {
                if election_fired {
                    self.start_prevote()
                } else {
                    Vec::new()
                }
            }
        };
        self.finish_step(outbox)
    }

    /// Dispatch one inbound message.
    pub fn handle_message(&mut self, from: NodeId, msg: Message) -> StepResult {
        if self.halted {
            return StepResult::default();
        }

        // Pre-vote never advances the local term.
        let is_pre_vote = matches!(
            &msg,
            Message::RequestVote { is_pre_vote: true, .. } | Message::RequestVoteResp { is_pre_vote: true, .. }
        );
        if !is_pre_vote && msg.term() > self.current_term {
            self.demote_to_follower(msg.term());
        }

        let outbox = match msg {
            Message::RequestVote { term, candidate_id, last_log_index, last_log_term, is_pre_vote } => {
                self.handle_request_vote(from, term, candidate_id, last_log_index, last_log_term, is_pre_vote)
            }
            Message::RequestVoteResp { term, vote_granted, leader_id: _, is_pre_vote } => {
                self.handle_request_vote_resp(from, term, vote_granted, is_pre_vote)
            }
            Message::AppendEntries {
                term, leader_id, prev_log_index, prev_log_term, entries, leader_commit, is_heartbeat,
            } => self.handle_append_entries(
                from, term, leader_id, prev_log_index, prev_log_term, entries, leader_commit, is_heartbeat,
            ),
            Message::AppendEntriesResp { term, success, match_index, conflict_term, conflict_index } => {
                self.handle_append_entries_resp(from, term, success, match_index, conflict_term, conflict_index)
            }
            Message::InstallSnapshot {
                term, leader_id, last_included_index, last_included_term, offset, data, done,
            } => self.handle_install_snapshot(
                from, term, leader_id, last_included_index, last_included_term, offset, data, done,
            ),
            Message::InstallSnapshotResp { term, bytes_stored } => {
                self.handle_install_snapshot_resp(from, term, bytes_stored)
            }
        };
        self.finish_step(outbox)
    }

    /// Submit a new entry. Only the leader can accept one (others get `NotLeader`).
    pub fn propose(&mut self, kind: EntryKind, payload: Vec<u8>) -> Result<(LogIndex, StepResult), ConsensusError> {
        if self.halted {
            return Err(ConsensusError::StorageFailure("node halted".into()));
        }
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader { leader_hint: self.leader_id.clone() });
        }
        if kind == EntryKind::ConfigChange {
            if self.pending_config_change {
                return Err(ConsensusError::ConfigConflict);
            }
            self.pending_config_change = true;
        }
        let index = self.append_local(kind, payload)?;
        let outbox = self.broadcast_append_entries();
        // With no peers (or if every peer already matches), there is no
        // AppendEntriesResp to trigger this — a majority of one is still a
        // majority, so the leader must check immediately rather than wait
        // for a response that will never come.
        self.try_advance_commit();
        Ok((index, self.finish_step(outbox)))
    }

    /// Compact the log up to `applied_index` if enough entries have piled
    /// up past the snapshot prefix (the configured `snapshot_threshold_entries`).
    /// Not wired into `tick` automatically — callers that want auto-snapshot
    /// call this after observing commits; see DESIGN.md.
    pub fn maybe_compact(&mut self) -> Result<bool, ConsensusError> {
        let accumulated = self.applied_index.saturating_sub(self.log.first_index().saturating_sub(1));
        if accumulated < self.config.snapshot_threshold_entries || self.applied_index == 0 {
            return Ok(false);
        }
        self.log.truncate_prefix(self.applied_index)?;
        Ok(true)
    }

    fn finish_step(&mut self, outbox: Outbox) -> StepResult {
        let applied = std::mem::take(&mut self.applied_buffer);
        StepResult { outbox, applied }
    }

    // ---- role transitions -----------------------------------------------

    fn demote_to_follower(&mut self, new_term: Term) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            self.persist_meta();
        }
        if !matches!(self.role, Role::Follower) {
            debug!(node = %self.node_id, term = new_term, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.ticker.reset_election();
    }

    fn start_prevote(&mut self) -> Outbox {
        let mut votes = HashSet::new();
        votes.insert(self.node_id.clone());
        self.role = Role::PreCandidate { votes };
        self.ticker.reset_election();

        let term = self.current_term + 1;
        let (last_index, last_term) = self.last_log_index_term();
        let mut out: Outbox = self
            .config
            .peer_ids()
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Message::RequestVote {
                        term,
                        candidate_id: self.node_id.clone(),
                        last_log_index: last_index,
                        last_log_term: last_term,
                        is_pre_vote: true,
                    },
                )
            })
            .collect();

        if let Role::PreCandidate { votes } = &self.role {
            if votes.len() >= self.config.majority() {
                out.extend(self.start_real_election());
            }
        }
        out
    }

    fn start_real_election(&mut self) -> Outbox {
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        self.persist_meta();

        let mut votes = HashSet::new();
        votes.insert(self.node_id.clone());
        self.role = Role::Candidate { votes };
        self.ticker.reset_election();

        info!(node = %self.node_id, term = self.current_term, "starting election");

        let term = self.current_term;
        let (last_index, last_term) = self.last_log_index_term();
        let mut out: Outbox = self
            .config
            .peer_ids()
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Message::RequestVote {
                        term,
                        candidate_id: self.node_id.clone(),
                        last_log_index: last_index,
                        last_log_term: last_term,
                        is_pre_vote: false,
                    },
                )
            })
            .collect();

        if let Role::Candidate { votes } = &self.role {
            if votes.len() >= self.config.majority() {
                out.extend(self.become_leader());
            }
        }
        out
    }

    fn become_leader(&mut self) -> Outbox {
        let last = self.log.last_index();
        let peers = self.config.peer_ids().into_iter().map(|id| (id, Peer::new(last + 1))).collect();
        self.role = Role::Leader { peers };
        self.leader_id = Some(self.node_id.clone());
        info!(node = %self.node_id, term = self.current_term, "won election, became leader");

        // A no-op entry makes prior-term entries committable promptly,
        // since they can only commit transitively once this term's own
        // entry commits.
        if let Err(e) = self.append_local(EntryKind::NoOp, Vec::new()) {
            error!(error = %e, "failed to append leadership no-op");
        }
        let outbox = self.broadcast_append_entries();
        // A single-node cluster is its own majority: there are no peers to
        // send the broadcast above to, and thus no AppendEntriesResp will
        // ever arrive to trigger the usual commit check.
        self.try_advance_commit();
        outbox
    }

    // ---- RequestVote ------------------------------------------------------

    fn handle_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
        is_pre_vote: bool,
    ) -> Outbox {
        let (my_last_index, my_last_term) = self.last_log_index_term();
        let log_ok = (last_log_term, last_log_index) >= (my_last_term, my_last_index);

        if is_pre_vote {
            // Never touches term or votedFor, but still gates on term
            // currency like a real vote would for the hypothetical election
            // this models.
            let granted = term >= self.current_term && log_ok;
            return vec![(
                from,
                Message::RequestVoteResp { term, vote_granted: granted, leader_id: self.leader_id.clone(), is_pre_vote: true },
            )];
        }

        if term < self.current_term {
            return vec![(
                from,
                Message::RequestVoteResp { term: self.current_term, vote_granted: false, leader_id: self.leader_id.clone(), is_pre_vote: false },
            )];
        }

        let can_vote = self.voted_for.is_none() || self.voted_for.as_deref() == Some(candidate_id.as_str());
        let granted = can_vote && log_ok;
        if granted {
            self.voted_for = Some(candidate_id.clone());
            self.persist_meta();
            self.ticker.reset_election();
            info!(node = %self.node_id, candidate = %candidate_id, term, "granted vote");
        } else {
            debug!(node = %self.node_id, candidate = %candidate_id, can_vote, log_ok, "rejected vote");
        }

        vec![(
            from,
            Message::RequestVoteResp { term: self.current_term, vote_granted: granted, leader_id: self.leader_id.clone(), is_pre_vote: false },
        )]
    }

    fn handle_request_vote_resp(&mut self, from: NodeId, term: Term, vote_granted: bool, is_pre_vote: bool) -> Outbox {
        if !vote_granted {
            return Vec::new();
        }
        match &mut self.role {
            Role::PreCandidate { votes } if is_pre_vote && term == self.current_term + 1 => {
                votes.insert(from);
                if votes.len() >= self.config.majority() {
                    return self.start_real_election();
                }
            }
            Role::Candidate { votes } if !is_pre_vote && term == self.current_term => {
                votes.insert(from);
                if votes.len() >= self.config.majority() {
                    return self.become_leader();
                }
            }
            _ => {
                // Wrong role or stale term/round: discard.
            }
        }
        Vec::new()
    }

    // ---- AppendEntries ------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: LogIndex,
        _is_heartbeat: bool,
    ) -> Outbox {
        if term < self.current_term {
            return vec![(
                from,
                Message::AppendEntriesResp {
                    term: self.current_term,
                    success: false,
                    match_index: self.log.last_index(),
                    conflict_term: None,
                    conflict_index: self.log.last_index(),
                },
            )];
        }

        self.leader_id = Some(leader_id);
        self.ticker.reset_election();
        if !matches!(self.role, Role::Follower) {
            self.role = Role::Follower;
        }

        if prev_log_index < self.log.first_index().saturating_sub(1) {
            // The leader believes we're further behind our own compacted
            // prefix than we actually are; push it onto the snapshot path.
            // (`prev_log_index == first_index() - 1` is the snapshot
            // boundary itself, which `term_at` can still verify.)
            return vec![(
                from,
                Message::AppendEntriesResp {
                    term: self.current_term,
                    success: false,
                    match_index: self.log.last_index(),
                    conflict_term: None,
                    conflict_index: self.log.first_index().saturating_sub(1),
                },
            )];
        }

        let prev_ok = prev_log_index == 0 || matches!(self.log.term_at(prev_log_index), Ok(t) if t == prev_log_term);
        if !prev_ok {
            let (conflict_term, conflict_index) = if prev_log_index > self.log.last_index() {
                (None, self.log.last_index())
            } else {
                let t = self.log.term_at(prev_log_index).unwrap_or(0);
                (Some(t), self.first_index_of_term(prev_log_index, t))
            };
            debug!(node = %self.node_id, prev_log_index, conflict_term, conflict_index, "rejecting append entries: log mismatch");
            return vec![(
                from,
                Message::AppendEntriesResp { term: self.current_term, success: false, match_index: self.log.last_index(), conflict_term, conflict_index },
            )];
        }

        let last_new_index = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        for entry in entries {
            if entry.index > self.log.last_index() {
                if let Err(e) = self.log.append(entry) {
                    error!(error = %e, "append failed, halting");
                    self.halted = true;
                    return Vec::new();
                }
                continue;
            }
            match self.log.term_at(entry.index) {
                Ok(t) if t != entry.term => {
                    if let Err(e) = self.log.truncate_suffix(entry.index, self.commit_index) {
                        warn!(error = %e, index = entry.index, "refusing to truncate at/below commit index");
                        continue;
                    }
                    if let Err(e) = self.log.append(entry) {
                        error!(error = %e, "append failed after truncation, halting");
                        self.halted = true;
                        return Vec::new();
                    }
                }
                Ok(_) => {
                    // Identical entry already present: duplicate delivery is
                    // a no-op.
                }
                Err(_) => {
                    if let Err(e) = self.log.append(entry) {
                        error!(error = %e, "append failed, halting");
                        self.halted = true;
                        return Vec::new();
                    }
                }
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(last_new_index);
            if let Err(e) = self.log.persist_commit_meta(self.commit_index, self.applied_index) {
                error!(error = %e, "commit meta persist failed, halting");
                self.halted = true;
                return Vec::new();
            }
            self.apply_committed();
        }

        vec![(
            from,
            Message::AppendEntriesResp { term: self.current_term, success: true, match_index: last_new_index, conflict_term: None, conflict_index: last_new_index },
        )]
    }

    fn handle_append_entries_resp(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        conflict_term: Option<Term>,
        conflict_index: LogIndex,
    ) -> Outbox {
        if term != self.current_term || !self.is_leader() {
            return Vec::new();
        }

        if !success {
            let new_next = match conflict_term {
                Some(ct) => self.find_last_index_with_term(ct).map(|i| i + 1).unwrap_or(conflict_index),
                None => conflict_index + 1,
            }
            .max(1);
            self.with_leader(|_core, peers| {
                if let Some(peer) = peers.get_mut(&from) {
                    peer.inflight = false;
                    peer.next_index = new_next;
                }
            });
            return self.generate_append_for_peer(&from);
        }

        self.with_leader(|_core, peers| {
            if let Some(peer) = peers.get_mut(&from) {
                peer.inflight = false;
                peer.match_index = match_index;
                peer.next_index = match_index + 1;
            }
        });
        self.try_advance_commit()
    }

    fn try_advance_commit(&mut self) -> Outbox {
        if let Role::Leader { peers } = &self.role {
            let mut match_indices: Vec<LogIndex> = peers.values().map(|p| p.match_index).collect();
            match_indices.push(self.log.last_index()); // the leader's own log is fully "replicated" to itself
            match_indices.sort_unstable();
            // The largest index replicated on at least a majority of the
            // cluster is the one `majority()` entries from the end of the
            // sorted match set, not the plain middle element — those only
            // coincide for odd cluster sizes.
            let n = match_indices[match_indices.len() - self.config.majority()];
            if n > self.commit_index && matches!(self.log.term_at(n), Ok(t) if t == self.current_term) {
                self.commit_index = n;
                let _ = self.log.persist_commit_meta(self.commit_index, self.applied_index);
                info!(node = %self.node_id, commit_index = n, "advanced commit index");
                self.apply_committed();
            }
        }
        Vec::new()
    }

    fn apply_committed(&mut self) {
        while self.applied_index < self.commit_index {
            let next = self.applied_index + 1;
            let entry = match self.log.get(next) {
                Ok(e) => e,
                Err(_) => break, // not available locally yet; retry on the next step
            };
            if entry.kind == EntryKind::ConfigChange {
                self.pending_config_change = false;
            }
            if let Err(e) = self.sm.apply(&entry) {
                warn!(error = %e, index = entry.index, "state machine apply failed");
            }
            self.applied_index = next;
            self.applied_buffer.push(entry);
        }
        if !self.applied_buffer.is_empty() {
            let _ = self.log.persist_commit_meta(self.commit_index, self.applied_index);
        }
    }

    // ---- InstallSnapshot ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Outbox {
        if term < self.current_term {
            return vec![(from, Message::InstallSnapshotResp { term: self.current_term, bytes_stored: 0 })];
        }

        self.leader_id = Some(leader_id);
        self.ticker.reset_election();
        if !matches!(self.role, Role::Follower) {
            self.role = Role::Follower;
        }

        if offset == 0 {
            self.snapshot_staging.reset();
        }
        if self.snapshot_staging.accept(offset, &data).is_err() {
            warn!(node = %self.node_id, offset, "out-of-order snapshot chunk, resetting transfer");
            self.snapshot_staging.reset();
            return vec![(from, Message::InstallSnapshotResp { term: self.current_term, bytes_stored: 0 })];
        }

        let bytes_stored = self.snapshot_staging.len();
        if done {
            let bytes = self.snapshot_staging.take();
            let matches_existing = matches!(self.log.term_at(last_included_index), Ok(t) if t == last_included_term);
            let reset_result = if matches_existing {
                self.log.truncate_prefix(last_included_index)
            } else {
                self.log.reset_to_snapshot(last_included_index, last_included_term)
            };
            if let Err(e) = reset_result {
                error!(error = %e, "snapshot log reset failed, halting");
                self.halted = true;
                return Vec::new();
            }
            if let Err(e) = self.sm.restore(&bytes) {
                warn!(error = %e, "state machine restore failed");
                return vec![(from, Message::InstallSnapshotResp { term: self.current_term, bytes_stored })];
            }
            if self.commit_index < last_included_index {
                self.commit_index = last_included_index;
            }
            if self.applied_index < last_included_index {
                self.applied_index = last_included_index;
            }
            let _ = self.log.persist_commit_meta(self.commit_index, self.applied_index);
            self.recompute_pending_config_change();
            info!(node = %self.node_id, last_included_index, "installed snapshot");
        }

        vec![(from, Message::InstallSnapshotResp { term: self.current_term, bytes_stored })]
    }

    fn handle_install_snapshot_resp(&mut self, from: NodeId, term: Term, _bytes_stored: u64) -> Outbox {
        if term != self.current_term || !self.is_leader() {
            return Vec::new();
        }
        let last_included_index = self.log.first_index().saturating_sub(1);
        let resumed = self.with_leader(|_core, peers| {
            if let Some(peer) = peers.get_mut(&from) {
                peer.inflight = false;
                if peer.snapshot_done_sent {
                    peer.next_index = last_included_index + 1;
                    peer.match_index = last_included_index;
                    peer.snapshot_offset = None;
                    peer.snapshot_done_sent = false;
                    return true;
                }
            }
            false
        });
        if resumed {
            self.generate_append_for_peer(&from)
        } else {
            Vec::new()
        }
    }

    // ---- replication helpers --------------------------------------------

    fn broadcast_append_entries(&mut self) -> Outbox {
        let ids = self.leader_peer_ids();
        let mut out = Vec::new();
        for id in ids {
            out.extend(self.generate_append_for_peer(&id));
        }
        out
    }

    fn leader_peer_ids(&self) -> Vec<NodeId> {
        match &self.role {
            Role::Leader { peers } => peers.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn generate_append_for_peer(&mut self, peer_id: &NodeId) -> Outbox {
        let peer_id = peer_id.clone();
        self.with_leader(|core, peers| {
            let peer = match peers.get_mut(&peer_id) {
                Some(p) => p,
                None => return Vec::new(),
            };
            if peer.inflight {
                return Vec::new();
            }

            let prev_log_index = peer.next_index.saturating_sub(1);
            if prev_log_index < core.log.first_index().saturating_sub(1) {
                let data = core.sm.snapshot();
                let offset = peer.snapshot_offset.unwrap_or(0);
                let (chunk, done) = crate::snapshot::next_chunk(&data, offset);
                peer.snapshot_offset = Some(offset + chunk.len() as u64);
                peer.snapshot_done_sent = done;
                peer.inflight = true;
                let last_included_index = core.log.first_index().saturating_sub(1);
                let last_included_term = core.log.term_at(last_included_index).unwrap_or(0);
                return vec![(
                    peer_id.clone(),
                    Message::InstallSnapshot {
                        term: core.current_term,
                        leader_id: core.node_id.clone(),
                        last_included_index,
                        last_included_term,
                        offset,
                        data: chunk,
                        done,
                    },
                )];
            }

            let prev_log_term = core.log.term_at(prev_log_index).unwrap_or(0);
            let last_index = core.log.last_index();
            let entries = if peer.next_index > last_index {
                Vec::new()
            } else {
                let hi = peer
                    .next_index
                    .saturating_add(core.config.max_entries_per_append as u64)
                    .saturating_sub(1)
                    .min(last_index);
                core.log.range(peer.next_index, hi).unwrap_or_default()
            };
            let is_heartbeat = entries.is_empty();
            peer.inflight = true;
            vec![(
                peer_id.clone(),
                Message::AppendEntries {
                    term: core.current_term,
                    leader_id: core.node_id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: core.commit_index,
                    is_heartbeat,
                },
            )]
        })
    }

    fn find_last_index_with_term(&self, term: Term) -> Option<LogIndex> {
        let mut idx = self.log.last_index();
        let floor = self.log.first_index();
        while idx >= floor {
            match self.log.term_at(idx) {
                Ok(t) if t == term => return Some(idx),
                Ok(t) if t < term => return None,
                _ => {}
            }
            if idx == 0 {
                break;
            }
            idx -= 1;
        }
        None
    }

    fn first_index_of_term(&self, start: LogIndex, term: Term) -> LogIndex {
        let mut idx = start;
        while idx > self.log.first_index() {
            match self.log.term_at(idx - 1) {
                Ok(t) if t == term => idx -= 1,
                _ => break,
            }
        }
        idx
    }

    fn append_local(&mut self, kind: EntryKind, payload: Vec<u8>) -> Result<LogIndex, ConsensusError> {
        let index = self.log.last_index() + 1;
        let entry = Entry { index, term: self.current_term, kind, payload };
        match self.log.append(entry) {
            Ok(()) => Ok(index),
            Err(e) => {
                self.halted = true;
                Err(e)
            }
        }
    }

    fn last_log_index_term(&self) -> (LogIndex, Term) {
        let i = self.log.last_index();
        (i, self.log.term_at(i).unwrap_or(0))
    }

    fn recompute_pending_config_change(&mut self) {
        self.pending_config_change = false;
        if self.log.last_index() > self.commit_index {
            if let Ok(entries) = self.log.range(self.commit_index + 1, self.log.last_index()) {
                self.pending_config_change = entries.iter().any(|e| e.kind == EntryKind::ConfigChange);
            }
        }
    }

    fn persist_meta(&mut self) {
        let meta = PersistentMeta { current_term: self.current_term, voted_for: self.voted_for.clone() };
        if let Err(e) = self.meta.persist(meta) {
            error!(error = %e, "meta persist failed, halting");
            self.halted = true;
        }
    }

    /// Takes the `Leader` peer arena out of `self.role` for the duration of
    /// `f`, then restores it. Lets `f` freely borrow the rest of `self`
    /// (log, state machine, config) while also mutating the peer arena,
    /// which a direct `match &mut self.role` can't do without a borrow
    /// conflict. A no-op returning `T::default()` on any other role.
    fn with_leader<T, F>(&mut self, f: F) -> T
    where
        T: Default,
        F: FnOnce(&mut Self, &mut HashMap<NodeId, Peer>) -> T,
    {
        match std::mem::replace(&mut self.role, Role::Follower) {
            Role::Leader { mut peers } => {
                let out = f(self, &mut peers);
                self.role = Role::Leader { peers };
                out
            }
            other => {
                self.role = other;
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::log_store::MemLogStore;
    use crate::meta_store::MemMetaStore;
    use crate::types::RoleTag;

    struct EchoStateMachine {
        applied: Vec<Entry>,
        snapshot_data: Vec<u8>,
    }

    impl StateMachine for EchoStateMachine {
        fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>, ConsensusError> {
            self.applied.push(entry.clone());
            Ok(entry.payload.clone())
        }
        fn snapshot(&self) -> Vec<u8> {
            self.snapshot_data.clone()
        }
        fn restore(&mut self, bytes: &[u8]) -> Result<(), ConsensusError> {
            self.snapshot_data = bytes.to_vec();
            Ok(())
        }
    }

    fn core_with_peers(node_id: &str, peers: &[&str]) -> ConsensusCore {
        let mut cfg = Config::default();
        cfg.base_election_timeout = 5;
        for p in peers {
            cfg.peers.insert((*p).into(), format!("{p}:0"));
        }
        ConsensusCore::new(
            node_id.into(),
            cfg,
            Box::new(MemLogStore::new()),
            Box::new(MemMetaStore::default()),
            Box::new(EchoStateMachine { applied: Vec::new(), snapshot_data: Vec::new() }),
        )
    }

    #[test]
    fn single_node_cluster_becomes_leader_immediately_on_timeout() {
        let mut core = core_with_peers("n1", &[]);
        let result = loop {
            let r = core.tick();
            if core.is_leader() {
                break r;
            }
        };
        assert!(core.is_leader());
        // The leadership no-op should already have produced a committable entry.
        assert!(!result.outbox.is_empty() || core.log_stats_last_index() >= 1);
        // A cluster of one is its own majority: the no-op must commit (and
        // apply) without waiting on any AppendEntriesResp, since none will
        // ever arrive.
        assert_eq!(core.commit_index(), 1);
        assert_eq!(core.applied_index(), 1);
    }

    #[test]
    fn commit_requires_true_majority_not_upper_median_on_even_cluster() {
        // 4-node cluster: majority is 3. A single follower ack must not be
        // enough to commit, even though it is the upper median of the
        // 4-element match-index set.
        let mut core = core_with_peers("n1", &["n2", "n3", "n4"]);
        loop {
            core.tick();
            if core.is_leader() {
                break;
            }
        }
        let term = core.current_term();
        let ack = core.handle_message(
            "n2".into(),
            Message::AppendEntriesResp { term, success: true, match_index: 1, conflict_term: None, conflict_index: 1 },
        );
        assert_eq!(core.commit_index(), 0, "one ack out of three followers must not reach a 4-node majority");
        assert!(ack.applied.is_empty());

        let ack2 = core.handle_message(
            "n3".into(),
            Message::AppendEntriesResp { term, success: true, match_index: 1, conflict_term: None, conflict_index: 1 },
        );
        assert_eq!(core.commit_index(), 1, "leader + two acking followers reach the 4-node majority of three");
        assert_eq!(ack2.applied.len(), 1);
    }

    #[test]
    fn election_requires_prevote_then_real_vote() {
        let mut core = core_with_peers("n1", &["n2", "n3"]);
        // drive ticks until the election timer fires
        let mut out = Vec::new();
        for _ in 0..20 {
            let r = core.tick();
            if !r.outbox.is_empty() {
                out = r.outbox;
                break;
            }
        }
        assert_eq!(core.role_tag(), RoleTag::PreCandidate);
        assert!(matches!(&out[0].1, Message::RequestVote { is_pre_vote: true, .. }));
        assert_eq!(core.current_term(), 0, "pre-vote must not advance the term");
    }

    #[test]
    fn full_election_then_replication_commits() {
        let mut core = core_with_peers("n1", &["n2", "n3"]);
        for _ in 0..20 {
            let r = core.tick();
            if !r.outbox.is_empty() {
                break;
            }
        }
        assert_eq!(core.role_tag(), RoleTag::PreCandidate);

        // A 3-node cluster needs 2 votes; self + one peer already clears
        // that bar, so a single granted pre-vote is enough to advance.
        let r1 = core.handle_message("n2".into(), Message::RequestVoteResp { term: 1, vote_granted: true, leader_id: None, is_pre_vote: true });
        assert_eq!(core.role_tag(), RoleTag::Candidate);
        assert_eq!(core.current_term(), 1);
        assert!(!r1.outbox.is_empty());

        let r4 = core.handle_message("n2".into(), Message::RequestVoteResp { term: 1, vote_granted: true, leader_id: None, is_pre_vote: false });
        assert_eq!(core.role_tag(), RoleTag::Leader);
        assert!(!r4.outbox.is_empty()); // initial AppendEntries broadcast carrying the leadership no-op

        // Acknowledge that first round for n2, clearing its in-flight slot
        // (only one outstanding AppendEntries per peer) and committing the
        // no-op via the leader + n2 majority.
        let ack1 = core.handle_message(
            "n2".into(),
            Message::AppendEntriesResp { term: 1, success: true, match_index: 1, conflict_term: None, conflict_index: 1 },
        );
        assert_eq!(core.commit_index(), 1);
        assert_eq!(ack1.applied.len(), 1);

        let (index, step) = core.propose(EntryKind::Normal, b"x=1".to_vec()).unwrap();
        assert_eq!(index, 2); // index 1 is the leadership no-op
        assert!(!step.outbox.is_empty());

        let resp_n2 = core.handle_message(
            "n2".into(),
            Message::AppendEntriesResp { term: 1, success: true, match_index: 2, conflict_term: None, conflict_index: 2 },
        );
        assert_eq!(core.commit_index(), 2);
        assert_eq!(core.applied_index(), 2);
        assert_eq!(resp_n2.applied.len(), 1);
    }

    #[test]
    fn stale_vote_response_after_term_advance_is_discarded() {
        let mut core = core_with_peers("n1", &["n2", "n3"]);
        // Jump straight to term 6 as if several elections had already happened.
        for _ in 0..6 {
            core.current_term += 1;
        }
        core.role = Role::Candidate { votes: { let mut s = HashSet::new(); s.insert("n1".to_string()); s } };
        let before = core.role_tag();
        let result = core.handle_message("n2".into(), Message::RequestVoteResp { term: 4, vote_granted: true, leader_id: None, is_pre_vote: false });
        assert_eq!(core.role_tag(), before);
        assert!(result.outbox.is_empty());
    }

    #[test]
    fn append_entries_from_stale_term_is_rejected() {
        let mut core = core_with_peers("n1", &["n2"]);
        core.current_term = 5;
        let result = core.handle_message(
            "n2".into(),
            Message::AppendEntries { term: 3, leader_id: "n2".into(), prev_log_index: 0, prev_log_term: 0, entries: vec![], leader_commit: 0, is_heartbeat: true },
        );
        match &result.outbox[0].1 {
            Message::AppendEntriesResp { success, term, .. } => {
                assert!(!success);
                assert_eq!(*term, 5);
            }
            _ => panic!("expected AppendEntriesResp"),
        }
    }

    #[test]
    fn duplicate_append_entries_is_idempotent() {
        let mut core = core_with_peers("n1", &["n2"]);
        core.current_term = 1;
        let msg = Message::AppendEntries {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![Entry::normal(1, 1, b"a".to_vec())],
            leader_commit: 1,
            is_heartbeat: false,
        };
        let r1 = core.handle_message("n2".into(), msg.clone());
        let r2 = core.handle_message("n2".into(), msg);
        assert_eq!(core.log.last_index(), 1);
        assert!(matches!(&r1.outbox[0].1, Message::AppendEntriesResp { success: true, .. }));
        assert!(matches!(&r2.outbox[0].1, Message::AppendEntriesResp { success: true, .. }));
        assert_eq!(r1.applied.len(), 1);
        assert_eq!(r2.applied.len(), 0, "re-delivery must not re-apply");
    }

    #[test]
    fn conflicting_entry_truncates_suffix_above_commit() {
        let mut core = core_with_peers("n1", &["n2"]);
        core.current_term = 2;
        core.log.append(Entry::normal(1, 1, b"a".to_vec())).unwrap();
        core.log.append(Entry::normal(2, 1, b"b".to_vec())).unwrap();

        let msg = Message::AppendEntries {
            term: 2,
            leader_id: "n2".into(),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![Entry::normal(2, 2, b"c".to_vec())],
            leader_commit: 0,
            is_heartbeat: false,
        };
        let result = core.handle_message("n2".into(), msg);
        assert!(matches!(&result.outbox[0].1, Message::AppendEntriesResp { success: true, .. }));
        assert_eq!(core.log.get(2).unwrap().term, 2);
    }

    #[test]
    fn leader_crash_before_replication_is_overwritten_by_new_leader() {
        // Compressed to the log-level mechanics: a dangling
        // uncommitted entry from an old term gets overwritten once a new
        // leader of a higher term replicates over it.
        let mut core = core_with_peers("n2", &["n1"]);
        core.current_term = 2;
        core.log.append(Entry::normal(1, 2, b"orphan".to_vec())).unwrap();

        let msg = Message::AppendEntries {
            term: 3,
            leader_id: "n1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![Entry::normal(1, 3, b"authoritative".to_vec())],
            leader_commit: 1,
            is_heartbeat: false,
        };
        let result = core.handle_message("n1".into(), msg);
        assert!(matches!(&result.outbox[0].1, Message::AppendEntriesResp { success: true, .. }));
        assert_eq!(core.log.get(1).unwrap().payload, b"authoritative");
    }

    #[test]
    fn install_snapshot_resets_log_and_resumes_replication() {
        let mut core = core_with_peers("n1", &["n2"]);
        core.current_term = 7;
        let msg = Message::InstallSnapshot {
            term: 7,
            leader_id: "n2".into(),
            last_included_index: 499,
            last_included_term: 7,
            offset: 0,
            data: b"snapshot-bytes".to_vec(),
            done: true,
        };
        let result = core.handle_message("n2".into(), msg);
        assert!(matches!(&result.outbox[0].1, Message::InstallSnapshotResp { .. }));
        assert_eq!(core.log.first_index(), 500);
        assert_eq!(core.commit_index(), 499);
        assert_eq!(core.applied_index(), 499);
    }

    impl ConsensusCore {
        fn log_stats_last_index(&self) -> LogIndex {
            self.log.last_index()
        }
    }

    #[test]
    fn config_conflict_rejects_second_in_flight_change() {
        // A real peer is needed here: a single-node cluster is its own
        // majority and would commit (and apply) the first config change
        // immediately, clearing `pending_config_change` before the second
        // `propose` call ever runs.
        let mut core = core_with_peers("n1", &["n2"]);
        loop {
            core.tick();
            if core.is_leader() {
                break;
            }
        }
        core.propose(EntryKind::ConfigChange, b"add:n4".to_vec()).unwrap();
        let err = core.propose(EntryKind::ConfigChange, b"add:n5".to_vec()).unwrap_err();
        assert_eq!(err, ConsensusError::ConfigConflict);
    }

    #[test]
    fn propose_on_follower_returns_not_leader_hint() {
        let mut core = core_with_peers("n1", &["n2"]);
        core.leader_id = Some("n2".into());
        let err = core.propose(EntryKind::Normal, b"x".to_vec()).unwrap_err();
        assert_eq!(err, ConsensusError::NotLeader { leader_hint: Some("n2".into()) });
    }
}
