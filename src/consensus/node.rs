//! The consensus node: an event loop driving elections, heartbeats and
//! log replication, plus the apply loop that feeds committed entries to
//! the FSM.
//!
//! Callers interact through `apply` / `add_voter`, which resolve once the
//! entry has been applied locally, and through `role` for leader checks.
//! Everything durable goes through the single WAL handle; the snapshot
//! store holds compacted FSM state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::RaftTimings;
use crate::consensus::fsm::{Fsm, FsmError};
use crate::consensus::rpc;
use crate::consensus::state::{EntryPayload, LogEntry, RaftRole, RaftState};
use crate::consensus::storage::{SnapshotMeta, SnapshotSink, SnapshotStore, WalState, WalStore};
use crate::consensus::timer::random_election_timeout;
use crate::error::{CoordError, Result};
use crate::proto::raft_transport_client::RaftTransportClient;
use crate::proto::{
    AddVoter as ProtoAddVoter, AppendEntriesRequest, AppendEntriesResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest, VoteResponse,
};

const RPC_TIMEOUT: Duration = Duration::from_millis(100);
const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const APPLY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Requests handled by the consensus event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Append an entry to the replicated log (leader only)
    Append {
        payload: EntryPayload,
        response_tx: oneshot::Sender<Result<u64>>,
    },
}

#[derive(Debug, Clone)]
struct Peer {
    addr: String,
    client: Option<RaftTransportClient<Channel>>,
}

enum ReplicationPlan {
    Entries(AppendEntriesRequest),
    Snapshot,
}

/// The consensus node coordinating replication for one cluster member
pub struct RaftNode {
    pub id: String,
    advertise_addr: String,
    pub state: Arc<RwLock<RaftState>>,
    timings: RaftTimings,
    snapshot_threshold: u64,
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    wal: Arc<SyncMutex<WalStore>>,
    snapshots: Arc<SnapshotStore>,
    fsm: Arc<Fsm>,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    applied_tx: watch::Sender<u64>,
    applied_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Build a node from recovered durable state. `restored` is the
    /// snapshot already loaded into the FSM, if any; entries at or below
    /// its index are not re-applied.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        advertise_addr: String,
        timings: RaftTimings,
        snapshot_threshold: u64,
        fsm: Arc<Fsm>,
        wal: WalStore,
        wal_state: WalState,
        restored: Option<SnapshotMeta>,
        snapshots: SnapshotStore,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (message_tx, message_rx) = mpsc::channel(100);

        let mut state = RaftState::new();
        state.current_term = wal_state.current_term;
        state.voted_for = wal_state.voted_for;
        state.snapshot_index = wal_state.snapshot_index;
        state.snapshot_term = wal_state.snapshot_term;
        state.log = wal_state.entries;

        let applied = wal_state
            .snapshot_index
            .max(restored.map(|m| m.index).unwrap_or(0));
        state.commit_index = applied;
        state.last_applied = applied;

        let mut peers = HashMap::new();
        for (member_id, addr) in wal_state.members {
            if member_id != id {
                peers.insert(
                    member_id,
                    Peer {
                        addr,
                        client: None,
                    },
                );
            }
        }

        let (applied_tx, applied_rx) = watch::channel(applied);

        let node = Self {
            id,
            advertise_addr,
            state: Arc::new(RwLock::new(state)),
            timings,
            snapshot_threshold,
            peers: Arc::new(Mutex::new(peers)),
            wal: Arc::new(SyncMutex::new(wal)),
            snapshots: Arc::new(snapshots),
            fsm,
            message_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            applied_tx,
            applied_rx,
            shutdown,
        };

        (node, message_rx)
    }

    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    pub async fn role(&self) -> RaftRole {
        self.state.read().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == RaftRole::Leader
    }

    /// The node currently believed to be leader, for error messages and
    /// client redirection.
    pub async fn leader_hint(&self) -> Option<String> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id.clone())
        } else {
            state.leader_id.clone()
        }
    }

    /// Establish this node as the leader of a brand-new single-server
    /// cluster. Called once at first startup with `--bootstrap`; a
    /// restarted bootstrap node re-elects itself over its recovered log.
    pub async fn bootstrap_singleton(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.become_candidate(&self.id);
        let peer_ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        state.become_leader(&self.id, &peer_ids);
        {
            let mut wal = self.wal.lock();
            wal.append_stable(state.current_term, state.voted_for.as_deref())?;
        }

        // The first bootstrap seeds the membership log with this node, so
        // every later joiner learns the full member set by replication.
        if state.last_log_index() == 0 {
            let entry = state.append_entry(EntryPayload::AddVoter {
                id: self.id.clone(),
                addr: self.advertise_addr.clone(),
            });
            self.wal.lock().append_entry(&entry)?;
        }

        if peer_ids.is_empty() {
            state.commit_index = state.last_log_index();
        }

        tracing::info!(
            node_id = %self.id,
            term = state.current_term,
            "bootstrapped single-server cluster"
        );
        Ok(())
    }

    /// Submit a state-machine command and wait until it is applied locally.
    /// Returns `NotLeader` on followers and candidates.
    pub async fn apply(&self, command: Vec<u8>, limit: Duration) -> Result<u64> {
        self.append_and_wait(EntryPayload::Command(command), limit)
            .await
    }

    /// Add a voting member. Leader-only; resolves once the membership
    /// entry is applied locally.
    pub async fn add_voter(&self, id: &str, addr: &str, limit: Duration) -> Result<()> {
        self.append_and_wait(
            EntryPayload::AddVoter {
                id: id.to_string(),
                addr: addr.to_string(),
            },
            limit,
        )
        .await?;
        Ok(())
    }

    async fn append_and_wait(&self, payload: EntryPayload, limit: Duration) -> Result<u64> {
        let deadline = Instant::now() + limit;
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(RaftMessage::Append {
                payload,
                response_tx,
            })
            .await
            .map_err(|_| CoordError::Replication("consensus loop stopped".to_string()))?;

        let index = timeout(limit, response_rx)
            .await
            .map_err(|_| CoordError::ApplyTimeout(limit))?
            .map_err(|_| CoordError::Replication("consensus loop dropped request".to_string()))??;

        let mut applied = self.applied_rx.clone();
        tokio::time::timeout_at(deadline, applied.wait_for(|&a| a >= index))
            .await
            .map_err(|_| CoordError::ApplyTimeout(limit))?
            .map_err(|_| CoordError::Replication("apply loop stopped".to_string()))?;
        Ok(index)
    }

    /// Run the consensus event loop until shutdown
    pub async fn run(self: Arc<Self>, mut message_rx: mpsc::Receiver<RaftMessage>) {
        let mut election_timeout = random_election_timeout(
            self.timings.election_timeout_min_ms,
            self.timings.election_timeout_max_ms,
        );
        let heartbeat_interval = Duration::from_millis(self.timings.heartbeat_interval_ms);

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::Append { payload, response_tx } => {
                            let result = self.handle_append_command(payload).await;
                            let _ = response_tx.send(result);
                        }
                    }
                }

                // Election timeout (followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.timings.election_timeout_min_ms,
                        self.timings.election_timeout_max_ms,
                    );
                }

                // Heartbeat / replication tick (leader)
                _ = tokio::time::sleep(heartbeat_interval), if role == RaftRole::Leader => {
                    self.replicate().await;
                }
            }
        }

        tracing::debug!(node_id = %self.id, "consensus loop stopped");
    }

    /// Handle a request to append an entry (leader only)
    async fn handle_append_command(&self, payload: EntryPayload) -> Result<u64> {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return Err(CoordError::NotLeader(state.leader_id.clone()));
        }

        // Start replicating to a new voter immediately; followers learn
        // about it when the entry commits and applies.
        if let EntryPayload::AddVoter { id, addr } = &payload {
            if id != &self.id {
                let mut peers = self.peers.lock().await;
                let peer = peers.entry(id.clone()).or_insert_with(|| Peer {
                    addr: addr.clone(),
                    client: None,
                });
                peer.addr = addr.clone();
                drop(peers);
                state.track_peer(id);
            }
        }

        let entry = state.append_entry(payload);
        self.wal.lock().append_entry(&entry)?;

        // A single-server cluster commits by itself.
        if self.peers.lock().await.is_empty() {
            state.commit_index = entry.index;
        }

        tracing::debug!(index = entry.index, term = entry.term, "appended command to log");
        Ok(entry.index)
    }

    /// Start a new election
    async fn start_election(&self) {
        // A blank node that was never bootstrapped and knows no peers has
        // no cluster to win; it waits to be joined by a leader instead of
        // electing itself into a divergent single-server cluster.
        {
            let state = self.state.read().await;
            if state.last_log_index() == 0 && self.peers.lock().await.is_empty() {
                tracing::debug!(node_id = %self.id, "no peers and empty log, waiting to be joined");
                return;
            }
        }

        let (term, last_log_index, last_log_term, majority) = {
            let mut state = self.state.write().await;
            state.become_candidate(&self.id);
            if let Err(e) = self
                .wal
                .lock()
                .append_stable(state.current_term, state.voted_for.as_deref())
            {
                tracing::error!(error = %e, "failed to persist vote, abandoning election");
                return;
            }
            let total = self.peers.lock().await.len() + 1;
            (
                state.current_term,
                state.last_log_index(),
                state.last_log_term(),
                total / 2 + 1,
            )
        };

        tracing::info!(node_id = %self.id, term, "starting election");

        let req = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        let peer_ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        let mut vote_count: usize = 1; // Vote for self

        for peer_id in peer_ids {
            let Some(mut client) = self.peer_client(&peer_id).await else {
                continue;
            };
            match timeout(RPC_TIMEOUT, client.request_vote(req.clone())).await {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        self.step_down(resp.term).await;
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                        tracing::debug!(node_id = %self.id, peer_id = %peer_id, votes = vote_count, "received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "vote request failed");
                    self.drop_peer_client(&peer_id).await;
                }
                Err(_) => {
                    tracing::warn!(peer_id = %peer_id, "vote request timed out");
                }
            }
        }

        let mut state = self.state.write().await;
        if state.role == RaftRole::Candidate && state.current_term == term {
            state.votes_received = vote_count as u64;
            if vote_count >= majority {
                let peer_ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
                state.become_leader(&self.id, &peer_ids);
                tracing::info!(node_id = %self.id, term, votes = vote_count, "became leader");
            } else {
                tracing::debug!(
                    node_id = %self.id,
                    term,
                    votes = vote_count,
                    needed = majority,
                    "election failed, not enough votes"
                );
            }
        }
    }

    /// Send one round of AppendEntries (or InstallSnapshot for peers that
    /// have fallen behind the compaction point) to every follower.
    async fn replicate(self: &Arc<Self>) {
        let mut plans: Vec<(String, ReplicationPlan)> = Vec::new();
        {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let peers = self.peers.lock().await;
            for peer_id in peers.keys() {
                let next = state
                    .next_index
                    .get(peer_id)
                    .copied()
                    .unwrap_or(state.last_log_index() + 1);

                if next <= state.snapshot_index {
                    plans.push((peer_id.clone(), ReplicationPlan::Snapshot));
                    continue;
                }

                let prev_log_index = next - 1;
                let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
                let entries = state
                    .entries_from(next)
                    .iter()
                    .map(rpc::entry_to_proto)
                    .collect();

                plans.push((
                    peer_id.clone(),
                    ReplicationPlan::Entries(AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: state.commit_index,
                    }),
                ));
            }
        }

        for (peer_id, plan) in plans {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                match plan {
                    ReplicationPlan::Entries(req) => node.send_entries(peer_id, req).await,
                    ReplicationPlan::Snapshot => node.send_snapshot(peer_id).await,
                }
            });
        }
    }

    async fn send_entries(self: Arc<Self>, peer_id: String, req: AppendEntriesRequest) {
        let Some(mut client) = self.peer_client(&peer_id).await else {
            return;
        };
        match timeout(RPC_TIMEOUT, client.append_entries(req)).await {
            Ok(Ok(response)) => {
                self.handle_replication_response(&peer_id, response.into_inner())
                    .await;
            }
            Ok(Err(e)) => {
                tracing::trace!(peer_id = %peer_id, error = %e, "AppendEntries failed");
                self.drop_peer_client(&peer_id).await;
            }
            Err(_) => {
                tracing::trace!(peer_id = %peer_id, "AppendEntries timed out");
            }
        }
    }

    async fn handle_replication_response(&self, peer_id: &str, resp: AppendEntriesResponse) {
        let mut state = self.state.write().await;

        if resp.term > state.current_term {
            state.become_follower(resp.term);
            if let Err(e) = self
                .wal
                .lock()
                .append_stable(state.current_term, state.voted_for.as_deref())
            {
                tracing::error!(error = %e, "failed to persist term");
            }
            return;
        }
        if state.role != RaftRole::Leader {
            return;
        }

        if resp.success {
            state.match_index.insert(peer_id.to_string(), resp.match_index);
            state
                .next_index
                .insert(peer_id.to_string(), resp.match_index + 1);

            // Advance the commit index to the highest entry replicated on
            // a majority, counting ourselves.
            let mut match_indices: Vec<u64> = state.match_index.values().copied().collect();
            match_indices.push(state.last_log_index());
            match_indices.sort_unstable();
            let candidate = match_indices[(match_indices.len() - 1) / 2];

            if candidate > state.commit_index
                && state.term_at(candidate) == Some(state.current_term)
            {
                state.commit_index = candidate;
                tracing::debug!(commit_index = candidate, "updated commit index");
            }
        } else {
            // Back off next_index; the response's match_index is a hint at
            // how far the follower's log actually reaches.
            let current = state.next_index.get(peer_id).copied().unwrap_or(1);
            let backed_off = current
                .saturating_sub(1)
                .min(resp.match_index.saturating_add(1))
                .max(1);
            state.next_index.insert(peer_id.to_string(), backed_off);
        }
    }

    async fn send_snapshot(self: Arc<Self>, peer_id: String) {
        let (meta, data) = match self.snapshots.latest() {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                tracing::warn!(peer_id = %peer_id, "peer needs a snapshot but none exists");
                return;
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "failed to load snapshot");
                return;
            }
        };

        let (term, members) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let peers = self.peers.lock().await;
            let mut members: Vec<ProtoAddVoter> = peers
                .iter()
                .map(|(id, peer)| ProtoAddVoter {
                    id: id.clone(),
                    addr: peer.addr.clone(),
                })
                .collect();
            members.push(ProtoAddVoter {
                id: self.id.clone(),
                addr: self.advertise_addr.clone(),
            });
            (state.current_term, members)
        };

        let req = InstallSnapshotRequest {
            term,
            leader_id: self.id.clone(),
            last_included_index: meta.index,
            last_included_term: meta.term,
            data,
            members,
        };

        let Some(mut client) = self.peer_client(&peer_id).await else {
            return;
        };
        match timeout(SNAPSHOT_RPC_TIMEOUT, client.install_snapshot(req)).await {
            Ok(Ok(response)) => {
                let resp = response.into_inner();
                let mut state = self.state.write().await;
                if resp.term > state.current_term {
                    state.become_follower(resp.term);
                    return;
                }
                if state.role != RaftRole::Leader {
                    return;
                }
                let matched = state
                    .match_index
                    .get(&peer_id)
                    .copied()
                    .unwrap_or(0)
                    .max(meta.index);
                state.match_index.insert(peer_id.clone(), matched);
                state.next_index.insert(peer_id.clone(), meta.index + 1);
                tracing::info!(peer_id = %peer_id, index = meta.index, "installed snapshot on peer");
            }
            Ok(Err(e)) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "InstallSnapshot failed");
                self.drop_peer_client(&peer_id).await;
            }
            Err(_) => {
                tracing::warn!(peer_id = %peer_id, "InstallSnapshot timed out");
            }
        }
    }

    async fn step_down(&self, term: u64) {
        let mut state = self.state.write().await;
        if term > state.current_term {
            state.become_follower(term);
            if let Err(e) = self
                .wal
                .lock()
                .append_stable(state.current_term, state.voted_for.as_deref())
            {
                tracing::error!(error = %e, "failed to persist term");
            }
        }
    }

    /// Get a connected client for a peer, dialing lazily on first use
    async fn peer_client(&self, peer_id: &str) -> Option<RaftTransportClient<Channel>> {
        let (addr, existing) = {
            let peers = self.peers.lock().await;
            let peer = peers.get(peer_id)?;
            (peer.addr.clone(), peer.client.clone())
        };
        if let Some(client) = existing {
            return Some(client);
        }

        let endpoint = format!("http://{addr}");
        match timeout(RPC_TIMEOUT, RaftTransportClient::connect(endpoint.clone())).await {
            Ok(Ok(client)) => {
                let mut peers = self.peers.lock().await;
                if let Some(peer) = peers.get_mut(peer_id) {
                    peer.client = Some(client.clone());
                }
                tracing::debug!(peer_id = %peer_id, addr = %endpoint, "connected to peer");
                Some(client)
            }
            Ok(Err(e)) => {
                tracing::trace!(peer_id = %peer_id, addr = %endpoint, error = %e, "failed to connect to peer");
                None
            }
            Err(_) => {
                tracing::trace!(peer_id = %peer_id, addr = %endpoint, "peer connect timed out");
                None
            }
        }
    }

    async fn drop_peer_client(&self, peer_id: &str) {
        if let Some(peer) = self.peers.lock().await.get_mut(peer_id) {
            peer.client = None;
        }
    }

    /// Run the apply loop: feed committed entries to the FSM in log order,
    /// resolve apply futures, and compact once enough entries accumulate.
    pub async fn run_applier(self: Arc<Self>) {
        let mut interval = tokio::time::interval(APPLY_POLL_INTERVAL);
        let mut applied_since_snapshot: u64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            for entry in self.take_committed().await {
                match &entry.payload {
                    EntryPayload::Command(data) => match self.fsm.apply(data) {
                        Ok(()) => {}
                        Err(FsmError::Corrupt(e)) => {
                            // Divergence protection: an undecodable committed
                            // entry means this replica can no longer prove it
                            // matches the others.
                            tracing::error!(index = entry.index, error = %e, "corrupt log entry, halting");
                            std::process::exit(1);
                        }
                        Err(rejected) => {
                            let err = CoordError::from(rejected);
                            tracing::warn!(index = entry.index, error = %err, "state machine rejected command");
                        }
                    },
                    EntryPayload::AddVoter { id, addr } => {
                        self.register_member(id, addr).await;
                    }
                }
                applied_since_snapshot += 1;
                let _ = self.applied_tx.send(entry.index);
            }

            if applied_since_snapshot >= self.snapshot_threshold {
                match self.take_snapshot().await {
                    Ok(()) => applied_since_snapshot = 0,
                    Err(e) => tracing::warn!(error = %e, "snapshot failed"),
                }
            }
        }

        tracing::debug!(node_id = %self.id, "apply loop stopped");
    }

    /// Entries committed but not yet applied, advancing `last_applied`
    async fn take_committed(&self) -> Vec<LogEntry> {
        let mut state = self.state.write().await;
        let mut entries = Vec::new();
        while state.last_applied < state.commit_index {
            state.last_applied += 1;
            if let Some(entry) = state.get_entry(state.last_applied) {
                entries.push(entry.clone());
            }
        }
        entries
    }

    /// Record a cluster member locally. Harmless to repeat; addresses in
    /// the stable store survive log compaction.
    async fn register_member(&self, member_id: &str, addr: &str) {
        if let Err(e) = self.wal.lock().append_member(member_id, addr) {
            tracing::error!(error = %e, "failed to persist member address");
        }
        if member_id == self.id {
            return;
        }
        {
            let mut peers = self.peers.lock().await;
            let peer = peers.entry(member_id.to_string()).or_insert_with(|| Peer {
                addr: addr.to_string(),
                client: None,
            });
            peer.addr = addr.to_string();
        }
        let mut state = self.state.write().await;
        state.track_peer(member_id);
        tracing::info!(member = member_id, addr, "cluster member registered");
    }

    /// Snapshot the FSM and compact the log through the applied index
    async fn take_snapshot(&self) -> Result<()> {
        let snapshot = self.fsm.snapshot()?;
        let (index, term) = {
            let state = self.state.read().await;
            (state.last_applied, state.term_at(state.last_applied))
        };
        let Some(term) = term else {
            return Ok(());
        };
        if index == 0 {
            return Ok(());
        }

        let meta = SnapshotMeta { index, term };
        let sink = self.snapshots.create(meta)?;
        snapshot.persist(sink)?;

        self.state.write().await.compact_to(index, term);
        self.wal.lock().append_compact(index, term)?;
        if let Err(e) = self.snapshots.prune_older_than(index) {
            tracing::warn!(error = %e, "failed to prune old snapshots");
        }

        tracing::info!(index, term, "compacted log into snapshot");
        Ok(())
    }

    /// Handle an incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> std::io::Result<VoteResponse> {
        let response = {
            let mut state = self.state.write().await;
            let mut wal = self.wal.lock();
            rpc::handle_request_vote(&mut state, &mut wal, &req, &self.id)?
        };

        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }
        Ok(response)
    }

    /// Handle an incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> std::io::Result<AppendEntriesResponse> {
        let response = {
            let mut state = self.state.write().await;
            let mut wal = self.wal.lock();
            rpc::handle_append_entries(&mut state, &mut wal, &req, &self.id)?
        };

        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
        }
        Ok(response)
    }

    /// Handle an incoming InstallSnapshot RPC: replace the FSM state and
    /// fast-forward the log to the snapshot point.
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.state.write().await;
        if req.term < state.current_term {
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
            });
        }
        if req.term > state.current_term || state.role != RaftRole::Follower {
            state.become_follower(req.term);
            self.wal
                .lock()
                .append_stable(state.current_term, state.voted_for.as_deref())?;
        }
        state.leader_id = Some(req.leader_id.clone());

        if req.last_included_index > state.snapshot_index {
            self.fsm.restore(&req.data[..])?;

            let meta = SnapshotMeta {
                index: req.last_included_index,
                term: req.last_included_term,
            };
            let mut sink = self.snapshots.create(meta)?;
            if let Err(e) = std::io::Write::write_all(&mut sink, &req.data) {
                let _ = sink.cancel();
                return Err(e.into());
            }
            sink.commit()?;

            // The snapshot supersedes the entire local log.
            state.log.clear();
            state.snapshot_index = req.last_included_index;
            state.snapshot_term = req.last_included_term;
            state.commit_index = state.commit_index.max(req.last_included_index);
            state.last_applied = state.last_applied.max(req.last_included_index);
            {
                let mut wal = self.wal.lock();
                wal.append_truncate(1)?;
                wal.append_compact(req.last_included_index, req.last_included_term)?;
            }
            let _ = self.applied_tx.send(state.last_applied);

            tracing::info!(
                index = req.last_included_index,
                term = req.last_included_term,
                "installed snapshot from leader"
            );
        }

        let term = state.current_term;
        drop(state);

        for member in &req.members {
            self.register_member(&member.id, &member.addr).await;
        }
        *self.last_heartbeat.write().await = Instant::now();

        Ok(InstallSnapshotResponse { term })
    }

    /// Stop the consensus loops and flush the durable log. The WAL handle
    /// itself closes when the node is dropped, after the loops have
    /// stopped; the log file is never reopened within a process.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.wal.lock().sync() {
            tracing::error!(error = %e, "failed to sync wal on shutdown");
        }
    }
}
