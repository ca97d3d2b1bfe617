use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// What a log entry carries.
///
/// Commands are opaque bytes produced by the command codec; only the FSM
/// interprets them. `AddVoter` entries are handled by the consensus layer
/// itself so that membership survives restarts through the same log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    Command(Vec<u8>),
    AddVoter { id: String, addr: String },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// Consensus bookkeeping for one node.
///
/// # Safety invariants
///
/// - *Election safety*: one vote per term (`voted_for`), majority required.
/// - *Log matching*: the `prev_log_index`/`prev_log_term` consistency check
///   truncates conflicting suffixes before appending.
/// - *Leader completeness*: votes are only granted to candidates whose log
///   is at least as up-to-date (`is_log_up_to_date`), and leaders only
///   advance `commit_index` over entries from their own term.
/// - *State machine safety*: entries are applied in index order, once,
///   after commit (`last_applied <= commit_index`).
///
/// The in-memory log is a suffix of the full log: entries up to
/// `snapshot_index` have been folded into an FSM snapshot and compacted
/// away. All index arithmetic goes through `get_entry`/`last_log_index`
/// so the offset is handled in one place.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state (mirrored to the WAL)
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,

    // Compaction point: the last entry covered by a snapshot
    pub snapshot_index: u64,
    pub snapshot_term: u64,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    pub role: RaftRole,
    pub leader_id: Option<String>,
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Get the log entry at `index`, if it is still present (not compacted)
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 || index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`; falls back to the snapshot term at the
    /// compaction boundary.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get entries starting from `start_index` (inclusive)
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        self.log
            .iter()
            .filter(|e| e.index >= start_index)
            .cloned()
            .collect()
    }

    /// Append a new entry in the current term
    pub fn append_entry(&mut self, payload: EntryPayload) -> LogEntry {
        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            payload,
        };
        self.log.push(entry.clone());
        entry
    }

    /// Truncate the log from `from_index` (inclusive) and append `entries`
    pub fn truncate_and_append(&mut self, from_index: u64, entries: Vec<LogEntry>) {
        if from_index > self.snapshot_index {
            let keep = (from_index - self.snapshot_index - 1) as usize;
            if keep < self.log.len() {
                self.log.truncate(keep);
            }
        } else {
            self.log.clear();
        }
        self.log.extend(entries);
    }

    /// Drop entries covered by a snapshot taken through `index`
    pub fn compact_to(&mut self, index: u64, term: u64) {
        self.log.retain(|e| e.index > index);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower state
    pub fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received = 0;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: &str) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id.to_string());
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: &str, peer_ids: &[String]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id.to_string());

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in peer_ids {
            self.next_index.insert(peer_id.clone(), next);
            self.match_index.insert(peer_id.clone(), 0);
        }
    }

    /// Register a freshly added voter on the leader side
    pub fn track_peer(&mut self, peer_id: &str) {
        if self.role != RaftRole::Leader {
            return;
        }
        self.next_index
            .entry(peer_id.to_string())
            .or_insert(self.snapshot_index + 1);
        self.match_index.entry(peer_id.to_string()).or_insert(0);
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EntryPayload {
        EntryPayload::Command(Vec::new())
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert!(state.log.is_empty());
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate("node-1");

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("node-1"));
        assert_eq!(state.votes_received, 1); // Self-vote
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = RaftState::new();
        state.become_candidate("node-1");
        state.become_leader("node-1", &["node-2".to_string(), "node-3".to_string()]);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id.as_deref(), Some("node-1"));
        assert_eq!(state.next_index.get("node-2"), Some(&1));
        assert_eq!(state.match_index.get("node-3"), Some(&0));
    }

    #[test]
    fn test_become_follower_resets_vote() {
        let mut state = RaftState::new();
        state.become_candidate("node-1");
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.votes_received, 0);
    }

    #[test]
    fn test_append_and_get_entry() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_entry(noop());
        state.current_term = 2;
        state.append_entry(noop());

        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.last_log_term(), 2);
        assert!(state.get_entry(0).is_none());
        assert_eq!(state.get_entry(1).unwrap().term, 1);
        assert_eq!(state.get_entry(2).unwrap().term, 2);
        assert!(state.get_entry(3).is_none());
    }

    #[test]
    fn test_entries_from() {
        let mut state = RaftState::new();
        state.current_term = 1;
        for _ in 0..3 {
            state.append_entry(noop());
        }

        assert_eq!(state.entries_from(2).len(), 2);
        assert_eq!(state.entries_from(1).len(), 3);
        assert!(state.entries_from(10).is_empty());
    }

    #[test]
    fn test_truncate_and_append() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_entry(noop());
        state.append_entry(noop());
        state.append_entry(noop());

        let replacement = vec![
            LogEntry {
                term: 2,
                index: 2,
                payload: noop(),
            },
            LogEntry {
                term: 2,
                index: 3,
                payload: noop(),
            },
        ];
        state.truncate_and_append(2, replacement);

        assert_eq!(state.log.len(), 3);
        assert_eq!(state.get_entry(1).unwrap().term, 1);
        assert_eq!(state.get_entry(2).unwrap().term, 2);
        assert_eq!(state.get_entry(3).unwrap().term, 2);
    }

    #[test]
    fn test_compaction_offsets_indices() {
        let mut state = RaftState::new();
        state.current_term = 1;
        for _ in 0..5 {
            state.append_entry(noop());
        }
        state.commit_index = 5;

        state.compact_to(3, 1);

        assert_eq!(state.snapshot_index, 3);
        assert_eq!(state.log.len(), 2);
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.get_entry(4).unwrap().index, 4);
        assert_eq!(state.last_log_index(), 5);
        assert_eq!(state.term_at(3), Some(1));

        // Appending after compaction continues the global index sequence.
        let entry = state.append_entry(noop());
        assert_eq!(entry.index, 6);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();

        // Empty log: anything is up-to-date
        assert!(state.is_log_up_to_date(0, 0));
        assert!(state.is_log_up_to_date(1, 1));

        state.current_term = 1;
        state.append_entry(noop());
        state.current_term = 2;
        state.append_entry(noop());

        // Higher term is always up-to-date
        assert!(state.is_log_up_to_date(1, 3));
        // Same term, same or higher index
        assert!(state.is_log_up_to_date(2, 2));
        assert!(state.is_log_up_to_date(3, 2));
        // Lower term is never up-to-date
        assert!(!state.is_log_up_to_date(5, 1));
        // Same term, lower index
        assert!(!state.is_log_up_to_date(1, 2));
    }
}
