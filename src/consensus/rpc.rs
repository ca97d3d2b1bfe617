//! Pure RPC handlers for the consensus protocol, plus conversions between
//! internal log entries and their protobuf representation.
//!
//! Handlers take the state and the WAL explicitly so they can be exercised
//! in tests without a running node; stable-state and log changes are
//! persisted before the response leaves the handler.

use std::io;

use crate::consensus::state::{EntryPayload, LogEntry, RaftRole, RaftState};
use crate::consensus::storage::WalStore;
use crate::proto::{
    log_entry, AddVoter as ProtoAddVoter, AppendEntriesRequest, AppendEntriesResponse,
    LogEntry as ProtoLogEntry, VoteRequest, VoteResponse,
};

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    wal: &mut WalStore,
    req: &VoteRequest,
    my_id: &str,
) -> io::Result<VoteResponse> {
    let stable_before = (state.current_term, state.voted_for.clone());

    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some()
        && state.voted_for.as_deref() != Some(req.candidate_id.as_str())
    {
        // Already voted for someone else this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id.clone());
        true
    };

    if (state.current_term, state.voted_for.clone()) != stable_before {
        wal.append_stable(state.current_term, state.voted_for.as_deref())?;
    }

    tracing::debug!(
        node_id = my_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    Ok(VoteResponse {
        term: state.current_term,
        vote_granted,
    })
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    wal: &mut WalStore,
    req: &AppendEntriesRequest,
    my_id: &str,
) -> io::Result<AppendEntriesResponse> {
    let stable_before = (state.current_term, state.voted_for.clone());

    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        return Ok(AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: state.last_log_index(),
        });
    }

    // Valid AppendEntries from the current leader; candidates step down
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id.clone());

    if (state.current_term, state.voted_for.clone()) != stable_before {
        wal.append_stable(state.current_term, state.voted_for.as_deref())?;
    }

    // Consistency check. Entries at or below the snapshot point are
    // committed and match by construction; only the live suffix is checked.
    if req.prev_log_index > state.snapshot_index {
        match state.term_at(req.prev_log_index) {
            None => {
                // We don't have the entry at prev_log_index yet
                return Ok(AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.last_log_index(),
                });
            }
            Some(term) if term != req.prev_log_term => {
                // Conflicting entry: drop it and everything after it
                state.truncate_and_append(req.prev_log_index, Vec::new());
                wal.append_truncate(req.prev_log_index)?;
                return Ok(AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.last_log_index(),
                });
            }
            Some(_) => {}
        }
    }

    let new_entries: Vec<LogEntry> = req
        .entries
        .iter()
        .filter_map(|proto| match entry_from_proto(proto) {
            Some(entry) => Some(entry),
            None => {
                tracing::warn!(
                    node_id = my_id,
                    term = proto.term,
                    index = proto.index,
                    "skipping log entry without payload"
                );
                None
            }
        })
        .filter(|e| e.index > state.snapshot_index)
        .collect();

    if !new_entries.is_empty() {
        let start_index = new_entries[0].index;
        wal.append_truncate(start_index)?;
        for entry in &new_entries {
            wal.append_entry(entry)?;
        }
        state.truncate_and_append(start_index, new_entries);

        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len(),
            new_last_index = state.last_log_index(),
            "appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = req.leader_commit.min(state.last_log_index());
    }

    Ok(AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: state.last_log_index(),
    })
}

/// Convert an internal log entry to its protobuf form
pub fn entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    let payload = match &entry.payload {
        EntryPayload::Command(data) => log_entry::Payload::Command(data.clone()),
        EntryPayload::AddVoter { id, addr } => log_entry::Payload::AddVoter(ProtoAddVoter {
            id: id.clone(),
            addr: addr.clone(),
        }),
    };
    ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        payload: Some(payload),
    }
}

/// Convert a protobuf log entry back; `None` if the payload is missing
pub fn entry_from_proto(proto: &ProtoLogEntry) -> Option<LogEntry> {
    let payload = match proto.payload.as_ref()? {
        log_entry::Payload::Command(data) => EntryPayload::Command(data.clone()),
        log_entry::Payload::AddVoter(voter) => EntryPayload::AddVoter {
            id: voter.id.clone(),
            addr: voter.addr.clone(),
        },
    };
    Some(LogEntry {
        term: proto.term,
        index: proto.index,
        payload,
    })
}
