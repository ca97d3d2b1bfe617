//! Replicated coordination plane: command codec, deterministic FSM, and
//! the Raft node that carries committed commands to every replica.

pub mod command;
pub mod fsm;
pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use command::LogEvent;
pub use fsm::Fsm;
pub use node::RaftNode;
pub use state::{EntryPayload, LogEntry, RaftRole, RaftState};
