pub mod aggregator;
pub mod api;
pub mod config;
pub mod consensus;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod node;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("raft");
}
