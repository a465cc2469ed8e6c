//! raftsim Engine - Consensus engine boundary
//!
//! This crate provides:
//! - The `ConsensusEngine` capability set the harness drives
//! - Ready batches and status snapshots
//! - A reference tick-driven Raft engine for exercising the harness

pub mod engine;
pub mod message;
pub mod raft;

pub use engine::*;
pub use message::*;
pub use raft::*;
