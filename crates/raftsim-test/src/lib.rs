//! raftsim Test Harness - Simulated network for consensus testing
//!
//! This crate provides:
//! - Seedable fault injection (loss, duplication, delay, partitions)
//! - An in-process network fabric routing envelopes between mailboxes
//! - A per-node event loop driving any `ConsensusEngine`
//! - A cluster driver for leader election and commit scenarios

pub mod adapter;
pub mod cluster;
pub mod fabric;
pub mod fault;
pub mod logging;
pub mod routing;
pub mod runner;

pub use adapter::*;
pub use cluster::*;
pub use fabric::*;
pub use fault::*;
pub use routing::*;
pub use runner::*;
