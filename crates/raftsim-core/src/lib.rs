//! raftsim Core - Fundamental types shared by the harness crates
//!
//! This crate defines:
//! - Identifiers (NodeId)
//! - The routed message unit (Envelope)
//! - The harness error taxonomy

pub mod id;
pub mod envelope;
pub mod error;

pub use id::*;
pub use envelope::*;
pub use error::*;
