//! # Clinisync Node
//!
//! Process wiring for a peripheral clinic node or the central aggregator.
//!
//! This crate contains:
//! - The node context (dependency injection and worker lifecycle)
//! - Logging setup
//! - The `clinisync-node` binary
//!
//! ## Architecture
//! - Depends on `domain`, `core` and `infra`
//! - Wires up the hexagonal architecture for one node role

pub mod context;
pub mod utils;

pub use context::{NodeContext, NodeServices};
