//! # Clinisync Domain
//!
//! Business domain types for clinical record synchronization.
//!
//! This crate contains:
//! - The broker message schema ([`SyncMessage`] and its variants)
//! - The pending-sync ledger and its state machine
//! - The set-once document cross-reference rule
//! - Domain error types and Result definitions
//! - Configuration structures
//!
//! ## Architecture
//! - No dependencies on other clinisync crates
//! - Pure data structures and rules, no I/O

pub mod config;
pub mod constants;
pub mod errors;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
