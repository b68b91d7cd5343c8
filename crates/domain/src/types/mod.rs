//! Domain types

pub mod audit;
pub mod broker;
pub mod cross_reference;
pub mod messages;

pub use audit::*;
pub use broker::*;
pub use cross_reference::*;
pub use messages::*;
