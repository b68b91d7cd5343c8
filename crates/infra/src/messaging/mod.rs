//! Queue consumers running against the message broker.

pub mod consumer_pool;
pub mod errors;
pub mod metered_broker;

pub use consumer_pool::{ConsumerPool, ConsumerPoolConfig};
pub use errors::WorkerError;
pub use metered_broker::MeteredBroker;
