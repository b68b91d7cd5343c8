//! Durable message broker shared by peripheral and central nodes.

pub mod sqlite_broker;

pub use sqlite_broker::{BrokerSettings, SqlCipherBroker};
