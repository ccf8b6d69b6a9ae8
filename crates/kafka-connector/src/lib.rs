//! Kafka connector for function gateways.
//!
//! The connector subscribes to Kafka topics matching a whitelist pattern,
//! keeps a periodically refreshed registry of the functions deployed behind
//! a gateway, and invokes every function routed to a message's topic over
//! HTTP. Functions that name an output topic get their response bodies
//! published back to Kafka.

pub mod config;
pub mod connector;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod invoker;
pub mod publisher;
pub mod registry;
pub mod router;

pub use config::ConnectorConfig;
pub use connector::run;
pub use error::{ConnectorError, ConnectorResult};
