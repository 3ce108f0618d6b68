//! Per-application egress firewall controller: a rule engine backed by a
//! durable store, platform packet-filter enforcement, process attribution,
//! a periodic monitor loop, and an application-attributing L7 proxy.

pub mod attributor;
pub mod config;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod monitor;
pub mod proxy;
pub mod resolver;
pub mod store;

pub use config::AppConfig;
pub use engine::{Decision, RuleEngine};
pub use error::WardenError;
