//! Per-request telemetry dimensioning, caching and edge batching engine
//! for mesh proxies.
//!
//! The engine computes a vector of categorical dimension values for every
//! proxied request or TCP connection, resolves it through a per-worker
//! cache to ready-to-record stat handles, and accumulates observed
//! traffic relationships into size- and time-bounded batches for
//! asynchronous export.

pub mod bootstrap;
pub mod config;
pub mod dims;
pub mod edges;
pub mod engine;
pub mod export;
pub mod expr;
pub mod node;
pub mod request;
pub mod stats;
pub mod tcp;
pub mod worker;
