//! netprobe - concurrent network probing engine.
//!
//! Periodically probes targets over TCP, HTTP or ICMP, keeps the latest
//! outcome per target in a shared store, and runs one-shot port scans over
//! a fixed-size worker pool.

pub mod config;
pub mod engine;
pub mod pool;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod store;
