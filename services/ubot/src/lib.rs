//! UBot node library.
//!
//! The crate ships the `ubot` binary; the library surface exists for
//! integration testing and embedding several nodes in one process.

pub mod actor;
pub mod api;
pub mod caches;
pub mod client;
pub mod config;
pub mod contract;
pub mod executor;
pub mod node;
pub mod pool;
pub mod process;
pub mod processor;
pub mod state;
pub mod storage;
pub mod transport;
