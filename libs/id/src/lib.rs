//! # ubot-id
//!
//! Identifier types shared by every UBot crate.
//!
//! ## Design Principles
//!
//! - Pools, contracts and results are identified by the SHA-256 digest of
//!   their packed bytes, so any node can recompute and verify an ID
//! - Hash IDs have one canonical text form (URL-safe base64, no padding) that
//!   is safe to embed in HTTP paths
//! - IDs are typed to prevent mixing a pool ID with a result hash
//!
//! ## Example
//!
//! ```
//! use ubot_id::PoolId;
//!
//! let pool_id = PoolId::of(b"packed starting contract");
//! let parsed: PoolId = pool_id.to_string().parse().unwrap();
//! assert_eq!(pool_id, parsed);
//! ```

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Length in bytes of every hash-based identifier.
pub const HASH_LEN: usize = 32;
