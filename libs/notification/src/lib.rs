//! # ubot-notification
//!
//! Notification types and the binary packet codec that carries phase
//! messages between UBots.
//!
//! ## Design Principles
//!
//! - Notifications are immutable once constructed
//! - The set of notification types is closed; each type code has exactly one
//!   registered handler that owns its field layout
//! - Packets are decoded as a unit: one bad notification rejects the packet
//! - The sender of a packet must be present in the local [`NetConfig`]
//!
//! ## Packet Layout
//!
//! ```text
//! [packet_type:u8][from:u32][count:i32]( [type_code:u16][len:u32][body] )*
//! ```
//!
//! Every body starts with `[pool_id:32][is_answer:u8]`, followed by the
//! type-specific fields.

mod codec;
mod error;
mod node;
mod types;

pub use codec::*;
pub use error::{CodecError, NetConfigError};
pub use node::{NetConfig, NodeDescriptor};
pub use types::*;
