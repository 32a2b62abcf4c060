//! Cancellable scheduled tasks.
//!
//! Phase protocols retry on a fixed period and give up at a deadline. Both
//! are expressed as [`ScheduledTask`] handles owned by the phase:
//!
//! - [`ScheduledTask::every`] runs a closure on a fixed period, first tick
//!   one period after creation
//! - [`ScheduledTask::after`] runs a closure once after a delay
//!
//! # Invariants
//!
//! - `cancel()` is idempotent; cancelling twice is a no-op
//! - Dropping a handle cancels the task
//! - A cancelled task starts no new tick or fire
//!
//! Cancellation is cooperative: work the closure already handed off (for
//! example a message in a mailbox) is not recalled.

mod backoff;
mod task;

pub use backoff::BackoffPolicy;
pub use task::ScheduledTask;
