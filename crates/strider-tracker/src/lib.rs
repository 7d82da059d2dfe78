//! The instance tracker — authoritative state machine of every instance.
//!
//! All mutations flow through a single writer task behind a bounded
//! mailbox: operations on the same instance id apply in submission
//! order, every applied effect is persisted before the caller hears
//! back, and events are published per effect. Overflow fails fast,
//! timeouts surface to the caller while the accepted operation still
//! runs.

mod error;
mod expiry;
mod tracker;
mod updater;

pub use error::{TrackerError, TrackerResult};
pub use expiry::{SweepStats, UnreachableReaper, UnreachableStrategyResolver};
pub use tracker::{InstanceTracker, TrackerConfig};
pub use updater::{Effect, Op, StatusUpdate};
