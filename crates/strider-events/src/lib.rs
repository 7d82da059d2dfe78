//! In-process event stream.
//!
//! Components publish [`Event`]s through an [`EventBus`]; subscribers
//! read from per-subscriber bounded buffers. Publication never blocks
//! the publisher — a slow subscriber loses its oldest events instead.

mod bus;
mod types;

pub use bus::{EventBus, Subscription};
pub use types::{DeploymentEventKind, Event, InstanceChange};
