//! Leadership — consumed, not implemented.
//!
//! An external coordinator elects exactly one leader; the core only
//! observes the verdict and can relinquish it. [`LocalLeadership`] is
//! the in-process stand-in for tests and single-node operation.

use tokio::sync::watch;
use tracing::info;

/// The leadership interface the adapter consumes.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
    /// Observe leadership changes.
    fn subscribe(&self) -> watch::Receiver<bool>;
    /// Give leadership up.
    fn abdicate(&self);
}

/// Process-local leadership for tests and standalone mode.
pub struct LocalLeadership {
    state: watch::Sender<bool>,
}

impl LocalLeadership {
    pub fn new(leader: bool) -> Self {
        Self {
            state: watch::Sender::new(leader),
        }
    }

    /// Become leader (the coordinator's side of the interface).
    pub fn elect(&self) {
        if !self.state.send_replace(true) {
            info!("leadership acquired");
        }
    }
}

impl Leadership for LocalLeadership {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn abdicate(&self) {
        if self.state.send_replace(false) {
            info!("leadership abdicated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elect_and_abdicate() {
        let leadership = LocalLeadership::new(false);
        assert!(!leadership.is_leader());

        leadership.elect();
        assert!(leadership.is_leader());

        let mut sub = leadership.subscribe();
        leadership.abdicate();
        assert!(!leadership.is_leader());
        assert!(sub.has_changed().unwrap());
    }
}
