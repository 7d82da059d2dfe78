//! The driver: everything that faces the resource broker and the
//! leadership coordinator.
//!
//! The [`SchedulerAdapter`] consumes the broker callback contract and
//! acts only while elected; outbound calls go through the
//! [`BrokerDriver`] trait so the native client stays out of the core.

mod adapter;
mod broker;
mod election;
mod error;
mod reconcile;

pub use adapter::{BrokerKiller, CrashStrategy, SchedulerAdapter, ABDICATION_GRACE};
pub use broker::{BrokerDriver, BrokerTaskStatus, DomainInfo, MasterInfo, OfferFilters};
pub use election::{Leadership, LocalLeadership};
pub use error::{DriverError, DriverResult};
pub use reconcile::{ReconcileStats, ReconciliationLoop};
