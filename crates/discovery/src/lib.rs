//! Discovery propagation bus.
//!
//! Successful task runs that surface something notable produce a
//! [`Discovery`]. The [`DiscoveryBus`] fans each one out synchronously to
//! local subscribers, keeps a bounded history, and mirrors that history to a
//! [`DurableStore`](interlock_core::DurableStore) on a timer.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;

pub use bus::{BusMetrics, DeliveryReport, DiscoveryBus, DiscoverySubscriber, FlushOutcome, SubscriptionId};
pub use config::BusConfig;
pub use discovery::Discovery;
pub use error::SubscriberError;
