//! Atomic switch: interrupt scheduling for a high-impact signal, evaluate it
//! through the opportunity pipeline, and resume scheduling whatever happens.
//!
//! Also hosts the composition root: [`InterlockConfig`] and the
//! `interlock-worker` binary.

pub mod config;
pub mod control;
pub mod error;
pub mod switch;

pub use config::{InterlockConfig, SwitchConfig};
pub use control::SchedulingControl;
pub use error::{ConfigError, SwitchError};
pub use switch::{AtomicSwitch, PipelineOutcome, SignalDisposition, SwitchMetrics, SwitchReport};
