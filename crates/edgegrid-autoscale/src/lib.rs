//! edgegrid-autoscale — the decision loop.
//!
//! Two independent monitors, one for hosts and one for services, turn raw
//! samples into at most one action per scope per cycle.
//!
//! # Cycle
//!
//! ```text
//! for each entity (stats fetched in parallel):
//!     fields   = tracker.observe(entity, samples)      // empty on cold start
//!     decision = rules.evaluate(fields)                // lowest priority wins
//!     count    = events.record(entity, decision)       // None keeps the streak
//!
//! relevant = entities with count >= threshold[decision], most urgent first
//!
//! hosts:    START if max == 0 || active < max
//!           STOP  if active > min, least urgent non-manager STOP
//! services: REPLICATE unconditionally if replicas < min
//!           REPLICATE if max == 0 || replicas < max
//!           MIGRATE   always
//!           STOP      if replicas > min, least urgent STOP
//! ```
//!
//! Scheduling an action resets the entity's streak and hands the action to
//! a task holding the monitor's arbitration lock; cycles that find the lock
//! taken skip arbitration.

pub mod actions;
pub mod arbiter;
mod cycle;
pub mod events;
pub mod host_monitor;
pub mod recovery;
pub mod service_monitor;

#[cfg(test)]
pub(crate) mod mock;

pub use actions::{HostActions, LocationSource, MetricSource, NoLocations, ServiceActions};
pub use arbiter::{
    Bounds, Candidate, HostPlan, HostThresholds, ServicePlan, ServiceThresholds, arbitrate_hosts,
    arbitrate_service,
};
pub use events::EventAccumulator;
pub use host_monitor::{HostMonitor, HostMonitorSettings};
pub use recovery::{RecoveryEntry, RecoveryPolicy};
pub use service_monitor::{ServiceMonitor, ServiceMonitorSettings};
