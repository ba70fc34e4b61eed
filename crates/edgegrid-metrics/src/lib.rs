//! edgegrid-metrics — running statistics per (entity, field).
//!
//! Consumes the `field → value` maps produced by the external collector,
//! folds them into persisted [`FieldStatistic`]s, and derives the fields
//! rules are written against.
//!
//! # Derived fields
//!
//! ```text
//! <field>-effective-val            raw value
//! <field>-avg-val                  sum / count
//! <field>-deviation-%-on-avg-val   ((value - avg) / avg) / 0.01
//! <field>-deviation-%-on-last-val  ((value - last) / last) / 0.01
//! ```
//!
//! Derived fields are computed from the statistics as they stood *before*
//! the current sample, so an entity with no history yields nothing.
//!
//! [`FieldStatistic`]: edgegrid_state::FieldStatistic

pub mod tracker;

pub use tracker::{MetricTracker, Samples, RATE_FIELDS};
