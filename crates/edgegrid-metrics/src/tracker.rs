//! Metric tracker: folds raw samples into running statistics.
//!
//! The tracker owns every [`FieldStatistic`] in the state store. Monitors
//! call [`MetricTracker::observe`] once per entity per cycle: it derives the
//! event fields from the existing statistics and then records the samples.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use edgegrid_state::{FieldStatistic, MonitoringLogEntry, StateResult, StateStore};

/// A `field → value` map as produced by the collector.
pub type Samples = HashMap<String, f64>;

/// Cumulative counters that also get a `<field>-per-sec` rate.
pub const RATE_FIELDS: [&str; 2] = ["rx-bytes", "tx-bytes"];

const PERCENTAGE: f64 = 0.01;

/// Running statistics per (entity, field).
#[derive(Clone)]
pub struct MetricTracker {
    state: StateStore,
    /// Append every recorded sample to the monitoring log.
    log_samples: bool,
}

impl MetricTracker {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            log_samples: false,
        }
    }

    /// Enable the monitoring log (test/audit mode).
    pub fn with_monitoring_log(mut self, enabled: bool) -> Self {
        self.log_samples = enabled;
        self
    }

    /// Fold one sample into the (entity, field) statistic.
    pub fn record(&self, entity: &str, field: &str, value: f64) -> StateResult<FieldStatistic> {
        let now = epoch_millis();
        let stat = match self.state.get_field_stat(entity, field)? {
            Some(mut stat) => {
                stat.update(value, now / 1000);
                stat
            }
            None => FieldStatistic::first(entity, field, value, now / 1000),
        };
        self.state.put_field_stat(&stat)?;

        if self.log_samples {
            self.state.append_monitoring_log(&MonitoringLogEntry {
                entity_id: entity.to_string(),
                field: field.to_string(),
                value,
                timestamp_ms: now,
            })?;
        }
        Ok(stat)
    }

    /// Record every sample in the map. Non-finite values are dropped.
    pub fn record_all(&self, entity: &str, samples: &Samples) -> StateResult<()> {
        for (field, &value) in samples {
            if !value.is_finite() {
                warn!(%entity, %field, value, "dropping non-finite sample");
                continue;
            }
            self.record(entity, field, value)?;
        }
        Ok(())
    }

    /// Derive the rule-facing fields for a set of raw samples.
    ///
    /// Only fields with at least one prior statistic contribute, so the
    /// result is empty until a baseline exists.
    pub fn derive_event_fields(&self, entity: &str, samples: &Samples) -> StateResult<Samples> {
        let mut derived = Samples::new();
        for stat in self.state.list_field_stats(entity)? {
            let Some(&value) = samples.get(&stat.field) else {
                continue;
            };
            if stat.count < 1 || !value.is_finite() {
                continue;
            }
            let field = &stat.field;
            let average = stat.average();
            derived.insert(format!("{field}-effective-val"), value);
            derived.insert(format!("{field}-avg-val"), average);
            if let Some(deviation) = deviation(value, average) {
                derived.insert(format!("{field}-deviation-%-on-avg-val"), deviation);
            }
            if let Some(deviation) = deviation(value, stat.last) {
                derived.insert(format!("{field}-deviation-%-on-last-val"), deviation);
            }
        }
        debug!(%entity, fields = derived.len(), "derived event fields");
        Ok(derived)
    }

    /// Derive event fields from history, then record the samples.
    pub fn observe(&self, entity: &str, samples: &Samples) -> StateResult<Samples> {
        let derived = self.derive_event_fields(entity, samples)?;
        self.record_all(entity, samples)?;
        Ok(derived)
    }

    /// Add `<field>-per-sec` rates for the cumulative network counters.
    ///
    /// The rate is `max(0, (value - last) / interval)` against the previously
    /// recorded `last`, or against 0 when the counter was never recorded.
    /// A rate already present in the samples is left alone.
    pub fn with_rates(&self, entity: &str, samples: &mut Samples, interval: Duration) -> StateResult<()> {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return Ok(());
        }
        for field in RATE_FIELDS {
            let rate_field = format!("{field}-per-sec");
            if samples.contains_key(&rate_field) {
                continue;
            }
            let Some(&value) = samples.get(field) else {
                continue;
            };
            let last = self
                .state
                .get_field_stat(entity, field)?
                .map(|s| s.last)
                .unwrap_or(0.0);
            samples.insert(rate_field, ((value - last) / secs).max(0.0));
        }
        Ok(())
    }

    /// Drop all statistics of an entity that no longer exists.
    pub fn forget(&self, entity: &str) -> StateResult<u32> {
        let removed = self.state.delete_field_stats(entity)?;
        debug!(%entity, removed, "field statistics dropped");
        Ok(removed)
    }
}

/// Percentage deviation of `value` from `base`; undefined for a zero base.
fn deviation(value: f64, base: f64) -> Option<f64> {
    if base == 0.0 {
        return None;
    }
    Some(((value - base) / base) / PERCENTAGE)
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
