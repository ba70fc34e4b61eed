//! Host monitoring cycle.
//!
//! Every cycle samples each active host of the owned region in parallel,
//! evaluates host rules, and arbitrates at most one START or STOP across
//! all hosts. The chosen action runs on its own task; while it runs, later
//! cycles keep evaluating but skip arbitration, so the host count checked
//! against the bounds is never stale.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use edgegrid_metrics::{MetricTracker, Samples};
use edgegrid_rules::{RuleStore, SessionCache};
use edgegrid_state::{EntityKind, HostRecord, StateStore};

use crate::actions::{HostActions, MetricSource};
use crate::arbiter::{Bounds, HostPlan, HostThresholds, arbitrate_hosts};
use crate::cycle::{decision_record, evaluate_entity, forget_missing, in_region};
use crate::events::EventAccumulator;

#[derive(Debug, Clone, Default)]
pub struct HostMonitorSettings {
    pub thresholds: HostThresholds,
    /// Active host floor and ceiling (`max` 0 = unbounded).
    pub bounds: Bounds,
    /// Only hosts of this region are monitored. `None` monitors all.
    pub region: Option<String>,
}

pub struct HostMonitor {
    state: StateStore,
    tracker: MetricTracker,
    rules: SessionCache,
    events: EventAccumulator,
    metrics: Arc<dyn MetricSource>,
    actions: Arc<dyn HostActions>,
    settings: HostMonitorSettings,
    action_lock: Arc<Mutex<()>>,
    last_cycle: Option<Instant>,
    known: HashSet<String>,
}

impl HostMonitor {
    pub fn new(
        state: StateStore,
        tracker: MetricTracker,
        rules: Arc<dyn RuleStore>,
        metrics: Arc<dyn MetricSource>,
        actions: Arc<dyn HostActions>,
        settings: HostMonitorSettings,
    ) -> Self {
        Self {
            events: EventAccumulator::new(state.clone()),
            state,
            tracker,
            rules: SessionCache::new(rules),
            metrics,
            actions,
            settings,
            action_lock: Arc::new(Mutex::new(())),
            last_cycle: None,
            known: HashSet::new(),
        }
    }

    pub fn events(&self) -> &EventAccumulator {
        &self.events
    }

    /// Run one monitoring cycle. Returns the action scheduled, if any.
    pub async fn cycle(&mut self) -> anyhow::Result<Option<HostPlan>> {
        self.rules.refresh()?;
        let now = Instant::now();
        let elapsed = self.last_cycle.map(|t| now - t).unwrap_or(Duration::ZERO);
        self.last_cycle = Some(now);

        let hosts: Vec<HostRecord> = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(|h| h.is_active() && in_region(self.settings.region.as_deref(), &h.location.region))
            .collect();
        let current = hosts.iter().map(|h| h.address.clone()).collect();
        self.known = forget_missing(
            &self.tracker,
            &mut self.rules,
            &self.events,
            EntityKind::Host,
            &self.known,
            current,
        )?;

        let mut stats = self.collect_stats(&hosts).await;
        let mut candidates = Vec::with_capacity(hosts.len());
        for host in &hosts {
            let samples = match stats.remove(&host.address) {
                Some(Ok(samples)) => samples,
                Some(Err(e)) => {
                    warn!(host = %host.address, error = %e, "host stats unavailable");
                    continue;
                }
                None => continue,
            };
            match evaluate_entity(
                &self.tracker,
                &mut self.rules,
                &self.events,
                EntityKind::Host,
                &host.address,
                &[host.address.as_str()],
                samples,
                elapsed,
            ) {
                Ok(evaluation) => candidates.push(evaluation.into_candidate(&host.address, host.is_manager())),
                Err(e) => warn!(host = %host.address, error = %e, "host evaluation failed"),
            }
        }

        let Ok(guard) = self.action_lock.clone().try_lock_owned() else {
            debug!("host action in progress, arbitration skipped");
            return Ok(None);
        };
        let active = u32::try_from(hosts.len()).unwrap_or(u32::MAX);
        let Some(plan) = arbitrate_hosts(&candidates, &self.settings.thresholds, self.settings.bounds, active) else {
            return Ok(None);
        };

        let candidate = plan.candidate();
        self.events.reset(EntityKind::Host, &candidate.entity_id)?;
        info!(
            host = %candidate.entity_id,
            decision = %plan.kind(),
            count = candidate.count,
            active,
            "host action scheduled"
        );

        let actions = self.actions.clone();
        let scheduled = plan.clone();
        tokio::spawn(async move {
            let _guard = guard;
            execute(actions, scheduled).await;
        });
        Ok(Some(plan))
    }

    /// Wait until the action scheduled by a previous cycle finished.
    pub async fn settle(&self) {
        drop(self.action_lock.lock().await);
    }

    /// Run the monitoring loop until `shutdown` changes.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "host monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.cycle().await {
                        error!(error = %e, "host monitoring cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("host monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn collect_stats(&self, hosts: &[HostRecord]) -> HashMap<String, anyhow::Result<Samples>> {
        let mut tasks = JoinSet::new();
        for host in hosts {
            let metrics = self.metrics.clone();
            let host = host.clone();
            tasks.spawn(async move {
                let stats = metrics.host_stats(&host).await;
                (host.address, stats)
            });
        }

        let mut stats = HashMap::with_capacity(hosts.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((address, result)) => {
                    stats.insert(address, result);
                }
                Err(e) => warn!(error = %e, "host stats task failed"),
            }
        }
        stats
    }
}

async fn execute(actions: Arc<dyn HostActions>, plan: HostPlan) {
    let candidate = plan.candidate();
    let outcome = match &plan {
        HostPlan::Start(c) => actions
            .start_host_near(&c.entity_id)
            .await
            .map(|started| format!("started host {}", started.address)),
        HostPlan::Stop(c) => actions
            .stop_host(&c.entity_id)
            .await
            .map(|()| format!("stopped host {}", c.entity_id)),
    };

    match outcome {
        Ok(result) => {
            info!(host = %candidate.entity_id, decision = %plan.kind(), %result, "decision executed");
            let record = decision_record(EntityKind::Host, candidate, None, plan.kind(), result);
            if let Err(e) = actions.decision_executed(record).await {
                warn!(host = %candidate.entity_id, error = %e, "decision audit failed");
            }
        }
        Err(e) => error!(host = %candidate.entity_id, decision = %plan.kind(), error = %e, "host action failed"),
    }
}
