//! Service monitoring cycle.
//!
//! ```text
//! sync inventory ──► relaunch crashed containers (bounded by RecoveryPolicy)
//!        │
//!        ▼
//! stats per app container (parallel) ──► derive ──► rules ──► event counter
//!        │
//!        ▼
//! group by service ──► arbitrate_service(min/max replicas) ──► one action each
//! ```
//!
//! Crash relaunches and all actions chosen in a cycle run sequentially on
//! one task that holds the arbitration lock, so replica counts seen by the
//! next arbitration already include them. A service with a relaunch pending
//! is not arbitrated in the same cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use edgegrid_metrics::{MetricTracker, Samples};
use edgegrid_placement::{distance_km, weighted_middle_point};
use edgegrid_rules::{RuleStore, SessionCache};
use edgegrid_state::{
    ContainerRecord, Coordinates, EntityKind, HostLocation, ServiceType, StateStore, labels,
};

use crate::actions::{LocationSource, MetricSource, NoLocations, ServiceActions};
use crate::arbiter::{Bounds, Candidate, ServicePlan, ServiceThresholds, arbitrate_service};
use crate::cycle::{decision_record, epoch_millis, evaluate_entity, forget_missing, in_region};
use crate::events::EventAccumulator;
use crate::recovery::RecoveryPolicy;

#[derive(Debug, Clone, Default)]
pub struct ServiceMonitorSettings {
    pub thresholds: ServiceThresholds,
    /// Only containers of this region are monitored. `None` monitors all.
    pub region: Option<String>,
    /// Services never evaluated, on top of those typed as system services.
    pub system_services: Vec<String>,
    pub recovery: RecoveryPolicy,
}

/// An arbitrated action with everything needed to run it.
#[derive(Debug, Clone)]
struct Scheduled {
    plan: ServicePlan,
    container: ContainerRecord,
    target: HostLocation,
}

/// A crashed container cleared for relaunch, with the labels to add.
#[derive(Debug, Clone)]
struct Recovery {
    crashed: ContainerRecord,
    labels: HashMap<String, String>,
}

pub struct ServiceMonitor {
    state: StateStore,
    tracker: MetricTracker,
    rules: SessionCache,
    events: EventAccumulator,
    metrics: Arc<dyn MetricSource>,
    actions: Arc<dyn ServiceActions>,
    locations: Arc<dyn LocationSource>,
    settings: ServiceMonitorSettings,
    action_lock: Arc<Mutex<()>>,
    last_cycle: Option<Instant>,
    known: HashSet<String>,
}

impl ServiceMonitor {
    pub fn new(
        state: StateStore,
        tracker: MetricTracker,
        rules: Arc<dyn RuleStore>,
        metrics: Arc<dyn MetricSource>,
        actions: Arc<dyn ServiceActions>,
        settings: ServiceMonitorSettings,
    ) -> Self {
        Self {
            events: EventAccumulator::new(state.clone()),
            state,
            tracker,
            rules: SessionCache::new(rules),
            metrics,
            actions,
            locations: Arc::new(NoLocations),
            settings,
            action_lock: Arc::new(Mutex::new(())),
            last_cycle: None,
            known: HashSet::new(),
        }
    }

    /// Place replicas near where a service's requests come from.
    pub fn with_locations(mut self, locations: Arc<dyn LocationSource>) -> Self {
        self.locations = locations;
        self
    }

    pub fn events(&self) -> &EventAccumulator {
        &self.events
    }

    /// Whether a container takes part in monitoring and arbitration.
    pub fn is_monitored(&self, container: &ContainerRecord) -> bool {
        in_region(self.settings.region.as_deref(), &container.region)
            && container.label(labels::SERVICE_TYPE) != Some(ServiceType::System.as_str())
            && !self.settings.system_services.contains(&container.service_name)
    }

    /// Run one monitoring cycle. Returns the actions scheduled.
    pub async fn cycle(&mut self) -> anyhow::Result<Vec<ServicePlan>> {
        self.rules.refresh()?;
        let now = Instant::now();
        let elapsed = self.last_cycle.map(|t| now - t).unwrap_or(Duration::ZERO);
        self.last_cycle = Some(now);

        let recoveries = match self.actions.sync().await {
            Ok(crashed) => self.plan_recoveries(crashed),
            Err(e) => {
                warn!(error = %e, "container sync failed");
                Vec::new()
            }
        };
        let recovering: HashSet<String> = recoveries.iter().map(|r| r.crashed.service_name.clone()).collect();

        let containers: Vec<ContainerRecord> = self
            .state
            .list_containers()?
            .into_iter()
            .filter(|c| self.is_monitored(c))
            .collect();
        let current = containers.iter().map(|c| c.id.clone()).collect();
        self.known = forget_missing(
            &self.tracker,
            &mut self.rules,
            &self.events,
            EntityKind::Service,
            &self.known,
            current,
        )?;

        let mut stats = self.collect_stats(&containers).await;
        let mut by_service: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for container in &containers {
            let candidate = match stats.remove(&container.id) {
                Some(Ok(samples)) => self.evaluate(container, samples, elapsed),
                Some(Err(e)) => {
                    warn!(container = %container.id, error = %e, "container stats unavailable");
                    None
                }
                None => None,
            };
            let candidate = candidate.unwrap_or_else(|| Candidate {
                entity_id: container.id.clone(),
                decision: None,
                count: 0,
                protected: false,
                fields: HashMap::new(),
            });
            by_service
                .entry(container.service_name.clone())
                .or_default()
                .push(candidate);
        }

        let guard = match self.action_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("service actions in progress, arbitration skipped");
                if !recoveries.is_empty() {
                    let actions = self.actions.clone();
                    let lock = self.action_lock.clone();
                    tokio::spawn(async move {
                        let _guard = lock.lock_owned().await;
                        recover_all(actions.as_ref(), recoveries).await;
                    });
                }
                return Ok(Vec::new());
            }
        };

        let records: HashMap<&str, &ContainerRecord> = containers.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut scheduled = Vec::new();
        for (service, candidates) in &by_service {
            if recovering.contains(service) {
                debug!(%service, "crashed replica relaunching, not arbitrated");
                continue;
            }
            let spec = match self.state.get_service(service) {
                Ok(Some(spec)) => spec,
                Ok(None) => {
                    debug!(%service, "service not in catalog, not arbitrated");
                    continue;
                }
                Err(e) => {
                    warn!(%service, error = %e, "service lookup failed, not arbitrated");
                    continue;
                }
            };
            let bounds = Bounds::new(spec.min_replicas, spec.max_replicas);
            let Some(plan) = arbitrate_service(candidates, &self.settings.thresholds, bounds) else {
                continue;
            };
            let candidate = plan.candidate();
            let Some(container) = records.get(candidate.entity_id.as_str()) else {
                continue;
            };
            let target = match self.target_location(service, container) {
                Ok(target) => target,
                Err(e) => {
                    warn!(%service, container = %candidate.entity_id, error = %e, "no target location, action dropped");
                    continue;
                }
            };
            if let Err(e) = self.events.reset(EntityKind::Service, &candidate.entity_id) {
                warn!(%service, container = %candidate.entity_id, error = %e, "event reset failed, action dropped");
                continue;
            }
            info!(
                %service,
                container = %candidate.entity_id,
                decision = %plan.kind(),
                count = candidate.count,
                replicas = candidates.len(),
                "service action scheduled"
            );
            scheduled.push(Scheduled {
                target,
                container: (*container).clone(),
                plan,
            });
        }

        let plans: Vec<ServicePlan> = scheduled.iter().map(|s| s.plan.clone()).collect();
        if !scheduled.is_empty() || !recoveries.is_empty() {
            let actions = self.actions.clone();
            tokio::spawn(async move {
                let _guard = guard;
                recover_all(actions.as_ref(), recoveries).await;
                for action in scheduled {
                    execute(actions.as_ref(), action).await;
                }
            });
        }
        Ok(plans)
    }

    /// Wait until the actions scheduled by a previous cycle finished.
    pub async fn settle(&self) {
        drop(self.action_lock.lock().await);
    }

    /// Run the monitoring loop until `shutdown` changes.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "service monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.cycle().await {
                        error!(error = %e, "service monitoring cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("service monitor shutting down");
                    break;
                }
            }
        }
    }

    fn evaluate(&mut self, container: &ContainerRecord, samples: Samples, elapsed: Duration) -> Option<Candidate> {
        let keys = [container.id.as_str(), container.service_name.as_str()];
        match evaluate_entity(
            &self.tracker,
            &mut self.rules,
            &self.events,
            EntityKind::Service,
            &container.id,
            &keys,
            samples,
            elapsed,
        ) {
            Ok(evaluation) => Some(evaluation.into_candidate(&container.id, false)),
            Err(e) => {
                warn!(container = %container.id, error = %e, "container evaluation failed");
                None
            }
        }
    }

    /// Crashed containers that may still be relaunched, with their new
    /// recovery history.
    fn plan_recoveries(&self, crashed: Vec<ContainerRecord>) -> Vec<Recovery> {
        let now_ms = epoch_millis();
        crashed
            .into_iter()
            .filter(|c| self.is_monitored(c))
            .filter_map(|crashed| match self.settings.recovery.next_label(&crashed, now_ms) {
                Some(history) => Some(Recovery {
                    labels: HashMap::from([(labels::RECOVERY.to_string(), history)]),
                    crashed,
                }),
                None => {
                    warn!(
                        container = %crashed.id,
                        service = %crashed.service_name,
                        "container crashing too often, not recovering"
                    );
                    None
                }
            })
            .collect()
    }

    /// Where a new replica of `service` should go: the weighted middle of
    /// its request origins when known, else next to `container`.
    fn target_location(&self, service: &str, container: &ContainerRecord) -> anyhow::Result<HostLocation> {
        let origins = self.locations.request_locations(service)?;
        if let Some(middle) = weighted_middle_point(&origins) {
            return Ok(self.location_near(middle)?);
        }
        Ok(match self.state.get_host(&container.host_address)? {
            Some(host) => host.location,
            None => HostLocation {
                region: container.region.clone(),
                coordinates: container.coordinates,
                ..HostLocation::default()
            },
        })
    }

    /// The location of the known host nearest to `point`, moved onto it.
    fn location_near(&self, point: Coordinates) -> anyhow::Result<HostLocation> {
        let nearest = self.state.list_hosts()?.into_iter().min_by(|a, b| {
            distance_km(a.location.coordinates, point).total_cmp(&distance_km(b.location.coordinates, point))
        });
        let mut location = nearest.map(|h| h.location).unwrap_or_default();
        location.coordinates = point;
        Ok(location)
    }

    async fn collect_stats(&self, containers: &[ContainerRecord]) -> HashMap<String, anyhow::Result<Samples>> {
        let mut tasks = JoinSet::new();
        for container in containers {
            let metrics = self.metrics.clone();
            let container = container.clone();
            tasks.spawn(async move {
                let stats = metrics.container_stats(&container).await;
                (container.id, stats)
            });
        }

        let mut stats = HashMap::with_capacity(containers.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    stats.insert(id, result);
                }
                Err(e) => warn!(error = %e, "container stats task failed"),
            }
        }
        stats
    }
}

async fn recover_all(actions: &dyn ServiceActions, recoveries: Vec<Recovery>) {
    for Recovery { crashed, labels } in recoveries {
        match actions.recover(&crashed, labels).await {
            Ok(replacement) => info!(
                container = %crashed.id,
                replacement = %replacement.id,
                host = %replacement.host_address,
                "crashed container recovered"
            ),
            Err(e) => error!(container = %crashed.id, error = %e, "container recovery failed"),
        }
    }
}

async fn execute(actions: &dyn ServiceActions, scheduled: Scheduled) {
    let Scheduled {
        plan,
        container,
        target,
    } = scheduled;
    let outcome = match &plan {
        ServicePlan::Replicate { .. } => actions
            .replicate(&container, &target)
            .await
            .map(|replica| format!("replicated to {} on {}", replica.id, replica.host_address)),
        ServicePlan::Migrate(_) => actions
            .migrate(&container)
            .await
            .map(|replica| format!("migrating to {} on {}", replica.id, replica.host_address)),
        ServicePlan::Stop(_) => actions
            .stop(&container)
            .await
            .map(|()| format!("stopped on {}", container.host_address)),
    };

    match outcome {
        Ok(result) => {
            info!(
                container = %container.id,
                service = %container.service_name,
                decision = %plan.kind(),
                %result,
                "decision executed"
            );
            let record = decision_record(
                EntityKind::Service,
                plan.candidate(),
                Some(container.service_name.clone()),
                plan.kind(),
                result,
            );
            if let Err(e) = actions.decision_executed(record).await {
                warn!(container = %container.id, error = %e, "decision audit failed");
            }
        }
        Err(e) => error!(
            container = %container.id,
            decision = %plan.kind(),
            error = %e,
            "service action failed"
        ),
    }
}
