//! Executor façade.
//!
//! Owns the live inventory and is the only component that mutates cluster
//! membership. Host operations live in [`crate::hosts`], container
//! operations in [`crate::containers`]; both are `impl Executor` blocks.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use edgegrid_placement::{HostProbe, HostProvisioner, PlacementSelector, closest_region, region_by_zone};
use edgegrid_state::{
    CloudInstance, ContainerRecord, Coordinates, DecisionRecord, HostKind, HostLocation, HostRecord,
    NodeRole, StateResult, StateStore,
};

use crate::backends::{CloudProvider, CommandRunner, ContainerRuntime, SwarmApi};
use crate::cloud::{CloudManager, CloudSettings};
use crate::context::ExecContext;
use crate::deferred::DeferredTasks;
use crate::error::{ExecutorError, ExecutorResult};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked after every executed decision, for audit logging.
pub type DecisionCallback = Arc<dyn Fn(DecisionRecord) -> BoxFuture + Send + Sync>;

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Attempts of the whole join sequence before a host is unreachable.
    pub join_attempts: u32,
    /// Catalog service run on every host before it joins.
    pub proxy_service: Option<String>,
    /// Catalog services run on every host after it joins.
    pub background_services: Vec<String>,
    /// Grace period between a migration's replica and the original's stop.
    pub migration_stop_delay: Duration,
    pub avoid_region: Option<String>,
    pub cloud: CloudSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            join_attempts: 5,
            proxy_service: None,
            background_services: Vec::new(),
            migration_stop_delay: Duration::from_secs(60),
            avoid_region: None,
            cloud: CloudSettings::default(),
        }
    }
}

/// The external capabilities the executor is wired with.
#[derive(Clone)]
pub struct Backends {
    pub runner: Arc<dyn CommandRunner>,
    pub cloud: Arc<dyn CloudProvider>,
    pub swarm: Arc<dyn SwarmApi>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn HostProbe>,
}

/// Point-in-time view of everything the executor manages.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub hosts: Vec<HostRecord>,
    pub containers: Vec<ContainerRecord>,
    pub cloud_instances: Vec<CloudInstance>,
}

impl Inventory {
    /// Read the inventory straight from the store.
    pub fn load(state: &StateStore) -> StateResult<Self> {
        Ok(Self {
            hosts: state.list_hosts()?,
            containers: state.list_containers()?,
            cloud_instances: state.list_cloud_instances()?,
        })
    }
}

pub struct Executor {
    pub(crate) state: StateStore,
    pub(crate) context: ExecContext,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) swarm: Arc<dyn SwarmApi>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) probe: Arc<dyn HostProbe>,
    pub(crate) cloud: CloudManager,
    pub(crate) deferred: DeferredTasks,
    pub(crate) settings: ExecutorSettings,
    on_decision_executed: Option<DecisionCallback>,
}

impl Executor {
    pub fn new(state: StateStore, context: ExecContext, backends: Backends, settings: ExecutorSettings) -> Self {
        let cloud = CloudManager::new(backends.cloud, state.clone(), settings.cloud.clone());
        Self {
            state,
            context,
            runner: backends.runner,
            swarm: backends.swarm,
            runtime: backends.runtime,
            probe: backends.probe,
            cloud,
            deferred: DeferredTasks::new(),
            settings,
            on_decision_executed: None,
        }
    }

    pub fn with_decision_callback(mut self, callback: DecisionCallback) -> Self {
        self.on_decision_executed = Some(callback);
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn context(&self) -> &ExecContext {
        &self.context
    }

    pub fn cloud(&self) -> &CloudManager {
        &self.cloud
    }

    pub fn deferred(&self) -> &DeferredTasks {
        &self.deferred
    }

    /// A placement selector that provisions through this executor.
    pub fn placement(self: &Arc<Self>) -> PlacementSelector {
        let provisioner: Arc<dyn HostProvisioner> = self.clone();
        PlacementSelector::new(self.state.clone(), self.probe.clone(), provisioner)
            .with_avoid_region(self.settings.avoid_region.clone())
    }

    pub fn current_inventory(&self) -> ExecutorResult<Inventory> {
        Ok(Inventory::load(&self.state)?)
    }

    /// Persist an executed decision and notify the audit callback.
    pub async fn decision_executed(&self, record: DecisionRecord) -> ExecutorResult<()> {
        self.state.put_decision(&record)?;
        debug!(entity = %record.entity_id, decision = %record.decision, result = %record.result, "decision recorded");
        if let Some(callback) = &self.on_decision_executed {
            callback(record).await;
        }
        Ok(())
    }

    /// Obtain a cloud instance near `coordinates`, register it and join it.
    pub async fn provision_cloud_host(&self, coordinates: Coordinates) -> ExecutorResult<HostRecord> {
        let in_swarm: HashSet<String> = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(HostRecord::is_active)
            .map(|h| h.address)
            .collect();
        let instance = self.cloud.choose_instance(coordinates, &in_swarm).await?;
        let address = instance
            .public_address
            .clone()
            .ok_or_else(|| ExecutorError::NotFound(format!("public address of {}", instance.instance_id)))?;

        let host = match self.state.get_host(&address)? {
            Some(known) => known,
            None => {
                let host = cloud_host_record(&instance, &address, coordinates);
                self.state.put_host(&host)?;
                host
            }
        };
        info!(host = %host.address, instance = %instance.instance_id, "cloud host provisioned");
        self.join_host(&host.address, NodeRole::Worker).await
    }

    /// Cancel every pending deferred action.
    pub async fn shutdown(&self) {
        self.deferred.cancel_all().await;
    }
}

#[async_trait]
impl HostProvisioner for Executor {
    async fn provision_near(&self, coordinates: Coordinates) -> anyhow::Result<HostRecord> {
        Ok(self.provision_cloud_host(coordinates).await?)
    }
}

fn cloud_host_record(instance: &CloudInstance, address: &str, near: Coordinates) -> HostRecord {
    let region = region_by_zone(&instance.zone).unwrap_or_else(|| closest_region(near));
    HostRecord {
        address: address.to_string(),
        private_address: instance
            .private_address
            .clone()
            .unwrap_or_else(|| address.to_string()),
        kind: HostKind::Cloud,
        location: HostLocation {
            continent: region.continent.to_string(),
            region: region.continent.to_string(),
            country: region.zone.to_string(),
            city: region.name.to_string(),
            coordinates: region.coordinates,
        },
        instance_id: Some(instance.instance_id.clone()),
        node: None,
        memory_bytes: 0,
        updated_at: epoch_secs(),
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
