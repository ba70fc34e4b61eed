//! In-memory collaborators for monitor tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use edgegrid_metrics::Samples;
use edgegrid_rules::{Condition, Operator, Rule, RuleScope, ValueMode};
use edgegrid_state::{
    ContainerRecord, Coordinates, DecisionKind, DecisionRecord, EntityKind, HostKind, HostLocation, HostRecord,
    NodeMembership, NodeRole, NodeState, ServiceSpec, StateStore, labels,
};

use crate::actions::{HostActions, MetricSource, ServiceActions};

pub(crate) fn cpu(value: f64) -> Samples {
    HashMap::from([("cpu".to_string(), value)])
}

pub(crate) fn host(address: &str, manager: bool, region: &str) -> HostRecord {
    HostRecord {
        address: address.to_string(),
        private_address: address.to_string(),
        kind: HostKind::Edge,
        location: HostLocation {
            continent: region.to_string(),
            region: region.to_string(),
            country: "pt".to_string(),
            city: "lisbon".to_string(),
            coordinates: Coordinates::new(38.72, -9.14),
        },
        instance_id: None,
        node: Some(NodeMembership {
            node_id: format!("node-{address}"),
            role: if manager { NodeRole::Manager } else { NodeRole::Worker },
            state: NodeState::Ready,
        }),
        memory_bytes: 4 << 30,
        updated_at: 0,
    }
}

pub(crate) fn host_rule(
    id: u64,
    field: &str,
    mode: ValueMode,
    operator: Operator,
    value: f64,
    decision: DecisionKind,
    priority: i32,
) -> Rule {
    Rule {
        id,
        name: format!("rule-{id}"),
        kind: EntityKind::Host,
        scope: RuleScope::Generic,
        conditions: vec![Condition {
            field: field.to_string(),
            mode,
            operator,
            value,
        }],
        decision,
        priority,
        enabled: true,
    }
}

pub(crate) fn service_rule(
    id: u64,
    field: &str,
    operator: Operator,
    value: f64,
    decision: DecisionKind,
    priority: i32,
) -> Rule {
    Rule {
        kind: EntityKind::Service,
        ..host_rule(id, field, ValueMode::EffectiveVal, operator, value, decision, priority)
    }
}

pub(crate) fn catalog_service(name: &str, min_replicas: u32, max_replicas: u32) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: format!("edgegrid/{name}"),
        service_type: Default::default(),
        internal_port: 8080,
        external_port: 8080,
        launch_command: String::new(),
        output_label: format!("{name}Host"),
        min_replicas,
        max_replicas,
        expected_memory_bytes: 256 << 20,
        dependencies: Vec::new(),
    }
}

pub(crate) fn app_container(id: &str, service: &str, host_address: &str) -> ContainerRecord {
    ContainerRecord {
        id: id.to_string(),
        name: format!("{service}_{id}"),
        service_name: service.to_string(),
        host_address: host_address.to_string(),
        image: format!("edgegrid/{service}"),
        ports: Vec::new(),
        args: Vec::new(),
        labels: HashMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::SERVICE_NAME.to_string(), service.to_string()),
        ]),
        coordinates: Coordinates::new(38.72, -9.14),
        region: "europe".to_string(),
        created_at: 0,
    }
}

/// Scripted samples per entity; an entity without samples left fails.
#[derive(Default)]
pub(crate) struct MockMetrics {
    scripts: Mutex<HashMap<String, VecDeque<Samples>>>,
    failing: Mutex<HashSet<String>>,
}

impl MockMetrics {
    pub fn script(&self, entity: &str, samples: impl IntoIterator<Item = Samples>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(entity.to_string())
            .or_default()
            .extend(samples);
    }

    pub fn fail(&self, entity: &str) {
        self.failing.lock().unwrap().insert(entity.to_string());
    }

    fn next(&self, entity: &str) -> anyhow::Result<Samples> {
        if self.failing.lock().unwrap().contains(entity) {
            bail!("collector unreachable for {entity}");
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(entity)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no samples for {entity}"))
    }
}

#[async_trait]
impl MetricSource for MockMetrics {
    async fn host_stats(&self, host: &HostRecord) -> anyhow::Result<Samples> {
        self.next(&host.address)
    }

    async fn container_stats(&self, container: &ContainerRecord) -> anyhow::Result<Samples> {
        self.next(&container.id)
    }
}

#[derive(Default)]
pub(crate) struct MockHostActions {
    calls: Mutex<Vec<String>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    gate: Option<Semaphore>,
    fail: bool,
}

impl MockHostActions {
    /// Actions wait for [`MockHostActions::release`] before completing.
    pub fn blocking() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.lock().unwrap().clone()
    }

    async fn act(&self, call: String) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if self.fail {
            bail!("injected failure");
        }
        Ok(())
    }
}

#[async_trait]
impl HostActions for MockHostActions {
    async fn start_host_near(&self, overloaded: &str) -> anyhow::Result<HostRecord> {
        self.act(format!("start near {overloaded}")).await?;
        Ok(host("10.0.0.9", false, "europe"))
    }

    async fn stop_host(&self, address: &str) -> anyhow::Result<()> {
        self.act(format!("stop {address}")).await
    }

    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()> {
        self.decisions.lock().unwrap().push(record);
        Ok(())
    }
}

/// Records service actions; stops remove the container from the store.
pub(crate) struct MockServiceActions {
    state: StateStore,
    calls: Mutex<Vec<String>>,
    decisions: Mutex<Vec<DecisionRecord>>,
    crashed: Mutex<Vec<ContainerRecord>>,
    recovered: Mutex<Vec<ContainerRecord>>,
    gate: Option<Semaphore>,
}

impl MockServiceActions {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            calls: Mutex::new(Vec::new()),
            decisions: Mutex::new(Vec::new()),
            crashed: Mutex::new(Vec::new()),
            recovered: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Recoveries wait for [`MockServiceActions::release`] before completing.
    pub fn blocking(state: StateStore) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(state)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    /// Report `container` as crashed on the next sync.
    pub fn crash(&self, container: ContainerRecord) {
        self.crashed.lock().unwrap().push(container);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.decisions.lock().unwrap().clone()
    }

    pub fn recovered(&self) -> Vec<ContainerRecord> {
        self.recovered.lock().unwrap().clone()
    }

    fn replica_of(&self, container: &ContainerRecord, suffix: &str) -> ContainerRecord {
        ContainerRecord {
            id: format!("{}-{suffix}", container.id),
            ..container.clone()
        }
    }
}

#[async_trait]
impl ServiceActions for MockServiceActions {
    async fn sync(&self) -> anyhow::Result<Vec<ContainerRecord>> {
        Ok(std::mem::take(&mut *self.crashed.lock().unwrap()))
    }

    async fn replicate(&self, container: &ContainerRecord, target: &HostLocation) -> anyhow::Result<ContainerRecord> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("replicate {} near {}", container.id, target.city));
        Ok(self.replica_of(container, "replica"))
    }

    async fn migrate(&self, container: &ContainerRecord) -> anyhow::Result<ContainerRecord> {
        self.calls.lock().unwrap().push(format!("migrate {}", container.id));
        Ok(self.replica_of(container, "migrated"))
    }

    async fn stop(&self, container: &ContainerRecord) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("stop {}", container.id));
        self.state.delete_container(&container.id)?;
        Ok(())
    }

    async fn recover(
        &self,
        crashed: &ContainerRecord,
        labels: HashMap<String, String>,
    ) -> anyhow::Result<ContainerRecord> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let mut replacement = self.replica_of(crashed, "recovered");
        replacement.labels.extend(labels);
        self.recovered.lock().unwrap().push(replacement.clone());
        Ok(replacement)
    }

    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()> {
        self.decisions.lock().unwrap().push(record);
        Ok(())
    }
}
