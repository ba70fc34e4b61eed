//! Recording in-memory backends for executor tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use edgegrid_placement::HostProbe;
use edgegrid_state::{
    CloudInstance, Coordinates, HostKind, HostLocation, HostRecord, InstanceState, NodeMembership, NodeRole,
    NodeState, ServiceSpec, ServiceType, StateStore,
};

use crate::backends::{CloudProvider, CommandRunner, ContainerRuntime, LaunchRequest, RunningContainer, SwarmApi, SwarmNode};
use crate::cloud::CloudSettings;
use crate::context::ExecContext;
use crate::executor::{Backends, DecisionCallback, Executor, ExecutorSettings};

pub const MANAGER: &str = "10.0.0.1";

// ── Command runner ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MockRunner {
    pub commands: Mutex<Vec<(String, String)>>,
    listening: Mutex<HashMap<String, Vec<u16>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockRunner {
    pub fn set_listening(&self, host: &str, ports: &[u16]) {
        self.listening.lock().unwrap().insert(host.to_string(), ports.to_vec());
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(host.to_string());
        } else {
            set.remove(host);
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, host: &str, command: &str) -> anyhow::Result<String> {
        self.commands.lock().unwrap().push((host.to_string(), command.to_string()));
        if self.unreachable.lock().unwrap().contains(host) {
            anyhow::bail!("ssh: connect to host {host} port 22: Connection timed out");
        }
        if command.contains("lsof") {
            let ports = self.listening.lock().unwrap().get(host).cloned().unwrap_or_default();
            let lines: Vec<String> = ports.iter().map(u16::to_string).collect();
            return Ok(lines.join("\n"));
        }
        Ok(String::new())
    }
}

// ── Cloud provider ─────────────────────────────────────────────────

struct Transition {
    target: InstanceState,
    remaining_polls: u32,
}

#[derive(Default)]
pub struct MockCloud {
    instances: Mutex<HashMap<String, CloudInstance>>,
    transitions: Mutex<HashMap<String, Transition>>,
    calls: Mutex<Vec<String>>,
    fail_next: AtomicU32,
    transition_polls: AtomicU32,
    stuck: Mutex<bool>,
    launched: AtomicU32,
}

impl MockCloud {
    pub fn add(&self, id: &str, zone: &str, state: InstanceState, public_address: Option<&str>) {
        self.instances.lock().unwrap().insert(
            id.to_string(),
            CloudInstance {
                instance_id: id.to_string(),
                instance_type: "t2.micro".to_string(),
                image_id: "ami-1".to_string(),
                state,
                public_address: public_address.map(str::to_string),
                private_address: None,
                zone: zone.to_string(),
                updated_at: 0,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_next_calls(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_transition_polls(&self, n: u32) {
        self.transition_polls.store(n, Ordering::SeqCst);
    }

    pub fn set_stuck(&self, stuck: bool) {
        *self.stuck.lock().unwrap() = stuck;
    }

    fn transition(&self, id: &str, verb: &str, via: InstanceState, target: InstanceState) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("{verb} {id}"));
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("RequestLimitExceeded");
        }
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("InvalidInstanceID.NotFound"))?;
        instance.state = via;
        if target == InstanceState::Running && instance.public_address.is_none() {
            instance.public_address = Some(format!("10.9.0.{}", instances_len_hint(id)));
        }
        if !*self.stuck.lock().unwrap() {
            self.transitions.lock().unwrap().insert(
                id.to_string(),
                Transition {
                    target,
                    remaining_polls: self.transition_polls.load(Ordering::SeqCst),
                },
            );
        }
        Ok(())
    }
}

fn instances_len_hint(id: &str) -> u32 {
    id.bytes().map(u32::from).sum::<u32>() % 250 + 1
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn describe_instances(&self) -> anyhow::Result<Vec<CloudInstance>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn describe_instance(&self, instance_id: &str) -> anyhow::Result<Option<CloudInstance>> {
        let mut transitions = self.transitions.lock().unwrap();
        let mut instances = self.instances.lock().unwrap();
        if let Some(t) = transitions.get_mut(instance_id) {
            if t.remaining_polls == 0 {
                if let Some(instance) = instances.get_mut(instance_id) {
                    instance.state = t.target;
                }
                transitions.remove(instance_id);
            } else {
                t.remaining_polls -= 1;
            }
        }
        Ok(instances.get(instance_id).cloned())
    }

    async fn launch_instance(&self, zone: &str) -> anyhow::Result<CloudInstance> {
        let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("i-new-{n}");
        self.calls.lock().unwrap().push(format!("launch {zone}"));
        self.add(&id, zone, InstanceState::Pending, Some(&format!("3.3.3.{n}")));
        self.transitions.lock().unwrap().insert(
            id.clone(),
            Transition {
                target: InstanceState::Running,
                remaining_polls: 0,
            },
        );
        let instance = self.instances.lock().unwrap().get(&id).cloned();
        instance.ok_or_else(|| anyhow::anyhow!("launch lost"))
    }

    async fn start_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.transition(instance_id, "start", InstanceState::Pending, InstanceState::Running)
    }

    async fn stop_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.transition(instance_id, "stop", InstanceState::Stopping, InstanceState::Stopped)
    }

    async fn terminate_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        self.transition(instance_id, "terminate", InstanceState::ShuttingDown, InstanceState::Terminated)
    }
}

// ── Swarm ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockSwarm {
    pub nodes: Mutex<Vec<SwarmNode>>,
    pub calls: Mutex<Vec<String>>,
    fail_joins: AtomicU32,
}

impl MockSwarm {
    pub fn add_node(&self, address: &str, role: NodeRole, state: NodeState) {
        self.nodes.lock().unwrap().push(SwarmNode {
            node_id: format!("node-{address}"),
            address: address.to_string(),
            role,
            state,
            labels: HashMap::new(),
        });
    }

    fn set_role(&self, node_id: &str, role: NodeRole) {
        for node in self.nodes.lock().unwrap().iter_mut() {
            if node.node_id == node_id {
                node.role = role;
            }
        }
    }

    pub fn fail_next_joins(&self, n: u32) {
        self.fail_joins.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn node(&self, address: &str) -> Option<SwarmNode> {
        self.nodes.lock().unwrap().iter().find(|n| n.address == address).cloned()
    }
}

#[async_trait]
impl SwarmApi for MockSwarm {
    async fn init(&self, host: &HostRecord) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(format!("init {}", host.address));
        self.add_node(&host.address, NodeRole::Manager, NodeState::Ready);
        Ok(format!("node-{}", host.address))
    }

    async fn join(&self, host: &HostRecord, role: NodeRole) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(format!("join {} {role:?}", host.address));
        if self.fail_joins.load(Ordering::SeqCst) > 0 {
            self.fail_joins.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("Timeout was reached before node joined");
        }
        self.add_node(&host.address, role, NodeState::Ready);
        Ok(format!("node-{}", host.address))
    }

    async fn leave(&self, host: &HostRecord) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("leave {}", host.address));
        for node in self.nodes.lock().unwrap().iter_mut() {
            if node.address == host.address {
                node.state = NodeState::Down;
            }
        }
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("rm {node_id}"));
        self.nodes.lock().unwrap().retain(|n| n.node_id != node_id);
        Ok(())
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<SwarmNode>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn promote(&self, node_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("promote {node_id}"));
        self.set_role(node_id, NodeRole::Manager);
        Ok(())
    }

    async fn demote(&self, node_id: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("demote {node_id}"));
        self.set_role(node_id, NodeRole::Worker);
        Ok(())
    }

    async fn set_label(&self, node_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        for node in self.nodes.lock().unwrap().iter_mut() {
            if node.node_id == node_id {
                node.labels.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }
}

// ── Container runtime ──────────────────────────────────────────────

#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, Vec<RunningContainer>>>,
    pub requests: Mutex<Vec<LaunchRequest>>,
    next_id: AtomicU32,
}

impl MockRuntime {
    pub fn running_on(&self, host: &str) -> Vec<RunningContainer> {
        self.containers.lock().unwrap().get(host).cloned().unwrap_or_default()
    }

    /// Simulate a container dying outside of our control.
    pub fn kill(&self, host: &str, id: &str) {
        if let Some(list) = self.containers.lock().unwrap().get_mut(host) {
            list.retain(|c| c.id != id);
        }
    }

    pub fn insert(&self, host: &str, container: RunningContainer) {
        self.containers.lock().unwrap().entry(host.to_string()).or_default().push(container);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_and_start(&self, request: &LaunchRequest) -> anyhow::Result<String> {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.requests.lock().unwrap().push(request.clone());
        self.insert(
            &request.host,
            RunningContainer {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                ports: request.ports.clone(),
                args: request.args.clone(),
                labels: request.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn inspect(&self, host: &str, container_id: &str) -> anyhow::Result<Option<RunningContainer>> {
        Ok(self.running_on(host).into_iter().find(|c| c.id == container_id))
    }

    async fn stop(&self, host: &str, container_id: &str) -> anyhow::Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let list = containers.entry(host.to_string()).or_default();
        let before = list.len();
        list.retain(|c| c.id != container_id);
        if list.len() == before {
            anyhow::bail!("No such container: {container_id}");
        }
        Ok(())
    }

    async fn list(&self, host: &str) -> anyhow::Result<Vec<RunningContainer>> {
        Ok(self.running_on(host))
    }
}

// ── Host probe ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockProbe {
    free: Mutex<HashMap<String, u64>>,
}

impl MockProbe {
    pub fn set_free(&self, host: &str, bytes: u64) {
        self.free.lock().unwrap().insert(host.to_string(), bytes);
    }
}

#[async_trait]
impl HostProbe for MockProbe {
    async fn available_memory(&self, host: &HostRecord) -> anyhow::Result<u64> {
        Ok(self
            .free
            .lock()
            .unwrap()
            .get(&host.address)
            .copied()
            .unwrap_or(4 * 1024 * 1024 * 1024))
    }
}

// ── Fixture ────────────────────────────────────────────────────────

pub fn city(name: &str) -> HostLocation {
    let (country, lat, lon) = match name {
        "lisbon" => ("pt", 38.72, -9.14),
        "porto" => ("pt", 41.15, -8.61),
        "madrid" => ("es", 40.42, -3.70),
        _ => ("fr", 48.86, 2.35),
    };
    HostLocation {
        continent: "europe".to_string(),
        region: "europe".to_string(),
        country: country.to_string(),
        city: name.to_string(),
        coordinates: Coordinates::new(lat, lon),
    }
}

pub fn service(name: &str, service_type: ServiceType, command: &str, dependencies: &[&str]) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: format!("edgegrid/{name}:latest"),
        service_type,
        internal_port: 8080,
        external_port: 8080,
        launch_command: command.to_string(),
        output_label: format!("{name}Host"),
        min_replicas: 0,
        max_replicas: 0,
        expected_memory_bytes: 256 * 1024 * 1024,
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
    }
}

pub struct Fixture {
    pub state: StateStore,
    pub runner: Arc<MockRunner>,
    pub cloud: Arc<MockCloud>,
    pub swarm: Arc<MockSwarm>,
    pub runtime: Arc<MockRuntime>,
    pub probe: Arc<MockProbe>,
    pub executor: Arc<Executor>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(None, ExecutorSettings::default())
    }

    pub fn with_callback(callback: DecisionCallback) -> Self {
        Self::build(Some(callback), ExecutorSettings::default())
    }

    pub fn with_settings(settings: ExecutorSettings) -> Self {
        Self::build(None, settings)
    }

    fn build(callback: Option<DecisionCallback>, mut settings: ExecutorSettings) -> Self {
        let state = StateStore::open_in_memory().unwrap();
        let runner = Arc::new(MockRunner::default());
        let cloud = Arc::new(MockCloud::default());
        let swarm = Arc::new(MockSwarm::default());
        let runtime = Arc::new(MockRuntime::default());
        let probe = Arc::new(MockProbe::default());

        settings.cloud = CloudSettings {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(10),
        };
        settings.migration_stop_delay = Duration::from_secs(30);

        let backends = Backends {
            runner: runner.clone(),
            cloud: cloud.clone(),
            swarm: swarm.clone(),
            runtime: runtime.clone(),
            probe: probe.clone(),
        };
        let mut executor = Executor::new(state.clone(), ExecContext::new(MANAGER), backends, settings);
        if let Some(callback) = callback {
            executor = executor.with_decision_callback(callback);
        }

        let fixture = Self {
            state,
            runner,
            cloud,
            swarm,
            runtime,
            probe,
            executor: Arc::new(executor),
        };
        let mut manager = fixture.edge_host(MANAGER, "lisbon", true);
        if let Some(node) = manager.node.as_mut() {
            node.role = NodeRole::Manager;
        }
        fixture.state.put_host(&manager).unwrap();
        fixture.swarm.nodes.lock().unwrap().iter_mut().for_each(|n| {
            if n.address == MANAGER {
                n.role = NodeRole::Manager;
            }
        });
        fixture
    }

    /// Register an edge host; an active one is also a ready swarm worker.
    pub fn edge_host(&self, address: &str, city_name: &str, active: bool) -> HostRecord {
        let host = HostRecord {
            address: address.to_string(),
            private_address: address.to_string(),
            kind: HostKind::Edge,
            location: city(city_name),
            instance_id: None,
            node: active.then(|| NodeMembership {
                node_id: format!("node-{address}"),
                role: NodeRole::Worker,
                state: NodeState::Ready,
            }),
            memory_bytes: 8 * 1024 * 1024 * 1024,
            updated_at: 0,
        };
        self.state.put_host(&host).unwrap();
        if active {
            self.swarm.add_node(address, NodeRole::Worker, NodeState::Ready);
        }
        host
    }
}
