//! Domain types for the EdgeGrid state store.
//!
//! These types describe the fleet inventory (hosts, cloud instances,
//! services, containers) and the decision engine's persisted bookkeeping.
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Public address of a host; the host's stable identifier.
pub type HostAddress = String;

/// Container id as reported by the container runtime.
pub type ContainerId = String;

// ── Location ──────────────────────────────────────────────────────

/// A point on the globe, in decimal degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Where a host sits, from the coarsest to the finest grain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HostLocation {
    #[serde(default)]
    pub continent: String,
    pub region: String,
    pub country: String,
    pub city: String,
    pub coordinates: Coordinates,
}

// ── Decisions ─────────────────────────────────────────────────────

/// The kind of entity a rule or decision applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    Service,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::Service => "service",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action a rule recommends for an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionKind {
    Start,
    Stop,
    Replicate,
    Migrate,
    Maintain,
}

impl DecisionKind {
    /// Whether this decision is meaningful for the given entity kind.
    ///
    /// Hosts take START/STOP/MAINTAIN; services take
    /// REPLICATE/MIGRATE/STOP/MAINTAIN.
    pub fn applies_to(self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Host => matches!(
                self,
                DecisionKind::Start | DecisionKind::Stop | DecisionKind::Maintain
            ),
            EntityKind::Service => matches!(
                self,
                DecisionKind::Replicate
                    | DecisionKind::Migrate
                    | DecisionKind::Stop
                    | DecisionKind::Maintain
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Start => "START",
            DecisionKind::Stop => "STOP",
            DecisionKind::Replicate => "REPLICATE",
            DecisionKind::Migrate => "MIGRATE",
            DecisionKind::Maintain => "MAINTAIN",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Edge machines are owned hardware; cloud hosts are managed instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    Edge,
    Cloud,
}

/// Swarm role of a joined host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

/// Swarm-reported node state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Ready,
    Down,
}

/// Swarm membership of a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeMembership {
    pub node_id: String,
    pub role: NodeRole,
    pub state: NodeState,
}

/// A known host, joined to the swarm or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub address: HostAddress,
    pub private_address: String,
    pub kind: HostKind,
    pub location: HostLocation,
    /// Backing cloud instance, for cloud hosts.
    pub instance_id: Option<String>,
    /// `None` while the host is outside the swarm.
    pub node: Option<NodeMembership>,
    /// Total memory reported at registration.
    pub memory_bytes: u64,
    pub updated_at: u64,
}

impl HostRecord {
    pub fn table_key(&self) -> &str {
        &self.address
    }

    /// Joined and reported ready by the swarm.
    pub fn is_active(&self) -> bool {
        matches!(&self.node, Some(node) if node.state == NodeState::Ready)
    }

    pub fn is_manager(&self) -> bool {
        matches!(&self.node, Some(node) if node.role == NodeRole::Manager)
    }
}

// ── Cloud instances ───────────────────────────────────────────────

/// EC2-style instance lifecycle.
///
/// ```text
/// PENDING → RUNNING → STOPPING → STOPPED → SHUTTING_DOWN → TERMINATED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// Provider state code.
    pub fn code(self) -> u16 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Running => 16,
            InstanceState::ShuttingDown => 32,
            InstanceState::Terminated => 48,
            InstanceState::Stopping => 64,
            InstanceState::Stopped => 80,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        // The high byte is provider-internal.
        match code & 0xff {
            0 => Some(InstanceState::Pending),
            16 => Some(InstanceState::Running),
            32 => Some(InstanceState::ShuttingDown),
            48 => Some(InstanceState::Terminated),
            64 => Some(InstanceState::Stopping),
            80 => Some(InstanceState::Stopped),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "shutting-down" => Some(InstanceState::ShuttingDown),
            "terminated" => Some(InstanceState::Terminated),
            "stopping" => Some(InstanceState::Stopping),
            "stopped" => Some(InstanceState::Stopped),
            _ => None,
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A cloud instance carrying this system's management tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudInstance {
    pub instance_id: String,
    pub instance_type: String,
    pub image_id: String,
    pub state: InstanceState,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
    /// Availability zone / region code, e.g. `eu-west-2`.
    pub zone: String,
    pub updated_at: u64,
}

impl CloudInstance {
    pub fn table_key(&self) -> &str {
        &self.instance_id
    }
}

// ── Services ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Frontend,
    #[default]
    Backend,
    Database,
    System,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Frontend => "frontend",
            ServiceType::Backend => "backend",
            ServiceType::Database => "database",
            ServiceType::System => "system",
        }
    }
}

/// Catalog entry describing how to launch a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub service_type: ServiceType,
    pub internal_port: u16,
    pub external_port: u16,
    /// Space-separated container arguments. Supports `${hostname}`,
    /// `${externalPort}`, `${internalPort}`, `${continent}`, `${region}`,
    /// `${country}`, `${city}` and dependency output labels.
    #[serde(default)]
    pub launch_command: String,
    /// Placeholder other services use to refer to this one's address.
    #[serde(default)]
    pub output_label: String,
    #[serde(default)]
    pub min_replicas: u32,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_replicas: u32,
    #[serde(default)]
    pub expected_memory_bytes: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ServiceSpec {
    pub fn table_key(&self) -> &str {
        &self.name
    }
}

// ── Containers ────────────────────────────────────────────────────

/// Container label keys written on every launch.
pub mod labels {
    pub const MANAGED: &str = "edgegrid.managed";
    pub const SERVICE_NAME: &str = "edgegrid.service-name";
    pub const SERVICE_TYPE: &str = "edgegrid.service-type";
    pub const SERVICE_ADDRESS: &str = "edgegrid.service-address";
    pub const PUBLIC_ADDRESS: &str = "edgegrid.public-address";
    pub const COORDINATES: &str = "edgegrid.coordinates";
    pub const REGION: &str = "edgegrid.region";
    pub const PRIVATE_ADDRESS: &str = "edgegrid.private-address";
    /// Set on the node that created the swarm.
    pub const MASTER_MANAGER: &str = "edgegrid.master-manager";
    /// `"false"` keeps a container out of the inventory.
    pub const TRACEABLE: &str = "edgegrid.traceable";
    /// JSON list of recovery timestamps (millis).
    pub const RECOVERY: &str = "edgegrid.recovery";
    pub const STOPPABLE: &str = "edgegrid.stoppable";
    pub const REPLICABLE: &str = "edgegrid.replicable";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub internal: u16,
    pub external: u16,
}

/// A running container tracked in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub service_name: String,
    pub host_address: HostAddress,
    pub image: String,
    pub ports: Vec<PortBinding>,
    /// Arguments the container was started with.
    pub args: Vec<String>,
    pub labels: HashMap<String, String>,
    pub coordinates: Coordinates,
    pub region: String,
    pub created_at: u64,
}

impl ContainerRecord {
    pub fn table_key(&self) -> &str {
        &self.id
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// `host:port` other services use to reach this container.
    pub fn service_address(&self) -> Option<&str> {
        self.label(labels::SERVICE_ADDRESS)
    }
}

// ── Decision engine bookkeeping ───────────────────────────────────

/// Running aggregate of one field of one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldStatistic {
    pub entity_id: String,
    pub field: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub updated_at: u64,
}

impl FieldStatistic {
    /// Statistic for the first sample of a field.
    pub fn first(entity_id: &str, field: &str, value: f64, now: u64) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            count: 1,
            sum: value,
            min: value,
            max: value,
            last: value,
            updated_at: now,
        }
    }

    /// Fold one more sample into the aggregate.
    pub fn update(&mut self, value: f64, now: u64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        self.updated_at = now;
    }

    pub fn average(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub fn table_key(&self) -> String {
        format!("{}:{}", self.entity_id, self.field)
    }
}

/// Consecutive identical decisions for one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventCounter {
    pub kind: EntityKind,
    pub entity_id: String,
    pub decision: DecisionKind,
    pub count: u32,
    pub updated_at: u64,
}

impl EventCounter {
    pub fn table_key(&self) -> String {
        event_key(self.kind, &self.entity_id)
    }
}

/// Key of the event counter for an entity.
pub fn event_key(kind: EntityKind, entity_id: &str) -> String {
    format!("{kind}:{entity_id}")
}

/// Audit record of an executed decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub kind: EntityKind,
    pub entity_id: String,
    pub service_name: Option<String>,
    pub decision: DecisionKind,
    /// `None` for actions taken outside rule evaluation (e.g. replica floor).
    pub rule_id: Option<u64>,
    pub fields: HashMap<String, f64>,
    pub result: String,
    pub timestamp_ms: u64,
}

impl DecisionRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}:{:020}", self.kind, self.entity_id, self.timestamp_ms)
    }
}

/// One raw sample, kept when the monitoring log is enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringLogEntry {
    pub entity_id: String,
    pub field: String,
    pub value: f64,
    pub timestamp_ms: u64,
}

impl MonitoringLogEntry {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{}", self.entity_id, self.timestamp_ms, self.field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_statistic_tracks_min_max_and_average() {
        let mut stat = FieldStatistic::first("h1", "cpu", 40.0, 1);
        stat.update(45.0, 2);
        stat.update(95.0, 3);

        assert_eq!(stat.count, 3);
        assert_eq!(stat.min, 40.0);
        assert_eq!(stat.max, 95.0);
        assert_eq!(stat.last, 95.0);
        assert_eq!(stat.average(), 60.0);
    }

    #[test]
    fn decision_kinds_per_entity_kind() {
        assert!(DecisionKind::Start.applies_to(EntityKind::Host));
        assert!(!DecisionKind::Start.applies_to(EntityKind::Service));
        assert!(DecisionKind::Replicate.applies_to(EntityKind::Service));
        assert!(!DecisionKind::Migrate.applies_to(EntityKind::Host));
        assert!(DecisionKind::Stop.applies_to(EntityKind::Host));
        assert!(DecisionKind::Stop.applies_to(EntityKind::Service));
    }

    #[test]
    fn instance_state_codes() {
        assert_eq!(InstanceState::from_code(16), Some(InstanceState::Running));
        // Provider-internal high byte is ignored.
        assert_eq!(InstanceState::from_code(256 + 80), Some(InstanceState::Stopped));
        assert_eq!(InstanceState::from_code(7), None);
        assert_eq!(InstanceState::from_name("shutting-down"), Some(InstanceState::ShuttingDown));
        assert_eq!(InstanceState::Stopping.to_string(), "stopping");
        assert!(InstanceState::Terminated.is_terminal());
        assert!(!InstanceState::Stopped.is_terminal());
    }

    #[test]
    fn decision_kind_serializes_uppercase() {
        let json = serde_json::to_string(&DecisionKind::Replicate).unwrap();
        assert_eq!(json, "\"REPLICATE\"");
    }

    #[test]
    fn host_activity_follows_membership() {
        let mut host = HostRecord {
            address: "10.0.0.1".to_string(),
            private_address: "192.168.1.1".to_string(),
            kind: HostKind::Edge,
            location: HostLocation::default(),
            instance_id: None,
            node: None,
            memory_bytes: 0,
            updated_at: 0,
        };
        assert!(!host.is_active());

        host.node = Some(NodeMembership {
            node_id: "n1".to_string(),
            role: NodeRole::Manager,
            state: NodeState::Down,
        });
        assert!(!host.is_active());
        assert!(host.is_manager());

        host.node.as_mut().unwrap().state = NodeState::Ready;
        assert!(host.is_active());
    }
}
