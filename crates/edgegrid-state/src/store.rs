//! StateStore: redb-backed state persistence for EdgeGrid.
//!
//! Provides typed CRUD operations over the fleet inventory and the decision
//! engine's bookkeeping. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            HOSTS,
            CLOUD_INSTANCES,
            CONTAINERS,
            SERVICES,
            FIELD_STATS,
            EVENTS,
            DECISIONS,
            MONITORING_LOG,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping entries whose key starts with `prefix`.
    fn scan_json<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
        limit: Option<usize>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
                if limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn remove_prefix(&self, table: Table, prefix: &str) -> StateResult<u32> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host record.
    pub fn put_host(&self, host: &HostRecord) -> StateResult<()> {
        self.put_json(HOSTS, host.table_key(), host)?;
        debug!(address = %host.address, active = host.is_active(), "host stored");
        Ok(())
    }

    pub fn get_host(&self, address: &str) -> StateResult<Option<HostRecord>> {
        self.get_json(HOSTS, address)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<HostRecord>> {
        self.scan_json(HOSTS, "", None)
    }

    /// Delete a host by address. Returns true if it existed.
    pub fn delete_host(&self, address: &str) -> StateResult<bool> {
        self.remove(HOSTS, address)
    }

    // ── Cloud instances ────────────────────────────────────────────

    pub fn put_cloud_instance(&self, instance: &CloudInstance) -> StateResult<()> {
        self.put_json(CLOUD_INSTANCES, instance.table_key(), instance)
    }

    pub fn get_cloud_instance(&self, instance_id: &str) -> StateResult<Option<CloudInstance>> {
        self.get_json(CLOUD_INSTANCES, instance_id)
    }

    pub fn list_cloud_instances(&self) -> StateResult<Vec<CloudInstance>> {
        self.scan_json(CLOUD_INSTANCES, "", None)
    }

    pub fn delete_cloud_instance(&self, instance_id: &str) -> StateResult<bool> {
        self.remove(CLOUD_INSTANCES, instance_id)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service catalog entry.
    pub fn put_service(&self, spec: &ServiceSpec) -> StateResult<()> {
        self.put_json(SERVICES, spec.table_key(), spec)
    }

    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceSpec>> {
        self.get_json(SERVICES, name)
    }

    pub fn list_services(&self) -> StateResult<Vec<ServiceSpec>> {
        self.scan_json(SERVICES, "", None)
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Insert or update a container record.
    pub fn put_container(&self, container: &ContainerRecord) -> StateResult<()> {
        self.put_json(CONTAINERS, container.table_key(), container)?;
        debug!(
            container_id = %container.id,
            service = %container.service_name,
            host = %container.host_address,
            "container stored"
        );
        Ok(())
    }

    pub fn get_container(&self, id: &str) -> StateResult<Option<ContainerRecord>> {
        self.get_json(CONTAINERS, id)
    }

    pub fn list_containers(&self) -> StateResult<Vec<ContainerRecord>> {
        self.scan_json(CONTAINERS, "", None)
    }

    /// Containers placed on the given host.
    pub fn list_containers_on_host(&self, address: &str) -> StateResult<Vec<ContainerRecord>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.host_address == address)
            .collect())
    }

    /// Containers running the given service, anywhere.
    pub fn list_containers_for_service(&self, service: &str) -> StateResult<Vec<ContainerRecord>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| c.service_name == service)
            .collect())
    }

    /// Delete a container by id. Returns true if it existed.
    pub fn delete_container(&self, id: &str) -> StateResult<bool> {
        self.remove(CONTAINERS, id)
    }

    // ── Field statistics ───────────────────────────────────────────

    pub fn put_field_stat(&self, stat: &FieldStatistic) -> StateResult<()> {
        self.put_json(FIELD_STATS, &stat.table_key(), stat)
    }

    pub fn get_field_stat(&self, entity_id: &str, field: &str) -> StateResult<Option<FieldStatistic>> {
        self.get_json(FIELD_STATS, &format!("{entity_id}:{field}"))
    }

    /// All statistics recorded for an entity.
    pub fn list_field_stats(&self, entity_id: &str) -> StateResult<Vec<FieldStatistic>> {
        self.scan_json(FIELD_STATS, &format!("{entity_id}:"), None)
    }

    /// Delete all statistics of an entity. Returns number deleted.
    pub fn delete_field_stats(&self, entity_id: &str) -> StateResult<u32> {
        self.remove_prefix(FIELD_STATS, &format!("{entity_id}:"))
    }

    // ── Event counters ─────────────────────────────────────────────

    pub fn put_event(&self, counter: &EventCounter) -> StateResult<()> {
        self.put_json(EVENTS, &counter.table_key(), counter)
    }

    pub fn get_event(&self, kind: EntityKind, entity_id: &str) -> StateResult<Option<EventCounter>> {
        self.get_json(EVENTS, &event_key(kind, entity_id))
    }

    pub fn list_events(&self, kind: EntityKind) -> StateResult<Vec<EventCounter>> {
        self.scan_json(EVENTS, &format!("{kind}:"), None)
    }

    pub fn delete_event(&self, kind: EntityKind, entity_id: &str) -> StateResult<bool> {
        self.remove(EVENTS, &event_key(kind, entity_id))
    }

    // ── Decisions ──────────────────────────────────────────────────

    /// Append an executed decision to the audit trail.
    pub fn put_decision(&self, record: &DecisionRecord) -> StateResult<()> {
        self.put_json(DECISIONS, &record.table_key(), record)
    }

    /// Executed decisions for one entity, oldest first.
    pub fn list_decisions_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> StateResult<Vec<DecisionRecord>> {
        self.scan_json(DECISIONS, &format!("{kind}:{entity_id}:"), None)
    }

    /// Executed decisions for an entity kind, up to `limit`.
    pub fn list_decisions(&self, kind: EntityKind, limit: usize) -> StateResult<Vec<DecisionRecord>> {
        self.scan_json(DECISIONS, &format!("{kind}:"), Some(limit))
    }

    // ── Monitoring log ─────────────────────────────────────────────

    pub fn append_monitoring_log(&self, entry: &MonitoringLogEntry) -> StateResult<()> {
        self.put_json(MONITORING_LOG, &entry.table_key(), entry)
    }

    /// Logged samples for an entity, oldest first.
    pub fn list_monitoring_log(&self, entity_id: &str) -> StateResult<Vec<MonitoringLogEntry>> {
        self.scan_json(MONITORING_LOG, &format!("{entity_id}:"), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_host(address: &str, kind: HostKind) -> HostRecord {
        HostRecord {
            address: address.to_string(),
            private_address: "192.168.0.10".to_string(),
            kind,
            location: HostLocation {
                continent: "europe".to_string(),
                region: "eu-west".to_string(),
                country: "pt".to_string(),
                city: "lisbon".to_string(),
                coordinates: Coordinates::new(38.72, -9.14),
            },
            instance_id: None,
            node: None,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            updated_at: 1000,
        }
    }

    fn test_container(id: &str, service: &str, host: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: format!("{service}_{host}_8080"),
            service_name: service.to_string(),
            host_address: host.to_string(),
            image: format!("registry/{service}:latest"),
            ports: vec![PortBinding {
                internal: 80,
                external: 8080,
            }],
            args: vec![],
            labels: HashMap::new(),
            coordinates: Coordinates::new(38.72, -9.14),
            region: "eu-west".to_string(),
            created_at: 1000,
        }
    }

    // ── Hosts ──────────────────────────────────────────────────────

    #[test]
    fn host_put_get_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let host = test_host("10.0.0.1", HostKind::Edge);

        store.put_host(&host).unwrap();
        assert_eq!(store.get_host("10.0.0.1").unwrap(), Some(host));

        assert!(store.delete_host("10.0.0.1").unwrap());
        assert!(store.get_host("10.0.0.1").unwrap().is_none());
        assert!(!store.delete_host("10.0.0.1").unwrap());
    }

    #[test]
    fn host_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut host = test_host("10.0.0.1", HostKind::Cloud);
        store.put_host(&host).unwrap();

        host.node = Some(NodeMembership {
            node_id: "node-a".to_string(),
            role: NodeRole::Worker,
            state: NodeState::Ready,
        });
        store.put_host(&host).unwrap();

        let hosts = store.list_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].is_active());
    }

    // ── Containers ─────────────────────────────────────────────────

    #[test]
    fn containers_by_host_and_service() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_container(&test_container("c1", "api", "10.0.0.1")).unwrap();
        store.put_container(&test_container("c2", "api", "10.0.0.2")).unwrap();
        store.put_container(&test_container("c3", "db", "10.0.0.1")).unwrap();

        assert_eq!(store.list_containers().unwrap().len(), 3);
        assert_eq!(store.list_containers_on_host("10.0.0.1").unwrap().len(), 2);
        assert_eq!(store.list_containers_for_service("api").unwrap().len(), 2);

        assert!(store.delete_container("c1").unwrap());
        assert_eq!(store.list_containers_for_service("api").unwrap().len(), 1);
    }

    // ── Field statistics ───────────────────────────────────────────

    #[test]
    fn field_stats_are_scoped_per_entity() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_field_stat(&FieldStatistic::first("c1", "cpu", 10.0, 1)).unwrap();
        store.put_field_stat(&FieldStatistic::first("c1", "ram", 20.0, 1)).unwrap();
        store.put_field_stat(&FieldStatistic::first("c10", "cpu", 30.0, 1)).unwrap();

        assert_eq!(store.list_field_stats("c1").unwrap().len(), 2);
        assert_eq!(store.get_field_stat("c10", "cpu").unwrap().unwrap().last, 30.0);

        assert_eq!(store.delete_field_stats("c1").unwrap(), 2);
        assert!(store.list_field_stats("c1").unwrap().is_empty());
        assert_eq!(store.list_field_stats("c10").unwrap().len(), 1);
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_are_namespaced_by_kind() {
        let store = StateStore::open_in_memory().unwrap();
        let counter = EventCounter {
            kind: EntityKind::Host,
            entity_id: "x".to_string(),
            decision: DecisionKind::Start,
            count: 2,
            updated_at: 1,
        };
        store.put_event(&counter).unwrap();

        assert_eq!(store.get_event(EntityKind::Host, "x").unwrap(), Some(counter));
        assert!(store.get_event(EntityKind::Service, "x").unwrap().is_none());
        assert_eq!(store.list_events(EntityKind::Host).unwrap().len(), 1);
        assert!(store.delete_event(EntityKind::Host, "x").unwrap());
    }

    // ── Decisions and log ──────────────────────────────────────────

    #[test]
    fn decisions_list_in_time_order() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [300u64, 100, 200] {
            store
                .put_decision(&DecisionRecord {
                    kind: EntityKind::Service,
                    entity_id: "c1".to_string(),
                    service_name: Some("api".to_string()),
                    decision: DecisionKind::Replicate,
                    rule_id: Some(7),
                    fields: HashMap::from([("cpu-effective-val".to_string(), 91.0)]),
                    result: format!("at {ts}"),
                    timestamp_ms: ts,
                })
                .unwrap();
        }

        let records = store.list_decisions_for_entity(EntityKind::Service, "c1").unwrap();
        let times: Vec<u64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(times, vec![100, 200, 300]);
        assert_eq!(store.list_decisions(EntityKind::Service, 2).unwrap().len(), 2);
        assert!(store.list_decisions(EntityKind::Host, 10).unwrap().is_empty());
    }

    #[test]
    fn monitoring_log_appends() {
        let store = StateStore::open_in_memory().unwrap();
        for (ts, field) in [(1u64, "cpu"), (1, "ram"), (2, "cpu")] {
            store
                .append_monitoring_log(&MonitoringLogEntry {
                    entity_id: "h1".to_string(),
                    field: field.to_string(),
                    value: 1.0,
                    timestamp_ms: ts,
                })
                .unwrap();
        }
        assert_eq!(store.list_monitoring_log("h1").unwrap().len(), 3);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_host(&test_host("10.0.0.9", HostKind::Edge)).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let host = store.get_host("10.0.0.9").unwrap();
        assert_eq!(host.unwrap().location.city, "lisbon");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_hosts().unwrap().is_empty());
        assert!(store.list_containers().unwrap().is_empty());
        assert!(store.list_services().unwrap().is_empty());
        assert!(store.list_cloud_instances().unwrap().is_empty());
        assert_eq!(store.delete_field_stats("nope").unwrap(), 0);
        assert!(!store.delete_container("nope").unwrap());
        assert!(!store.delete_cloud_instance("nope").unwrap());
    }
}
