//! redb table definitions for the EdgeGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Per-entity records use `{entity}:{suffix}` keys so they can be prefix-scanned.

use redb::TableDefinition;

/// Host records keyed by public address.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Managed cloud instances keyed by instance id.
pub const CLOUD_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("cloud_instances");

/// Containers keyed by container id.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Service catalog keyed by service name.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Field statistics keyed by `{entity}:{field}`.
pub const FIELD_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("field_stats");

/// Event counters keyed by `{kind}:{entity}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Executed decision audit records keyed by `{kind}:{entity}:{millis}`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Raw sample log keyed by `{entity}:{millis}:{field}`.
pub const MONITORING_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("monitoring_log");
