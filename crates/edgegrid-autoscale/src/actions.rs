//! Seams between the monitoring cycles and the rest of the system.
//!
//! The cycles only decide. Metric collection, request-location history and
//! every physical action are reached through these traits and wired at
//! startup.

use std::collections::HashMap;

use async_trait::async_trait;

use edgegrid_metrics::Samples;
use edgegrid_state::{ContainerRecord, Coordinates, DecisionRecord, HostLocation, HostRecord};

/// Raw `field → value` samples from the external collector.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn host_stats(&self, host: &HostRecord) -> anyhow::Result<Samples>;
    async fn container_stats(&self, container: &ContainerRecord) -> anyhow::Result<Samples>;
}

/// Where a service's requests come from, with a weight per origin.
pub trait LocationSource: Send + Sync {
    fn request_locations(&self, service: &str) -> anyhow::Result<Vec<(Coordinates, f64)>>;
}

/// No request-location history: services are placed near the deciding
/// container's host.
pub struct NoLocations;

impl LocationSource for NoLocations {
    fn request_locations(&self, _service: &str) -> anyhow::Result<Vec<(Coordinates, f64)>> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait HostActions: Send + Sync {
    /// Bring up a host near `overloaded`. Returns the started host.
    async fn start_host_near(&self, overloaded: &str) -> anyhow::Result<HostRecord>;
    /// Move the host's workloads away and take it out of the cluster.
    async fn stop_host(&self, address: &str) -> anyhow::Result<()>;
    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ServiceActions: Send + Sync {
    /// Reconcile the inventory with what runs; returns crashed containers.
    async fn sync(&self) -> anyhow::Result<Vec<ContainerRecord>>;
    /// Start a copy of `container` on a host chosen for `target`.
    async fn replicate(&self, container: &ContainerRecord, target: &HostLocation) -> anyhow::Result<ContainerRecord>;
    /// Move `container` to the closest capable host other than its own.
    async fn migrate(&self, container: &ContainerRecord) -> anyhow::Result<ContainerRecord>;
    async fn stop(&self, container: &ContainerRecord) -> anyhow::Result<()>;
    /// Relaunch a crashed container near its last coordinates with
    /// `labels` added.
    async fn recover(
        &self,
        crashed: &ContainerRecord,
        labels: HashMap<String, String>,
    ) -> anyhow::Result<ContainerRecord>;
    async fn decision_executed(&self, record: DecisionRecord) -> anyhow::Result<()>;
}
