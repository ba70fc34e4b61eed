//! Seeds the store from the configuration on startup.

use async_trait::async_trait;
use tracing::{debug, info};

use edgegrid_executor::CloudProvider;
use edgegrid_state::{CloudInstance, HostKind, HostLocation, HostRecord, StateResult, StateStore};

use crate::config::EdgedConfig;

/// Register the manager host, the configured edge hosts and the service
/// catalog.
///
/// Hosts already known keep their swarm membership; only their addresses
/// and location are refreshed.
pub fn register(state: &StateStore, config: &EdgedConfig) -> StateResult<()> {
    let manager = &config.manager;
    upsert_host(
        state,
        &manager.address,
        manager.private_address.as_deref(),
        &manager.location,
        0,
    )?;
    for edge in &config.hosts.edge {
        upsert_host(
            state,
            &edge.address,
            edge.private_address.as_deref(),
            &edge.location,
            edge.memory_bytes,
        )?;
    }
    for spec in &config.services.catalog {
        state.put_service(spec)?;
        debug!(service = %spec.name, "service registered");
    }
    info!(
        hosts = config.hosts.edge.len() + 1,
        services = config.services.catalog.len(),
        "inventory registered"
    );
    Ok(())
}

fn upsert_host(
    state: &StateStore,
    address: &str,
    private_address: Option<&str>,
    location: &HostLocation,
    memory_bytes: u64,
) -> StateResult<()> {
    let private_address = private_address.unwrap_or(address).to_string();
    let host = match state.get_host(address)? {
        Some(known) => HostRecord {
            private_address,
            location: location.clone(),
            memory_bytes: if memory_bytes > 0 { memory_bytes } else { known.memory_bytes },
            ..known
        },
        None => HostRecord {
            address: address.to_string(),
            private_address,
            kind: HostKind::Edge,
            location: location.clone(),
            instance_id: None,
            node: None,
            memory_bytes,
            updated_at: 0,
        },
    };
    state.put_host(&host)
}

/// Stand-in provider when no cloud account is configured.
///
/// Sees no instances and refuses to create or change any.
pub struct NoCloud;

#[async_trait]
impl CloudProvider for NoCloud {
    async fn describe_instances(&self) -> anyhow::Result<Vec<CloudInstance>> {
        Ok(Vec::new())
    }

    async fn describe_instance(&self, _instance_id: &str) -> anyhow::Result<Option<CloudInstance>> {
        Ok(None)
    }

    async fn launch_instance(&self, zone: &str) -> anyhow::Result<CloudInstance> {
        anyhow::bail!("cloud disabled, cannot launch an instance in {zone}")
    }

    async fn start_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("cloud disabled, cannot start {instance_id}")
    }

    async fn stop_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("cloud disabled, cannot stop {instance_id}")
    }

    async fn terminate_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("cloud disabled, cannot terminate {instance_id}")
    }
}
