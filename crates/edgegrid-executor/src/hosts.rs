//! Host membership: join, leave, start and stop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use edgegrid_state::{HostKind, HostRecord, NodeMembership, NodeRole, NodeState, labels};

use crate::containers::{LaunchOptions, is_app_container};
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, epoch_secs};

/// Lists the ports something is listening on, one per line.
const LISTENING_PORTS_COMMAND: &str = "lsof -i -P -n | grep LISTEN | awk '{print $9}' | cut -d: -f2";

impl Executor {
    /// Join a registered host to the swarm.
    ///
    /// The whole sequence (reachability, proxy, membership, node labels) is
    /// retried up to `join_attempts` times, sleeping `attempt` seconds
    /// between attempts. A host already present as a ready node is treated
    /// as joined, promoted or demoted to `role` when needed; one present but
    /// down is removed and joined again.
    pub async fn join_host(&self, address: &str, role: NodeRole) -> ExecutorResult<HostRecord> {
        let mut host = self
            .state
            .get_host(address)?
            .ok_or_else(|| ExecutorError::NotFound(format!("host {address}")))?;

        if host.kind == HostKind::Cloud
            && let Some(instance_id) = host.instance_id.clone()
        {
            self.cloud.start_instance(&instance_id).await?;
        }

        let attempts = self.settings.join_attempts.max(1);
        let mut attempt = 0;
        let membership = loop {
            attempt += 1;
            match self.try_join(&host, role).await {
                Ok(membership) => break membership,
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(ExecutorError::Transient(format!(
                        "host {address} unreachable after {attempts} join attempts: {e}"
                    )));
                }
                Err(e) => {
                    warn!(host = %address, attempt, error = %e, "join failed, retrying");
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
            }
        };

        host.node = Some(membership);
        host.updated_at = epoch_secs();
        self.state.put_host(&host)?;
        info!(host = %address, role = ?host.node.as_ref().map(|n| n.role), attempt, "host joined");

        for service in &self.settings.background_services {
            if let Err(e) = self.launch_system_service(service, &host).await {
                warn!(host = %address, %service, error = %e, "background service not started");
            }
        }
        Ok(host)
    }

    async fn try_join(&self, host: &HostRecord, role: NodeRole) -> ExecutorResult<NodeMembership> {
        self.runner.run(&host.address, "true").await?;

        if let Some(proxy) = &self.settings.proxy_service {
            self.launch_system_service(proxy, host).await?;
        }

        let nodes = self.swarm.list_nodes().await?;
        if let Some(node) = nodes.iter().find(|n| n.address == host.address) {
            match node.state {
                NodeState::Ready => {
                    debug!(host = %host.address, node = %node.node_id, "already a swarm member");
                    let role = self.reconcile_role(host, &node.node_id, node.role, role).await?;
                    self.label_node(&node.node_id, host, false).await?;
                    return Ok(NodeMembership {
                        node_id: node.node_id.clone(),
                        role,
                        state: NodeState::Ready,
                    });
                }
                NodeState::Down => {
                    info!(host = %host.address, node = %node.node_id, "removing down node before rejoin");
                    self.swarm.remove_node(&node.node_id).await?;
                }
            }
        }

        let has_manager = nodes
            .iter()
            .any(|n| n.role == NodeRole::Manager && n.state == NodeState::Ready);
        let initialised = !has_manager && self.context.is_local(&host.address);
        let (node_id, role) = if initialised {
            (self.swarm.init(host).await?, NodeRole::Manager)
        } else {
            (self.swarm.join(host, role).await?, role)
        };
        self.label_node(&node_id, host, initialised).await?;
        Ok(NodeMembership {
            node_id,
            role,
            state: NodeState::Ready,
        })
    }

    /// Move an existing node to the requested role. The local host is never
    /// demoted.
    async fn reconcile_role(
        &self,
        host: &HostRecord,
        node_id: &str,
        current: NodeRole,
        wanted: NodeRole,
    ) -> ExecutorResult<NodeRole> {
        match (current, wanted) {
            (NodeRole::Worker, NodeRole::Manager) => {
                self.swarm.promote(node_id).await?;
                info!(host = %host.address, node = %node_id, "node promoted to manager");
                Ok(NodeRole::Manager)
            }
            (NodeRole::Manager, NodeRole::Worker) if !self.context.is_local(&host.address) => {
                self.swarm.demote(node_id).await?;
                info!(host = %host.address, node = %node_id, "node demoted to worker");
                Ok(NodeRole::Worker)
            }
            _ => Ok(current),
        }
    }

    /// Placement metadata carried by the node: private address,
    /// coordinates and region.
    async fn label_node(&self, node_id: &str, host: &HostRecord, master: bool) -> ExecutorResult<()> {
        let coordinates = host.location.coordinates;
        let mut node_labels = vec![
            (labels::PRIVATE_ADDRESS, host.private_address.clone()),
            (
                labels::COORDINATES,
                format!("{},{}", coordinates.latitude, coordinates.longitude),
            ),
            (labels::REGION, host.location.region.clone()),
        ];
        if master {
            node_labels.push((labels::MASTER_MANAGER, "true".to_string()));
        }
        for (key, value) in node_labels {
            self.swarm.set_label(node_id, key, &value).await?;
        }
        Ok(())
    }

    async fn launch_system_service(&self, name: &str, host: &HostRecord) -> ExecutorResult<()> {
        let spec = self
            .state
            .get_service(name)?
            .ok_or_else(|| ExecutorError::NotFound(format!("service {name}")))?;
        self.launch_container(&spec, host, LaunchOptions::system()).await?;
        Ok(())
    }

    /// Remove a host from the swarm.
    ///
    /// App containers are replicated to the closest capable host and every
    /// container on the host is stopped before membership is dropped. A
    /// cloud host's instance is stopped afterwards so it can be reused.
    /// The manager host never leaves.
    pub async fn leave_host(self: &Arc<Self>, address: &str) -> ExecutorResult<HostRecord> {
        let mut host = self
            .state
            .get_host(address)?
            .ok_or_else(|| ExecutorError::NotFound(format!("host {address}")))?;
        if host.is_manager() || self.context.is_local(address) {
            return Err(ExecutorError::Refused(format!("{address} is a manager host")));
        }

        let placement = self.placement();
        for container in self.state.list_containers_on_host(address)? {
            self.deferred.cancel(&container.id).await;
            if is_app_container(&container) {
                let expected = self
                    .state
                    .get_service(&container.service_name)?
                    .map(|s| s.expected_memory_bytes)
                    .unwrap_or_default();
                let relocated = match placement
                    .closest_capable_host(expected, container.coordinates, &[address])
                    .await
                {
                    Ok(target) => self.replicate_record(&container, &target.address, Default::default()).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = relocated {
                    warn!(container = %container.id, error = %e, "container not relocated before leave");
                }
            }
            if let Err(e) = self.stop_container_now(&container.id).await {
                warn!(container = %container.id, error = %e, "container not stopped before leave");
            }
        }

        // Untracked system containers (proxy, exporters).
        match self.runtime.list(address).await {
            Ok(running) => {
                for container in running.iter().filter(|c| c.labels.contains_key(labels::MANAGED)) {
                    if let Err(e) = self.runtime.stop(address, &container.id).await {
                        warn!(container = %container.id, error = %e, "system container not stopped");
                    }
                }
            }
            Err(e) => warn!(host = %address, error = %e, "could not list containers before leave"),
        }

        if let Some(node) = host.node.take() {
            if let Err(e) = self.swarm.leave(&host).await {
                warn!(host = %address, error = %e, "swarm leave failed");
            }
            self.swarm.remove_node(&node.node_id).await?;
        }
        host.updated_at = epoch_secs();
        self.state.put_host(&host)?;
        info!(host = %address, "host left the swarm");

        if host.kind == HostKind::Cloud
            && let Some(instance_id) = &host.instance_id
        {
            self.cloud.stop_instance(instance_id).await?;
        }
        Ok(host)
    }

    /// Bring capacity up next to an overloaded host.
    ///
    /// Joins the closest inactive known host, or provisions a cloud host
    /// when none is left, then moves one random app container of the
    /// overloaded host onto it.
    pub async fn start_host_near(self: &Arc<Self>, overloaded: &str) -> ExecutorResult<HostRecord> {
        let source = self
            .state
            .get_host(overloaded)?
            .ok_or_else(|| ExecutorError::NotFound(format!("host {overloaded}")))?;
        let coordinates = source.location.coordinates;

        let started = match self.placement().closest_inactive_host(coordinates)? {
            Some(idle) => self.join_host(&idle.address, NodeRole::Worker).await?,
            None => self.provision_cloud_host(coordinates).await?,
        };

        let apps: Vec<_> = self
            .state
            .list_containers_on_host(overloaded)?
            .into_iter()
            .filter(is_app_container)
            .collect();
        let picked = apps.choose(&mut rand::thread_rng()).cloned();
        if let Some(container) = picked {
            self.migrate_container(&container.id, &started.address).await?;
        }
        Ok(started)
    }

    /// First port at or above `from` that nothing on `host` listens on or
    /// has been assigned to.
    pub async fn find_available_port(&self, host: &str, from: u16) -> ExecutorResult<u16> {
        let output = self.runner.run(host, LISTENING_PORTS_COMMAND).await?;
        let mut used: HashSet<u16> = output.lines().filter_map(|l| l.trim().parse().ok()).collect();
        for container in self.state.list_containers_on_host(host)? {
            used.extend(container.ports.iter().map(|p| p.external));
        }
        (from.max(1)..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or_else(|| ExecutorError::Conflict(format!("no free port on {host} from {from}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use crate::mock::{Fixture, MANAGER, service};
    use edgegrid_state::{InstanceState, ServiceType};

    #[tokio::test(start_paused = true)]
    async fn join_registers_worker_node() {
        let f = Fixture::new();
        f.edge_host("10.0.0.2", "porto", false);

        let host = f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        assert!(host.is_active());
        assert_eq!(host.node.unwrap().role, NodeRole::Worker);
        assert!(f.swarm.calls().contains(&"join 10.0.0.2 Worker".to_string()));
        assert!(f.state.get_host("10.0.0.2").unwrap().unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_with_growing_backoff() {
        let f = Fixture::new();
        f.edge_host("10.0.0.2", "porto", false);
        f.swarm.fail_next_joins(3);

        let started = tokio::time::Instant::now();
        f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        // 1s + 2s + 3s between the four attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        let joins = f.swarm.calls().iter().filter(|c| c.starts_with("join")).count();
        assert_eq!(joins, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn join_gives_up_after_five_attempts() {
        let f = Fixture::new();
        f.edge_host("10.0.0.2", "porto", false);
        f.runner.set_unreachable("10.0.0.2", true);

        let err = f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap_err();
        assert!(err.is_retryable());
        let probes = f.runner.commands.lock().unwrap().iter().filter(|(h, _)| h == "10.0.0.2").count();
        assert_eq!(probes, 5);
        assert!(!f.state.get_host("10.0.0.2").unwrap().unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn down_node_is_removed_and_rejoined() {
        let f = Fixture::new();
        f.edge_host("10.0.0.2", "porto", false);
        f.swarm.add_node("10.0.0.2", NodeRole::Worker, NodeState::Down);

        f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        let calls = f.swarm.calls();
        assert_eq!(calls, vec!["rm node-10.0.0.2".to_string(), "join 10.0.0.2 Worker".to_string()]);
        assert_eq!(f.swarm.node("10.0.0.2").unwrap().state, NodeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn local_host_initialises_swarm_without_manager() {
        let f = Fixture::new();
        f.swarm.nodes.lock().unwrap().clear();
        let host = f.executor.join_host(MANAGER, NodeRole::Manager).await.unwrap();
        assert_eq!(host.node.unwrap().role, NodeRole::Manager);
        assert_eq!(f.swarm.calls(), vec![format!("init {MANAGER}")]);
    }

    #[tokio::test(start_paused = true)]
    async fn joined_node_carries_placement_labels() {
        let f = Fixture::new();
        let porto = f.edge_host("10.0.0.2", "porto", false);

        f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        let node = f.swarm.node("10.0.0.2").unwrap();
        let coordinates = format!("{},{}", porto.location.coordinates.latitude, porto.location.coordinates.longitude);
        assert_eq!(node.labels.get(labels::PRIVATE_ADDRESS), Some(&porto.private_address));
        assert_eq!(node.labels.get(labels::COORDINATES), Some(&coordinates));
        assert_eq!(node.labels.get(labels::REGION), Some(&porto.location.region));
        assert!(!node.labels.contains_key(labels::MASTER_MANAGER));
    }

    #[tokio::test(start_paused = true)]
    async fn initialising_node_is_labelled_master() {
        let f = Fixture::new();
        f.swarm.nodes.lock().unwrap().clear();
        f.executor.join_host(MANAGER, NodeRole::Manager).await.unwrap();
        let node = f.swarm.node(MANAGER).unwrap();
        assert_eq!(node.labels.get(labels::MASTER_MANAGER).map(String::as_str), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_node_is_moved_to_requested_role() {
        let f = Fixture::new();
        f.edge_host("10.0.0.2", "porto", false);
        f.swarm.add_node("10.0.0.2", NodeRole::Worker, NodeState::Ready);

        let host = f.executor.join_host("10.0.0.2", NodeRole::Manager).await.unwrap();
        assert_eq!(host.node.unwrap().role, NodeRole::Manager);
        assert_eq!(f.swarm.calls(), vec!["promote node-10.0.0.2".to_string()]);
        assert_eq!(f.swarm.node("10.0.0.2").unwrap().role, NodeRole::Manager);

        let host = f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        assert_eq!(host.node.unwrap().role, NodeRole::Worker);
        assert_eq!(f.swarm.calls().last().map(String::as_str), Some("demote node-10.0.0.2"));

        f.executor.join_host(MANAGER, NodeRole::Worker).await.unwrap();
        assert_eq!(f.swarm.node(MANAGER).unwrap().role, NodeRole::Manager);
    }

    #[tokio::test(start_paused = true)]
    async fn join_launches_proxy_and_background_services() {
        let f = Fixture::with_settings(ExecutorSettings {
            proxy_service: Some("proxy".to_string()),
            background_services: vec!["exporter".to_string()],
            ..Default::default()
        });
        f.state.put_service(&service("proxy", ServiceType::System, "", &[])).unwrap();
        f.state.put_service(&service("exporter", ServiceType::System, "", &[])).unwrap();
        f.edge_host("10.0.0.2", "porto", false);

        f.executor.join_host("10.0.0.2", NodeRole::Worker).await.unwrap();
        let names: Vec<String> = f.runtime.running_on("10.0.0.2").into_iter().map(|c| c.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.starts_with("proxy_")));
        assert!(names.iter().any(|n| n.starts_with("exporter_")));
        // System containers are not tracked.
        assert!(f.state.list_containers_on_host("10.0.0.2").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_never_leaves() {
        let f = Fixture::new();
        let err = f.executor.leave_host(MANAGER).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Refused(_)));
        assert!(f.state.get_host(MANAGER).unwrap().unwrap().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_relocates_apps_and_drops_membership() {
        let f = Fixture::new();
        let web = service("web", ServiceType::Frontend, "--port ${internalPort}", &[]);
        f.state.put_service(&web).unwrap();
        let leaving = f.edge_host("10.0.0.2", "porto", true);
        f.edge_host("10.0.0.3", "madrid", true);
        let c = f.executor.launch_container(&web, &leaving, LaunchOptions::app()).await.unwrap();

        f.executor.leave_host("10.0.0.2").await.unwrap();

        assert!(f.state.get_container(&c.id).unwrap().is_none());
        assert!(f.runtime.running_on("10.0.0.2").is_empty());
        assert!(f.swarm.node("10.0.0.2").is_none());
        assert!(!f.state.get_host("10.0.0.2").unwrap().unwrap().is_active());
        // Porto is closer to the manager in Lisbon than to Madrid.
        let moved = f.state.list_containers_for_service("web").unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].host_address, MANAGER);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_cloud_host_stops_its_instance() {
        let f = Fixture::new();
        let lisbon = edgegrid_state::Coordinates::new(38.72, -9.14);
        let host = f.executor.provision_cloud_host(lisbon).await.unwrap();

        f.executor.leave_host(&host.address).await.unwrap();
        let id = host.instance_id.unwrap();
        assert_eq!(f.state.get_cloud_instance(&id).unwrap().unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_joins_closest_inactive_host_and_moves_one_container() {
        let f = Fixture::new();
        let api = service("api", ServiceType::Backend, "", &[]);
        f.state.put_service(&api).unwrap();
        let busy = f.edge_host("10.0.0.2", "lisbon", true);
        f.edge_host("10.0.0.3", "porto", false);
        f.edge_host("10.0.0.4", "madrid", false);
        f.executor.launch_container(&api, &busy, LaunchOptions::app()).await.unwrap();

        let started = f.executor.start_host_near("10.0.0.2").await.unwrap();
        assert_eq!(started.address, "10.0.0.3");
        assert!(started.is_active());
        assert_eq!(f.state.list_containers_on_host("10.0.0.3").unwrap().len(), 1);
        assert!(f.executor.deferred().is_pending(&f.state.list_containers_on_host("10.0.0.2").unwrap()[0].id).await);
    }

    #[tokio::test]
    async fn free_port_skips_listening_and_assigned() {
        let f = Fixture::new();
        f.runner.set_listening("10.0.0.2", &[22, 8080, 8081]);
        assert_eq!(f.executor.find_available_port("10.0.0.2", 8080).await.unwrap(), 8082);
        assert_eq!(f.executor.find_available_port("10.0.0.2", 9000).await.unwrap(), 9000);
    }
}
