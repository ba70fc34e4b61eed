//! Container lifecycle: launch, replicate, migrate, stop, reconcile.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use edgegrid_placement::distance_km;
use edgegrid_state::{ContainerRecord, HostRecord, PortBinding, ServiceSpec, ServiceType, labels};

use crate::backends::{LaunchRequest, RunningContainer};
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, epoch_secs};

/// Launch parameters recomputed for every placement.
const PLACEMENT_PARAMS: [&str; 7] = [
    "hostname",
    "externalPort",
    "internalPort",
    "continent",
    "region",
    "country",
    "city",
];

type LaunchFuture<'a> = Pin<Box<dyn Future<Output = ExecutorResult<ContainerRecord>> + Send + 'a>>;

/// How a container is launched.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Reuse a container of the same service already on the host.
    pub singleton: bool,
    /// Track the container in the inventory.
    pub traceable: bool,
    /// Launch parameters already resolved (dependency addresses).
    pub params: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl LaunchOptions {
    /// A tracked application container.
    pub fn app() -> Self {
        Self {
            singleton: false,
            traceable: true,
            params: HashMap::new(),
            labels: HashMap::new(),
        }
    }

    /// An untracked per-host container, at most one per host.
    pub fn system() -> Self {
        Self {
            singleton: true,
            traceable: false,
            ..Self::app()
        }
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }
}

/// True for tracked containers that belong to an application service.
pub fn is_app_container(container: &ContainerRecord) -> bool {
    container.label(labels::SERVICE_TYPE) != Some(ServiceType::System.as_str())
}

/// Replace every `${name}` in `template` with its parameter value.
pub fn substitute(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in params {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

/// Recover launch parameters by lining up the launch command's tokens with
/// a running container's arguments.
pub fn dynamic_params(template: &str, args: &[String]) -> HashMap<String, String> {
    template
        .split_whitespace()
        .zip(args)
        .filter_map(|(token, arg)| {
            let name = token.strip_prefix("${")?.strip_suffix('}')?;
            Some((name.to_string(), arg.clone()))
        })
        .collect()
}

fn service_of(name: &str, container_labels: &HashMap<String, String>) -> String {
    container_labels
        .get(labels::SERVICE_NAME)
        .cloned()
        .unwrap_or_else(|| name.split('_').next().unwrap_or(name).to_string())
}

impl Executor {
    /// Launch a container of `spec` on `host`.
    ///
    /// Dependencies are resolved to addresses first: a database dependency
    /// always runs on the same host, any other one resolves to the nearest
    /// running container of that service or is launched on the same host.
    /// Non-traceable containers are returned but not persisted.
    pub async fn launch_container(
        &self,
        spec: &ServiceSpec,
        host: &HostRecord,
        options: LaunchOptions,
    ) -> ExecutorResult<ContainerRecord> {
        self.launch_boxed(spec, host, options, Vec::new()).await
    }

    fn launch_boxed<'a>(
        &'a self,
        spec: &'a ServiceSpec,
        host: &'a HostRecord,
        options: LaunchOptions,
        chain: Vec<String>,
    ) -> LaunchFuture<'a> {
        Box::pin(self.launch_in_chain(spec, host, options, chain))
    }

    async fn launch_in_chain(
        &self,
        spec: &ServiceSpec,
        host: &HostRecord,
        options: LaunchOptions,
        mut chain: Vec<String>,
    ) -> ExecutorResult<ContainerRecord> {
        if chain.contains(&spec.name) {
            return Err(ExecutorError::Conflict(format!(
                "dependency cycle: {} -> {}",
                chain.join(" -> "),
                spec.name
            )));
        }
        chain.push(spec.name.clone());

        if options.singleton
            && let Some(existing) = self.running_instance_on(&spec.name, host).await?
        {
            debug!(service = %spec.name, host = %host.address, "singleton already running");
            return Ok(existing);
        }

        let mut params = options.params.clone();
        for dependency in &spec.dependencies {
            let dep_spec = self
                .state
                .get_service(dependency)?
                .ok_or_else(|| ExecutorError::NotFound(format!("service {dependency}")))?;
            if params.contains_key(&dep_spec.output_label) {
                continue;
            }
            let address = self.resolve_dependency(&dep_spec, host, chain.clone()).await?;
            params.insert(dep_spec.output_label.clone(), address);
        }

        // Dependencies launched alongside have claimed their ports by now.
        let external_port = self.find_available_port(&host.address, spec.external_port).await?;
        let location = &host.location;
        for (name, value) in [
            ("hostname", host.address.clone()),
            ("externalPort", external_port.to_string()),
            ("internalPort", spec.internal_port.to_string()),
            ("continent", location.continent.clone()),
            ("region", location.region.clone()),
            ("country", location.country.clone()),
            ("city", location.city.clone()),
        ] {
            params.insert(name.to_string(), value);
        }

        let args: Vec<String> = substitute(&spec.launch_command, &params)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let service_address = format!("{}:{external_port}", host.address);

        let mut container_labels = options.labels.clone();
        for (key, value) in [
            (labels::MANAGED, "true".to_string()),
            (labels::SERVICE_NAME, spec.name.clone()),
            (labels::SERVICE_TYPE, spec.service_type.as_str().to_string()),
            (labels::SERVICE_ADDRESS, service_address),
            (labels::PUBLIC_ADDRESS, host.address.clone()),
            (
                labels::COORDINATES,
                format!("{},{}", location.coordinates.latitude, location.coordinates.longitude),
            ),
            (labels::REGION, location.region.clone()),
            (labels::TRACEABLE, options.traceable.to_string()),
        ] {
            container_labels.insert(key.to_string(), value);
        }

        let ports = vec![PortBinding {
            internal: spec.internal_port,
            external: external_port,
        }];
        let request = LaunchRequest {
            host: host.address.clone(),
            name: format!("{}_{:08x}", spec.name, rand::random::<u32>()),
            image: spec.image.clone(),
            ports: ports.clone(),
            env: vec![("SERVICE_REGION".to_string(), location.region.clone())],
            labels: container_labels.clone(),
            args: args.clone(),
        };
        let id = self.runtime.create_and_start(&request).await?;

        let record = ContainerRecord {
            id,
            name: request.name,
            service_name: spec.name.clone(),
            host_address: host.address.clone(),
            image: spec.image.clone(),
            ports,
            args,
            labels: container_labels,
            coordinates: location.coordinates,
            region: location.region.clone(),
            created_at: epoch_secs(),
        };
        if options.traceable {
            self.state.put_container(&record)?;
        }
        info!(container = %record.id, service = %spec.name, host = %host.address, port = external_port, "container launched");
        Ok(record)
    }

    async fn resolve_dependency(
        &self,
        dependency: &ServiceSpec,
        host: &HostRecord,
        chain: Vec<String>,
    ) -> ExecutorResult<String> {
        let options = if dependency.service_type == ServiceType::Database {
            LaunchOptions::app().singleton()
        } else {
            let mut running = self.state.list_containers_for_service(&dependency.name)?;
            running.sort_by(|a, b| {
                distance_km(a.coordinates, host.location.coordinates)
                    .total_cmp(&distance_km(b.coordinates, host.location.coordinates))
            });
            if let Some(address) = running.iter().find_map(|c| c.service_address().map(str::to_string)) {
                return Ok(address);
            }
            LaunchOptions::app()
        };
        info!(dependency = %dependency.name, host = %host.address, "launching dependency");
        let launched = self.launch_boxed(dependency, host, options, chain).await?;
        launched
            .service_address()
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::NotFound(format!("address of {}", launched.id)))
    }

    async fn running_instance_on(&self, service: &str, host: &HostRecord) -> ExecutorResult<Option<ContainerRecord>> {
        if let Some(tracked) = self
            .state
            .list_containers_on_host(&host.address)?
            .into_iter()
            .find(|c| c.service_name == service)
        {
            return Ok(Some(tracked));
        }
        let running = self.runtime.list(&host.address).await?;
        Ok(running
            .into_iter()
            .find(|c| c.labels.get(labels::SERVICE_NAME).map(String::as_str) == Some(service))
            .map(|c| record_from_running(c, host)))
    }

    /// Start a copy of a tracked container on `to_host`.
    ///
    /// The service and its dependency addresses are reconstructed from the
    /// running container's name and arguments.
    pub async fn replicate_container(&self, container_id: &str, to_host: &str) -> ExecutorResult<ContainerRecord> {
        let record = self
            .state
            .get_container(container_id)?
            .ok_or_else(|| ExecutorError::NotFound(format!("container {container_id}")))?;
        let mut source = record.clone();
        if let Some(running) = self.runtime.inspect(&record.host_address, container_id).await? {
            source.args = running.args;
            source.ports = running.ports;
        }
        self.replicate_record(&source, to_host, HashMap::new()).await
    }

    /// Launch a copy of `record` on `to_host`, adding `extra_labels`.
    ///
    /// Works for containers that no longer run, which is how crashed
    /// containers are recovered.
    pub async fn replicate_record(
        &self,
        record: &ContainerRecord,
        to_host: &str,
        extra_labels: HashMap<String, String>,
    ) -> ExecutorResult<ContainerRecord> {
        let service = service_of(&record.name, &record.labels);
        let mut spec = self
            .state
            .get_service(&service)?
            .ok_or_else(|| ExecutorError::NotFound(format!("service {service}")))?;
        let host = self
            .state
            .get_host(to_host)?
            .ok_or_else(|| ExecutorError::NotFound(format!("host {to_host}")))?;
        if let Some(binding) = record.ports.first() {
            spec.internal_port = binding.internal;
        }

        let mut params = dynamic_params(&spec.launch_command, &record.args);
        params.retain(|name, _| !PLACEMENT_PARAMS.contains(&name.as_str()));

        let mut container_labels: HashMap<String, String> = record
            .labels
            .iter()
            .filter(|(key, _)| key.as_str() == labels::RECOVERY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        container_labels.extend(extra_labels);

        let options = LaunchOptions::app().with_params(params).with_labels(container_labels);
        let replica = self.launch_container(&spec, &host, options).await?;
        info!(from = %record.id, to = %replica.id, host = %to_host, "container replicated");
        Ok(replica)
    }

    /// Replicate onto `to_host`, then stop the original after the grace
    /// period. Returns once the replica runs.
    pub async fn migrate_container(self: &Arc<Self>, container_id: &str, to_host: &str) -> ExecutorResult<ContainerRecord> {
        let replica = self.replicate_container(container_id, to_host).await?;

        let this = Arc::clone(self);
        let original = container_id.to_string();
        self.deferred
            .schedule(container_id, self.settings.migration_stop_delay, async move {
                if let Err(e) = this.stop_container_now(&original).await {
                    warn!(container = %original, error = %e, "deferred stop after migration failed");
                }
            })
            .await;
        info!(container = %container_id, replica = %replica.id, host = %to_host, "container migrating");
        Ok(replica)
    }

    /// Stop a tracked container and cancel any deferred action on it.
    pub async fn stop_container(&self, container_id: &str) -> ExecutorResult<()> {
        self.deferred.cancel(container_id).await;
        self.stop_container_now(container_id).await
    }

    pub(crate) async fn stop_container_now(&self, container_id: &str) -> ExecutorResult<()> {
        let record = self
            .state
            .get_container(container_id)?
            .ok_or_else(|| ExecutorError::NotFound(format!("container {container_id}")))?;
        if let Err(e) = self.runtime.stop(&record.host_address, container_id).await {
            if self.runtime.inspect(&record.host_address, container_id).await?.is_some() {
                return Err(e.into());
            }
            debug!(container = %container_id, "container already gone");
        }
        self.state.delete_container(container_id)?;
        info!(container = %container_id, host = %record.host_address, "container stopped");
        Ok(())
    }

    /// Reconcile tracked containers with what actually runs.
    ///
    /// Tracked containers that no longer run are dropped and returned as
    /// crashed. Running managed, traceable containers that are not tracked
    /// are adopted. Unreachable hosts are skipped.
    pub async fn sync_containers(&self) -> ExecutorResult<Vec<ContainerRecord>> {
        let mut crashed = Vec::new();
        for host in self.state.list_hosts()?.into_iter().filter(HostRecord::is_active) {
            let running = match self.runtime.list(&host.address).await {
                Ok(running) => running,
                Err(e) => {
                    warn!(host = %host.address, error = %e, "cannot list containers, skipping host");
                    continue;
                }
            };
            let running_ids: HashSet<&str> = running.iter().map(|c| c.id.as_str()).collect();

            for record in self.state.list_containers_on_host(&host.address)? {
                if !running_ids.contains(record.id.as_str()) {
                    self.state.delete_container(&record.id)?;
                    warn!(container = %record.id, service = %record.service_name, host = %host.address, "container vanished");
                    crashed.push(record);
                }
            }

            for container in &running {
                let managed = container.labels.contains_key(labels::MANAGED);
                let traceable = container.labels.get(labels::TRACEABLE).map(String::as_str) != Some("false");
                if managed && traceable && self.state.get_container(&container.id)?.is_none() {
                    let record = record_from_running(container.clone(), &host);
                    self.state.put_container(&record)?;
                    info!(container = %record.id, host = %host.address, "adopted untracked container");
                }
            }
        }
        Ok(crashed)
    }
}

fn record_from_running(container: RunningContainer, host: &HostRecord) -> ContainerRecord {
    ContainerRecord {
        service_name: service_of(&container.name, &container.labels),
        id: container.id,
        name: container.name,
        host_address: host.address.clone(),
        image: container.image,
        ports: container.ports,
        args: container.args,
        labels: container.labels,
        coordinates: host.location.coordinates,
        region: host.location.region.clone(),
        created_at: epoch_secs(),
    }
}
