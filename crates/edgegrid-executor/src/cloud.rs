//! Cloud instance lifecycle.
//!
//! Drives tagged instances through `pending → running → stopping → stopped
//! → shutting-down → terminated`. Every transition issues the provider call
//! and then polls until the instance reports the target state; the call is
//! retried a bounded number of times with a fixed delay, and a poll that
//! exceeds its bound surfaces as a retryable [`ExecutorError::Timeout`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use edgegrid_placement::{closest_region, distance_km, region_by_zone};
use edgegrid_state::{CloudInstance, Coordinates, InstanceState, StateStore};

use crate::backends::CloudProvider;
use crate::error::{ExecutorError, ExecutorResult};

/// Tunables for provider calls and state polling.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(180),
        }
    }
}

/// States an instance can be explicitly driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Running,
    Stopped,
    Terminated,
}

impl TargetState {
    fn as_instance_state(self) -> InstanceState {
        match self {
            Self::Running => InstanceState::Running,
            Self::Stopped => InstanceState::Stopped,
            Self::Terminated => InstanceState::Terminated,
        }
    }
}

/// Cloud instance manager.
#[derive(Clone)]
pub struct CloudManager {
    provider: Arc<dyn CloudProvider>,
    state: StateStore,
    settings: CloudSettings,
}

impl CloudManager {
    pub fn new(provider: Arc<dyn CloudProvider>, state: StateStore, settings: CloudSettings) -> Self {
        Self {
            provider,
            state,
            settings,
        }
    }

    /// Refresh the persisted instance table from the provider.
    pub async fn sync_instances(&self) -> ExecutorResult<Vec<CloudInstance>> {
        let instances = self.provider.describe_instances().await?;
        let live: HashSet<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        for known in self.state.list_cloud_instances()? {
            if !live.contains(known.instance_id.as_str()) {
                self.state.delete_cloud_instance(&known.instance_id)?;
                debug!(instance = %known.instance_id, "dropped vanished instance");
            }
        }
        for instance in &instances {
            self.persist(instance)?;
        }
        Ok(instances)
    }

    pub async fn start_instance(&self, instance_id: &str) -> ExecutorResult<CloudInstance> {
        self.set_instance_state(instance_id, TargetState::Running).await
    }

    pub async fn stop_instance(&self, instance_id: &str) -> ExecutorResult<CloudInstance> {
        self.set_instance_state(instance_id, TargetState::Stopped).await
    }

    pub async fn terminate_instance(&self, instance_id: &str) -> ExecutorResult<CloudInstance> {
        self.set_instance_state(instance_id, TargetState::Terminated).await
    }

    /// Drive an instance to `target`, retrying the provider call.
    pub async fn set_instance_state(
        &self,
        instance_id: &str,
        target: TargetState,
    ) -> ExecutorResult<CloudInstance> {
        let wanted = target.as_instance_state();
        let current = self.describe(instance_id).await?;
        if current.state == wanted {
            debug!(instance = %instance_id, state = %wanted, "instance already in target state");
            self.persist(&current)?;
            return Ok(current);
        }
        if current.state.is_terminal() && target != TargetState::Terminated {
            return Err(ExecutorError::NotFound(format!(
                "instance {instance_id} is {}",
                current.state
            )));
        }

        let mut last_error = ExecutorError::Transient(format!("instance {instance_id}: no attempt made"));
        for attempt in 1..=self.settings.max_retries.max(1) {
            let call = match target {
                TargetState::Running => self.provider.start_instance(instance_id).await,
                TargetState::Stopped => self.provider.stop_instance(instance_id).await,
                TargetState::Terminated => self.provider.terminate_instance(instance_id).await,
            };
            let outcome = match call {
                Ok(()) => self.wait_for_state(instance_id, wanted).await,
                Err(e) => Err(ExecutorError::from(e)),
            };
            match outcome {
                Ok(instance) => {
                    info!(instance = %instance_id, state = %wanted, attempt, "instance state changed");
                    self.persist(&instance)?;
                    return Ok(instance);
                }
                Err(e) if e.is_retryable() => {
                    warn!(instance = %instance_id, state = %wanted, attempt, error = %e, "instance state change failed, retrying");
                    last_error = e;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Poll until the instance reports `wanted`, bounded by the poll timeout.
    async fn wait_for_state(&self, instance_id: &str, wanted: InstanceState) -> ExecutorResult<CloudInstance> {
        let poll = async {
            loop {
                let instance = self.describe(instance_id).await?;
                if instance.state == wanted {
                    return Ok(instance);
                }
                if instance.state.is_terminal() && wanted != InstanceState::Terminated {
                    return Err(ExecutorError::NotFound(format!(
                        "instance {instance_id} went {} while waiting for {wanted}",
                        instance.state
                    )));
                }
                debug!(instance = %instance_id, state = %instance.state, target = %wanted, "waiting for instance");
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.settings.poll_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(format!(
                "instance {instance_id} did not reach {wanted} within {:?}",
                self.settings.poll_timeout
            ))),
        }
    }

    async fn describe(&self, instance_id: &str) -> ExecutorResult<CloudInstance> {
        self.provider
            .describe_instance(instance_id)
            .await?
            .ok_or_else(|| ExecutorError::NotFound(format!("instance {instance_id}")))
    }

    /// Launch a new instance in the region closest to `coordinates` and wait
    /// until it runs.
    pub async fn launch_instance(&self, coordinates: Coordinates) -> ExecutorResult<CloudInstance> {
        let region = closest_region(coordinates);
        info!(zone = region.zone, "launching cloud instance");
        let launched = self.provider.launch_instance(region.zone).await?;
        self.persist(&launched)?;
        if launched.state == InstanceState::Running {
            return Ok(launched);
        }
        let running = self.wait_for_state(&launched.instance_id, InstanceState::Running).await?;
        self.persist(&running)?;
        Ok(running)
    }

    /// Pick an instance to host new work near `coordinates`.
    ///
    /// Prefers a running instance that is not in the swarm, then a stopped
    /// one (started here), and only then launches a new instance. Among
    /// reusable instances the one whose zone is closest wins.
    pub async fn choose_instance(
        &self,
        coordinates: Coordinates,
        in_swarm: &HashSet<String>,
    ) -> ExecutorResult<CloudInstance> {
        let mut instances = self.sync_instances().await?;
        instances.sort_by(|a, b| zone_distance(&a.zone, coordinates).total_cmp(&zone_distance(&b.zone, coordinates)));

        let idle = instances.iter().find(|i| {
            i.state == InstanceState::Running
                && i.public_address.as_ref().is_none_or(|a| !in_swarm.contains(a))
        });
        if let Some(instance) = idle {
            info!(instance = %instance.instance_id, "reusing running instance");
            return Ok(instance.clone());
        }

        if let Some(stopped) = instances.iter().find(|i| i.state == InstanceState::Stopped) {
            info!(instance = %stopped.instance_id, "starting stopped instance");
            return self.start_instance(&stopped.instance_id).await;
        }

        self.launch_instance(coordinates).await
    }

    fn persist(&self, instance: &CloudInstance) -> ExecutorResult<()> {
        if instance.state == InstanceState::Terminated {
            self.state.delete_cloud_instance(&instance.instance_id)?;
        } else {
            let mut instance = instance.clone();
            instance.updated_at = epoch_secs();
            self.state.put_cloud_instance(&instance)?;
        }
        Ok(())
    }
}

fn zone_distance(zone: &str, coordinates: Coordinates) -> f64 {
    region_by_zone(zone)
        .map(|r| distance_km(r.coordinates, coordinates))
        .unwrap_or(f64::MAX)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
