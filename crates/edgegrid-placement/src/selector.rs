//! Placement selector: picks the host a container should run on.
//!
//! Candidates are bucketed by geographic affinity to the target location
//! (same city > same country > same region > elsewhere). Edge hosts are
//! tried before cloud hosts; inside the best non-empty bucket the pick is
//! uniformly random. When no host qualifies a cloud instance is provisioned
//! near the target and selection is retried once.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use edgegrid_state::{Coordinates, HostKind, HostLocation, HostRecord, StateStore};

use crate::error::{PlacementError, PlacementResult};
use crate::geo::distance_km;

/// Live resource check against a host.
///
/// An error means the host could not be reached and is skipped.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn available_memory(&self, host: &HostRecord) -> anyhow::Result<u64>;
}

/// Brings up new capacity when nothing fits.
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Provision a cloud host near `coordinates` and return it joined and running.
    async fn provision_near(&self, coordinates: Coordinates) -> anyhow::Result<HostRecord>;
}

/// How close a host is to the requested location, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Affinity {
    SameCity,
    SameCountry,
    SameRegion,
    OtherRegion,
}

pub fn affinity(host: &HostLocation, target: &HostLocation) -> Affinity {
    let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
    if !same(&host.region, &target.region) {
        Affinity::OtherRegion
    } else if !same(&host.country, &target.country) {
        Affinity::SameRegion
    } else if !same(&host.city, &target.city) {
        Affinity::SameCountry
    } else {
        Affinity::SameCity
    }
}

/// A host considered for one placement request.
#[derive(Debug, Clone)]
pub struct PlacementCandidate {
    pub host: HostRecord,
    pub distance_km: f64,
    pub affinity: Affinity,
    pub has_capacity: bool,
}

pub struct PlacementSelector {
    state: StateStore,
    probe: Arc<dyn HostProbe>,
    provisioner: Arc<dyn HostProvisioner>,
    /// Region used only when no other region has room.
    avoid_region: Option<String>,
}

impl PlacementSelector {
    pub fn new(
        state: StateStore,
        probe: Arc<dyn HostProbe>,
        provisioner: Arc<dyn HostProvisioner>,
    ) -> Self {
        Self {
            state,
            probe,
            provisioner,
            avoid_region: None,
        }
    }

    pub fn with_avoid_region(mut self, region: Option<String>) -> Self {
        self.avoid_region = region;
        self
    }

    /// Score every active host against the request.
    pub async fn candidates(
        &self,
        expected_memory: u64,
        target: &HostLocation,
    ) -> PlacementResult<Vec<PlacementCandidate>> {
        let mut candidates = Vec::new();
        for host in self.state.list_hosts()? {
            if !host.is_active() {
                continue;
            }
            let has_capacity = self.has_capacity(&host, expected_memory).await;
            candidates.push(PlacementCandidate {
                distance_km: distance_km(host.location.coordinates, target.coordinates),
                affinity: affinity(&host.location, target),
                host,
                has_capacity,
            });
        }
        Ok(candidates)
    }

    async fn has_capacity(&self, host: &HostRecord, expected_memory: u64) -> bool {
        match self.probe.available_memory(host).await {
            Ok(available) => available >= expected_memory,
            Err(e) => {
                warn!(host = %host.address, error = %e, "host unreachable, skipping");
                false
            }
        }
    }

    /// Choose a host for `expected_memory` bytes near `target`.
    pub async fn select_host(
        &self,
        expected_memory: u64,
        target: &HostLocation,
    ) -> PlacementResult<HostRecord> {
        if let Some(host) = self.pick(expected_memory, target).await? {
            return Ok(host);
        }

        info!(expected_memory, city = %target.city, "no eligible host, provisioning a cloud host");
        let provisioned = self.provisioner.provision_near(target.coordinates).await?;
        debug!(host = %provisioned.address, "provisioned host, retrying selection");

        self.pick(expected_memory, target)
            .await?
            .ok_or(PlacementError::NoCapacity { expected_memory })
    }

    async fn pick(
        &self,
        expected_memory: u64,
        target: &HostLocation,
    ) -> PlacementResult<Option<HostRecord>> {
        let candidates = self.candidates(expected_memory, target).await?;
        let eligible: Vec<PlacementCandidate> =
            candidates.into_iter().filter(|c| c.has_capacity).collect();

        for kind in [HostKind::Edge, HostKind::Cloud] {
            let of_kind: Vec<&PlacementCandidate> =
                eligible.iter().filter(|c| c.host.kind == kind).collect();
            if let Some(host) = self.pick_best_bucket(&of_kind) {
                debug!(host = %host.address, ?kind, "placement selected");
                return Ok(Some(host));
            }
        }
        Ok(None)
    }

    fn pick_best_bucket(&self, candidates: &[&PlacementCandidate]) -> Option<HostRecord> {
        let best = candidates.iter().map(|c| c.affinity).min()?;
        let mut bucket: Vec<&PlacementCandidate> =
            candidates.iter().copied().filter(|c| c.affinity == best).collect();

        if best == Affinity::OtherRegion
            && let Some(avoid) = &self.avoid_region
        {
            let preferred: Vec<&PlacementCandidate> = bucket
                .iter()
                .copied()
                .filter(|c| !c.host.location.region.eq_ignore_ascii_case(avoid))
                .collect();
            if !preferred.is_empty() {
                bucket = preferred;
            }
        }

        bucket
            .choose(&mut rand::thread_rng())
            .map(|c| c.host.clone())
    }

    /// Nearest known host (active or not); provisions only when none is known.
    pub async fn closest_host(&self, coordinates: Coordinates) -> PlacementResult<HostRecord> {
        let hosts = self.state.list_hosts()?;
        if let Some(host) = nearest(hosts, coordinates) {
            return Ok(host);
        }
        info!("no known hosts, provisioning a cloud host");
        Ok(self.provisioner.provision_near(coordinates).await?)
    }

    /// Nearest known host that is not joined.
    pub fn closest_inactive_host(&self, coordinates: Coordinates) -> PlacementResult<Option<HostRecord>> {
        let hosts = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(|h| !h.is_active())
            .collect();
        Ok(nearest(hosts, coordinates))
    }

    /// Nearest active host with room for `expected_memory`, skipping `exclude`.
    ///
    /// Provisions near `coordinates` and retries once when none fits.
    pub async fn closest_capable_host(
        &self,
        expected_memory: u64,
        coordinates: Coordinates,
        exclude: &[&str],
    ) -> PlacementResult<HostRecord> {
        if let Some(host) = self.nearest_capable(expected_memory, coordinates, exclude).await? {
            return Ok(host);
        }
        info!(expected_memory, "no capable host, provisioning a cloud host");
        self.provisioner.provision_near(coordinates).await?;
        self.nearest_capable(expected_memory, coordinates, exclude)
            .await?
            .ok_or(PlacementError::NoCapacity { expected_memory })
    }

    async fn nearest_capable(
        &self,
        expected_memory: u64,
        coordinates: Coordinates,
        exclude: &[&str],
    ) -> PlacementResult<Option<HostRecord>> {
        let mut hosts: Vec<HostRecord> = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(|h| h.is_active() && !exclude.contains(&h.address.as_str()))
            .collect();
        sort_by_distance(&mut hosts, coordinates);
        for host in hosts {
            if self.has_capacity(&host, expected_memory).await {
                return Ok(Some(host));
            }
        }
        Ok(None)
    }
}

/// Closest first; an edge host wins a distance tie with a cloud host.
fn sort_by_distance(hosts: &mut [HostRecord], coordinates: Coordinates) {
    hosts.sort_by(|a, b| {
        distance_km(a.location.coordinates, coordinates)
            .total_cmp(&distance_km(b.location.coordinates, coordinates))
            .then((a.kind == HostKind::Cloud).cmp(&(b.kind == HostKind::Cloud)))
    });
}

fn nearest(mut hosts: Vec<HostRecord>, coordinates: Coordinates) -> Option<HostRecord> {
    sort_by_distance(&mut hosts, coordinates);
    hosts.into_iter().next()
}
