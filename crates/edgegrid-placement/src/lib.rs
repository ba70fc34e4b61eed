//! edgegrid-placement — where should a workload run?
//!
//! Chooses a host for a new or relocated container using geographic
//! affinity and a live memory check, and falls back to provisioning a cloud
//! instance in the region closest to the target when nothing fits.
//!
//! # Components
//!
//! - **`geo`**: great-circle distance, cloud region table, weighted midpoint
//! - **`selector`**: `PlacementSelector` plus the `HostProbe` and
//!   `HostProvisioner` seams it is wired through

pub mod error;
pub mod geo;
pub mod selector;

pub use error::{PlacementError, PlacementResult};
pub use geo::{AWS_REGIONS, CloudRegion, DEFAULT_ZONE, closest_region, distance_km, region_by_zone, weighted_middle_point};
pub use selector::{Affinity, HostProbe, HostProvisioner, PlacementCandidate, PlacementSelector, affinity};
