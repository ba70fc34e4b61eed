//! Geographic helpers: distances, cloud regions, weighted midpoint.

use edgegrid_state::Coordinates;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle (haversine) distance in kilometres.
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// A cloud region new instances can be launched in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudRegion {
    pub zone: &'static str,
    pub name: &'static str,
    pub continent: &'static str,
    pub coordinates: Coordinates,
}

const fn region(
    zone: &'static str,
    name: &'static str,
    continent: &'static str,
    latitude: f64,
    longitude: f64,
) -> CloudRegion {
    CloudRegion {
        zone,
        name,
        continent,
        coordinates: Coordinates::new(latitude, longitude),
    }
}

/// Zone used when no coordinates are known.
pub const DEFAULT_ZONE: &str = "us-west-2";

pub static AWS_REGIONS: [CloudRegion; 20] = [
    region("us-east-1", "US East (N. Virginia)", "north-america", 38.946728, -77.443386),
    region("us-east-2", "US East (Ohio)", "north-america", 39.958587, -82.997058),
    region("us-west-1", "US West (N. California)", "north-america", 37.758891, -122.443318),
    region("us-west-2", "US West (Oregon)", "north-america", 45.841904, -119.296774),
    region("af-south-1", "Africa (Cape Town)", "africa", -33.953923, 18.566379),
    region("ap-east-1", "Asia Pacific (Hong Kong)", "asia", 22.321326, 114.172109),
    region("ap-south-1", "Asia Pacific (Mumbai)", "asia", 19.085863, 72.873766),
    region("ap-northeast-2", "Asia Pacific (Seoul)", "asia", 37.562049, 127.007511),
    region("ap-southeast-1", "Asia Pacific (Singapore)", "asia", 1.353010, 103.869377),
    region("ap-southeast-2", "Asia Pacific (Sydney)", "oceania", -33.831767, 151.007401),
    region("ap-northeast-1", "Asia Pacific (Tokyo)", "asia", 35.688572, 139.618912),
    region("ca-central-1", "Canada (Central)", "north-america", 45.508968, -73.616289),
    region("eu-central-1", "Europe (Frankfurt)", "europe", 50.110991, 8.632203),
    region("eu-west-1", "Europe (Ireland)", "europe", 53.346174, -6.272156),
    region("eu-west-2", "Europe (London)", "europe", 51.516689, -0.134100),
    region("eu-south-1", "Europe (Milan)", "europe", 45.469902, 9.179905),
    region("eu-west-3", "Europe (Paris)", "europe", 48.879382, 2.341615),
    region("eu-north-1", "Europe (Stockholm)", "europe", 59.329544, 18.066653),
    region("me-south-1", "Middle East (Bahrain)", "asia", 26.233356, 50.585524),
    region("sa-east-1", "South America (São Paulo)", "south-america", -23.576129, -46.614103),
];

pub fn region_by_zone(zone: &str) -> Option<&'static CloudRegion> {
    AWS_REGIONS.iter().find(|r| r.zone == zone)
}

/// The region nearest to the given point.
pub fn closest_region(coordinates: Coordinates) -> &'static CloudRegion {
    AWS_REGIONS
        .iter()
        .min_by(|a, b| {
            distance_km(a.coordinates, coordinates).total_cmp(&distance_km(b.coordinates, coordinates))
        })
        .unwrap_or(&AWS_REGIONS[3])
}

/// Geographic midpoint of weighted points, or `None` without positive weight.
///
/// Points are averaged as unit vectors so the result stays correct across
/// the antimeridian.
pub fn weighted_middle_point(points: &[(Coordinates, f64)]) -> Option<Coordinates> {
    let total: f64 = points.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
    for (point, weight) in points {
        let weight = weight.max(0.0) / total;
        let (lat, lon) = (point.latitude.to_radians(), point.longitude.to_radians());
        x += lat.cos() * lon.cos() * weight;
        y += lat.cos() * lon.sin() * weight;
        z += lat.sin() * weight;
    }
    let lon = y.atan2(x);
    let lat = z.atan2((x * x + y * y).sqrt());
    Some(Coordinates::new(lat.to_degrees(), lon.to_degrees()))
}
