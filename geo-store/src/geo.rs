//! Great-circle distance and coarse bounding boxes on a spherical Earth.

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Whether `(latitude, longitude)` is a finite point inside the valid ranges.
pub fn is_valid_point(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Haversine distance in kilometres between two points given in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    // Rounding can push `a` marginally past 1 for antipodal points.
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Axis-aligned latitude/longitude box in degrees.
///
/// Only an approximation used to narrow candidate sets; callers still apply
/// the exact distance check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBox {
    /// Smallest box enclosing the circle of `radius_km` around the point.
    ///
    /// Returns `None` when the circle touches a pole or crosses the
    /// antimeridian, where a single box cannot describe it.
    pub fn around(latitude: f64, longitude: f64, radius_km: f64) -> Option<Self> {
        if !is_valid_point(latitude, longitude) || !(radius_km.is_finite() && radius_km > 0.0) {
            return None;
        }
        let angular = radius_km / EARTH_RADIUS_KM;
        let dlat = angular.to_degrees();
        let min_lat = latitude - dlat;
        let max_lat = latitude + dlat;
        if min_lat <= -90.0 || max_lat >= 90.0 {
            return None;
        }

        let ratio = angular.sin() / latitude.to_radians().cos();
        if !(ratio.is_finite() && ratio < 1.0) {
            return None;
        }
        let dlon = ratio.asin().to_degrees();
        let min_lon = longitude - dlon;
        let max_lon = longitude + dlon;
        if min_lon < -180.0 || max_lon > 180.0 {
            return None;
        }

        // A hair of slack so the exact circle's edge is never clipped by rounding.
        const SLACK: f64 = 1e-9;
        Some(Self {
            min_lat: min_lat - SLACK,
            max_lat: max_lat + SLACK,
            min_lon: min_lon - SLACK,
            max_lon: max_lon + SLACK,
        })
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}
