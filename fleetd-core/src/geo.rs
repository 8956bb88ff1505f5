//! Spherical-Earth geodesy. All angles in degrees, distances in kilometres.

/// Mean Earth radius used throughout.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, haversine formula.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Initial course from the first point towards the second, normalised
/// to [0, 360).
pub fn initial_bearing_deg(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Advance a coordinate by `distance_km` along `bearing_deg` on the sphere.
/// Returns (lat, lng) with the longitude wrapped into (-180, 180].
pub fn translate(lat: f64, lng: f64, bearing_deg: f64, distance_km: f64) -> (f64, f64) {
    let delta = distance_km / EARTH_RADIUS_KM;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lng.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    (phi2.to_degrees(), wrap_longitude(lambda2.to_degrees()))
}

/// Wrap a longitude into (-180, 180].
pub fn wrap_longitude(lng: f64) -> f64 {
    let mut wrapped = (lng + 180.0) % 360.0;
    if wrapped <= 0.0 {
        wrapped += 360.0;
    }
    wrapped - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paris_to_london_distance() {
        // Notre-Dame to Westminster, roughly 343 km.
        let km = haversine_km(48.8530, 2.3499, 51.4994, -0.1245);
        assert!((km - 343.0).abs() < 2.0, "got {km}");
    }

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(haversine_km(10.5, -42.0, 10.5, -42.0), 0.0);
    }

    #[test]
    fn bearing_due_north_and_east() {
        let north = initial_bearing_deg(0.0, 0.0, 1.0, 0.0);
        assert!(north.abs() < 1e-9 || (north - 360.0).abs() < 1e-9);

        let east = initial_bearing_deg(0.0, 0.0, 0.0, 1.0);
        assert!((east - 90.0).abs() < 1e-9);
    }

    #[test]
    fn bearing_is_normalised() {
        let b = initial_bearing_deg(0.0, 0.0, -1.0, -1.0);
        assert!((0.0..360.0).contains(&b));
    }

    #[test]
    fn translate_round_trips_through_haversine() {
        let (lat, lng) = translate(48.8566, 2.3522, 45.0, 10.0);
        let km = haversine_km(48.8566, 2.3522, lat, lng);
        assert!((km - 10.0).abs() < 1e-6, "got {km}");
    }

    #[test]
    fn translate_wraps_the_antimeridian() {
        let (_, lng) = translate(0.0, 179.9, 90.0, 50.0);
        assert!((-180.0..=180.0).contains(&lng));
        assert!(lng < 0.0, "expected a negative longitude, got {lng}");
    }

    #[test]
    fn wrap_longitude_edges() {
        assert_eq!(wrap_longitude(180.0), 180.0);
        assert_eq!(wrap_longitude(-180.0), 180.0);
        assert_eq!(wrap_longitude(190.0), -170.0);
        assert_eq!(wrap_longitude(-190.0), 170.0);
        assert_eq!(wrap_longitude(0.0), 0.0);
    }
}
