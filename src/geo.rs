//! Coordinate helpers. Coordinates are `[lon, lat]` pairs in degrees, the
//! GeoJSON order used by the transit API's polylines.

/// Mean Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates using the Haversine formula.
/// Returns distance in kilometers
pub fn haversine_km(from: [f64; 2], to: [f64; 2]) -> f64 {
    let lat1 = from[1].to_radians();
    let lat2 = to[1].to_radians();
    let delta_lat = (to[1] - from[1]).to_radians();
    let delta_lon = (to[0] - from[0]).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Linear blend between two coordinates. Not geodesically exact, fine for
/// the short segments of a route polyline.
pub fn interpolate(from: [f64; 2], to: [f64; 2], ratio: f64) -> [f64; 2] {
    if ratio <= 0.0 {
        return from;
    }
    if ratio >= 1.0 {
        return to;
    }
    [
        from[0] + (to[0] - from[0]) * ratio,
        from[1] + (to[1] - from[1]) * ratio,
    ]
}
