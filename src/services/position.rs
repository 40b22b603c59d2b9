/// Time-based position estimation along a trip's route geometry
///
/// Progress through the scheduled journey (elapsed / total duration) is
/// mapped onto the route polyline by distance: a trip 40% through its
/// schedule is placed 40% along the route length.
use crate::geo::{haversine_km, interpolate};
use crate::models::TripDetail;
use chrono::{DateTime, TimeZone};

/// Estimate the current [lon, lat] of a trip at `now`
pub fn estimate<Tz: TimeZone>(trip: &TripDetail, now: &DateTime<Tz>) -> [f64; 2] {
    let Some(progress) = progress(trip, now) else {
        return trip.destination;
    };

    if progress < 0.0 {
        return trip.origin;
    }
    if progress > 1.0 {
        return trip.destination;
    }

    match trip.route.as_slice() {
        [] => trip.destination,
        [only] => *only,
        route => locate_on_route(route, progress)
            .map(|(_, position)| position)
            .unwrap_or(trip.destination),
    }
}

/// Unclamped fraction of the scheduled journey elapsed at `now`.
/// `None` when the schedule has no positive duration.
pub fn progress<Tz: TimeZone>(trip: &TripDetail, now: &DateTime<Tz>) -> Option<f64> {
    let total = trip
        .scheduled_arrival
        .signed_duration_since(trip.scheduled_departure)
        .num_milliseconds() as f64;
    if total <= 0.0 {
        return None;
    }

    let elapsed = now
        .fixed_offset()
        .signed_duration_since(trip.scheduled_departure)
        .num_milliseconds() as f64;

    Some(elapsed / total)
}

/// Find the segment containing `progress` (0..=1) of the route length and the
/// interpolated point on it. `None` when no segment's running length exceeds
/// the target, i.e. at the very end of the route or on a zero-length route.
pub fn locate_on_route(route: &[[f64; 2]], progress: f64) -> Option<(usize, [f64; 2])> {
    let distances: Vec<f64> = route
        .windows(2)
        .map(|pair| haversine_km(pair[0], pair[1]))
        .collect();
    let total_distance: f64 = distances.iter().sum();

    let target_distance = total_distance * progress;
    let mut covered_distance = 0.0;

    for (i, distance) in distances.iter().enumerate() {
        if covered_distance + distance > target_distance {
            let ratio = (target_distance - covered_distance) / distance;
            return Some((i, interpolate(route[i], route[i + 1], ratio)));
        }
        covered_distance += distance;
    }

    None
}
