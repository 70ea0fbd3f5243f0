//! Great-circle helpers.

use crate::models::Coordinates;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters.
pub fn distance_m(a: &Coordinates, b: &Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Largest distance from `origin` to any of `points`, 0 when empty.
pub fn max_deviation_m<'a, I>(origin: &Coordinates, points: I) -> f64
where
    I: IntoIterator<Item = &'a Coordinates>,
{
    points
        .into_iter()
        .map(|p| distance_m(origin, p))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinates {
        Coordinates::new(lat, lon).unwrap()
    }

    #[test]
    fn test_distance_zero() {
        let p = c(59.3145, 18.0736);
        assert_eq!(distance_m(&p, &p), 0.0);
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = distance_m(&c(0.0, 0.0), &c(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_short_distance() {
        // ~10 m north
        let d = distance_m(&c(59.3145, 18.0736), &c(59.31459, 18.0736));
        assert!((d - 10.0).abs() < 0.1, "got {d}");
    }

    #[test]
    fn test_max_deviation() {
        let origin = c(59.3145, 18.0736);
        let points = [origin, c(59.31459, 18.0736), c(59.31455, 18.0736)];
        let dev = max_deviation_m(&origin, points.iter());
        assert!((dev - 10.0).abs() < 0.1, "got {dev}");
        assert_eq!(max_deviation_m(&origin, std::iter::empty()), 0.0);
    }
}
