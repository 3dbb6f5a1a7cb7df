/// Mean Earth radius in metres (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Equirectangular distance in metres between two points given in degrees.
///
/// The longitude term is scaled by the cosine of the mean latitude to account
/// for meridian convergence. Good to a few metres over a few kilometres; not
/// meant for long ranges.
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();

    let north = d_lat * EARTH_RADIUS_M;
    let east = d_lon * mean_lat.cos() * EARTH_RADIUS_M;
    north.hypot(east)
}
