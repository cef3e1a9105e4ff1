// WGS-84 coordinate transforms. All solver geometry is ECEF double
// precision; geographic coordinates appear only at the edges.

use std::f64::consts::PI;

const DTOR: f64 = PI / 180.0;
const RTOD: f64 = 180.0 / PI;

/// WGS-84 semi-major axis (m).
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS-84 semi-minor axis (m).
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
/// First eccentricity squared.
pub const WGS84_E2: f64 = 1.0 - (WGS84_B * WGS84_B) / (WGS84_A * WGS84_A);

/// Geodetic lat/lon (degrees) and ellipsoid height (m) to ECEF (m).
pub fn llh_to_ecef(lat: f64, lon: f64, alt: f64) -> [f64; 3] {
    let (slat, clat) = (lat * DTOR).sin_cos();
    let (slon, clon) = (lon * DTOR).sin_cos();

    let rn = WGS84_A / (1.0 - WGS84_E2 * slat * slat).sqrt();

    [
        (rn + alt) * clat * clon,
        (rn + alt) * clat * slon,
        (rn * (1.0 - WGS84_E2) + alt) * slat,
    ]
}

/// ECEF (m) to geodetic lat/lon (degrees) and ellipsoid height (m).
///
/// Bowring's closed-form approximation; sub-millimetre for aircraft
/// altitudes, which is far below our timing noise.
pub fn ecef_to_llh(p: [f64; 3]) -> (f64, f64, f64) {
    let [x, y, z] = p;
    let lon = y.atan2(x);

    let rho = (x * x + y * y).sqrt();
    let ep2 = (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
    let theta = (WGS84_A * z).atan2(WGS84_B * rho);
    let (st, ct) = theta.sin_cos();

    let lat = (z + ep2 * WGS84_B * st * st * st)
        .atan2(rho - WGS84_E2 * WGS84_A * ct * ct * ct);

    let (slat, clat) = lat.sin_cos();
    let rn = WGS84_A / (1.0 - WGS84_E2 * slat * slat).sqrt();
    // Near the poles rho/cos(lat) is ill-conditioned; use the z form there.
    let alt = if clat.abs() > 1e-8 {
        rho / clat - rn
    } else {
        z.abs() - WGS84_B
    };

    (lat * RTOD, lon * RTOD, alt)
}

/// Ellipsoid height (m) of an ECEF point.
pub fn ellipsoid_height(p: [f64; 3]) -> f64 {
    ecef_to_llh(p).2
}

/// Straight-line distance between two ECEF points (m).
#[inline]
pub fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Local geodetic up unit vector at an ECEF point.
pub fn up_vector(p: [f64; 3]) -> [f64; 3] {
    let (lat, lon, _) = ecef_to_llh(p);
    let (slat, clat) = (lat * DTOR).sin_cos();
    let (slon, clon) = (lon * DTOR).sin_cos();
    [clat * clon, clat * slon, slat]
}

/// East and north unit vectors of the local tangent plane at an ECEF point.
pub fn horizontal_basis(p: [f64; 3]) -> ([f64; 3], [f64; 3]) {
    let (lat, lon, _) = ecef_to_llh(p);
    let (slat, clat) = (lat * DTOR).sin_cos();
    let (slon, clon) = (lon * DTOR).sin_cos();
    let east = [-slon, clon, 0.0];
    let north = [-slat * clon, -slat * slon, clat];
    (east, north)
}

/// ENU offset (m) at a reference lat/lon/alt to ECEF. Used by the
/// synthetic-scenario tests to lay receivers out on a local plane.
pub fn enu_to_ecef(ref_lat: f64, ref_lon: f64, ref_alt: f64, enu: [f64; 3]) -> [f64; 3] {
    let origin = llh_to_ecef(ref_lat, ref_lon, ref_alt);
    let (slat, clat) = (ref_lat * DTOR).sin_cos();
    let (slon, clon) = (ref_lon * DTOR).sin_cos();

    let [e, n, u] = enu;
    [
        origin[0] - slon * e - slat * clon * n + clat * clon * u,
        origin[1] + clon * e - slat * slon * n + clat * slon * u,
        origin[2] + clat * n + slat * u,
    ]
}
