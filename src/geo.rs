//! Geodetic helpers on the locally spherical Earth.
//!
//! All altitudes are kilometers above the mean Earth radius [`RE`], longitudes
//! and latitudes are degrees. Cartesian vectors are Earth-centered with the
//! z-axis through the north pole.

use nalgebra::Vector3;

use crate::constants::{C1, C2, DEG2RAD, RAD2DEG, RE};

/// Convert geolocation (altitude, longitude, latitude) to Cartesian coordinates.
///
/// Arguments
/// ---------
/// * `z`: altitude above the mean Earth radius [km].
/// * `lon`: longitude [deg].
/// * `lat`: latitude [deg].
///
/// Return
/// ------
/// * Earth-centered Cartesian position [km].
pub fn geo2cart(z: f64, lon: f64, lat: f64) -> Vector3<f64> {
    let radius = z + RE;
    let latrad = lat * DEG2RAD;
    let lonrad = lon * DEG2RAD;
    Vector3::new(
        radius * latrad.cos() * lonrad.cos(),
        radius * latrad.cos() * lonrad.sin(),
        radius * latrad.sin(),
    )
}

/// Convert Cartesian coordinates back to (altitude, longitude, latitude).
pub fn cart2geo(x: &Vector3<f64>) -> (f64, f64, f64) {
    let radius = x.norm();
    let z = radius - RE;
    let lat = (x[2] / radius).asin() * RAD2DEG;
    let lon = x[1].atan2(x[0]) * RAD2DEG;
    (z, lon, lat)
}

/// Air refractivity n - 1 for pressure [hPa] and temperature [K].
#[inline]
pub fn refractivity(p: f64, t: f64) -> f64 {
    7.753e-5 * p / t
}

/// Planck function in wavenumber form.
///
/// Arguments
/// ---------
/// * `t`: temperature [K].
/// * `nu`: wavenumber [cm^-1].
///
/// Return
/// ------
/// * Spectral radiance [W/(m^2 sr cm^-1)].
#[inline]
pub fn planck(t: f64, nu: f64) -> f64 {
    C1 * nu.powi(3) / (C2 * nu / t).exp_m1()
}

/// Brightness temperature [K] of a radiance at a given wavenumber, the
/// inverse of [`planck`].
#[inline]
pub fn brightness(rad: f64, nu: f64) -> f64 {
    C2 * nu / (C1 * nu.powi(3) / rad).ln_1p()
}

/// Solar zenith angle from time and geolocation.
///
/// Low-precision NOAA solar position: apparent ecliptic longitude and
/// declination from the day number, hour angle from Greenwich mean sidereal
/// time. Accurate to a few hundredths of a degree over decades around J2000,
/// which is ample for the solar reflection term.
///
/// Arguments
/// ---------
/// * `sec`: time (seconds since 2000-01-01T00:00Z).
/// * `lon`: longitude [deg].
/// * `lat`: latitude [deg].
///
/// Return
/// ------
/// * Solar zenith angle [deg].
pub fn sza(sec: f64, lon: f64, lat: f64) -> f64 {
    // Days since 2000-01-01T12:00Z.
    let d = sec / 86400.0 - 0.5;

    // Geocentric apparent ecliptic longitude [rad].
    let g = (357.529 + 0.98560028 * d) * DEG2RAD;
    let q = 280.459 + 0.98564736 * d;
    let l = (q + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()) * DEG2RAD;

    // Mean obliquity of the ecliptic [rad].
    let e = (23.439 - 0.00000036 * d) * DEG2RAD;

    // Declination and right ascension [rad].
    let sindec = e.sin() * l.sin();
    let ra = (e.cos() * l.sin()).atan2(l.cos());

    // Hour angle [rad] from Greenwich mean sidereal time [h].
    let gmst = 18.697374558 + 24.06570982441908 * d;
    let lst = gmst + lon / 15.0;
    let h = lst / 12.0 * std::f64::consts::PI - ra;

    let latrad = lat * DEG2RAD;
    (latrad.sin() * sindec + latrad.cos() * (1.0 - sindec * sindec).sqrt() * h.cos()).acos()
        * RAD2DEG
}

#[cfg(test)]
mod geo_test {
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    use super::*;

    #[test]
    fn cartesian_round_trip() {
        for &(z, lon, lat) in &[
            (0.0, 0.0, 0.0),
            (10.0, -120.5, 45.0),
            (705.0, 13.37, -71.2),
            (32.5, 179.9, 89.0),
        ] {
            let x = geo2cart(z, lon, lat);
            let (z2, lon2, lat2) = cart2geo(&x);
            assert_abs_diff_eq!(z, z2, epsilon = 1e-9);
            assert_abs_diff_eq!(lon, lon2, epsilon = 1e-9);
            assert_abs_diff_eq!(lat, lat2, epsilon = 1e-9);
        }
    }

    #[test]
    fn refractivity_standard_conditions() {
        // Surface air: n - 1 around 2.8e-4.
        let n1 = refractivity(1013.25, 288.15);
        assert!(n1 > 2.6e-4 && n1 < 2.9e-4);
    }

    #[test]
    fn brightness_inverts_planck() {
        for t in (150..=350).step_by(25) {
            for nu in [600.0, 990.5, 1500.0, 2500.0] {
                let t = f64::from(t);
                let rad = planck(t, nu);
                assert_relative_eq!(brightness(rad, nu), t, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn planck_monotone_in_temperature() {
        assert!(planck(300.0, 800.0) > planck(200.0, 800.0));
    }

    #[test]
    fn sza_equator_noon() {
        // Vernal-equinox-ish conditions: 2000-03-20 12:00 UT at 0E 0N gives a
        // small zenith angle, local midnight gives a large one.
        let spring_noon = 79.5 * 86400.0;
        assert!(sza(spring_noon, 0.0, 0.0) < 5.0);
        assert!(sza(spring_noon + 43200.0, 0.0, 0.0) > 170.0);
    }
}
