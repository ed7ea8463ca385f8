//! Analytic continuum absorption.
//!
//! Compact empirical fits for the four continua that matter in the thermal
//! infrared: the sub-Lorentzian CO2 line wings (chi-factor), the H2O self and
//! foreign continuum, and the collision-induced fundamentals of N2 and O2.
//! Each function returns a volume absorption coefficient [km^-1] and is a
//! pure function of wavenumber, pressure, temperature and (for CO2/H2O) the
//! local mixing ratio.

use crate::constants::{KB, P0, VMR_N2, VMR_O2};
use crate::interp::lin;

/// Air number density [molec/cm^3] for pressure [hPa] and temperature [K].
#[inline]
pub fn air_density(p: f64, t: f64) -> f64 {
    // p in Pa over kT, converted from m^-3 to cm^-3.
    p * 100.0 / (KB * t) * 1e-6
}

/// Density in amagat units (relative to Loschmidt's number).
#[inline]
fn amagat(p: f64, t: f64) -> f64 {
    air_density(p, t) / 2.6867811e19
}

/// CO2 chi-factor line-wing continuum.
///
/// Far-wing absorption of the nu2 (667 cm^-1) and nu3 (2326 cm^-1) band
/// systems with a sub-Lorentzian exponential chi factor. Negligible more
/// than a few hundred wavenumbers away from the band centers.
pub fn ctm_co2(nu: f64, p: f64, t: f64, q_co2: f64) -> f64 {
    // (center [cm^-1], integrated band strength [cm^-1/(molec cm^-2)])
    const BANDS: [(f64, f64); 2] = [(667.38, 2.4e-17), (2326.0, 9.6e-16)];
    // Air-broadened half width at the reference state [cm^-1].
    const GAMMA0: f64 = 0.07;
    // Chi-factor e-folding scale [cm^-1].
    const CHI_SCALE: f64 = 23.0;

    let gamma = GAMMA0 * (p / P0) * (296.0 / t).powf(0.7);
    let mut sigma = 0.0;
    for (center, strength) in BANDS {
        // Inside the band head the tables carry the absorption; the wing
        // correction starts beyond 10 cm^-1 from the center.
        let dnu = (nu - center).abs().max(10.0);
        if dnu > 600.0 {
            continue;
        }
        sigma += strength * gamma / (std::f64::consts::PI * dnu * dnu) * (-dnu / CHI_SCALE).exp();
    }
    q_co2 * air_density(p, t) * sigma * 1e5
}

/// H2O self and foreign continuum.
///
/// CKD-style formulation: the self term scales with the water vapor partial
/// pressure and a strong negative temperature dependence, the foreign term
/// with the dry-air partial pressure.
pub fn ctm_h2o(nu: f64, p: f64, t: f64, q_h2o: f64) -> f64 {
    // Reference coefficients [cm^2/(molec atm)] with exponential wavenumber
    // fits of the 296 K continuum.
    let cs = 4.25e-21 * (-nu / 280.0).exp() * (296.0 / t).powf(4.25);
    let cf = 1.2e-22 * (-nu / 160.0).exp();

    let p_atm = p / P0;
    let n_h2o = q_h2o * air_density(p, t);
    n_h2o * p_atm * (cs * q_h2o + cf * (1.0 - q_h2o)) * 1e5
}

/// Band-shape table: (wavenumber [cm^-1], binary absorption at 296 K
/// [cm^-1 amagat^-2], temperature coefficient [K]).
type CiaNode = (f64, f64, f64);

/// N2-N2 collision-induced fundamental (2020-2690 cm^-1).
const N2_CIA: [CiaNode; 11] = [
    (2020.0, 0.00e-7, 700.0),
    (2120.0, 0.36e-7, 720.0),
    (2180.0, 0.90e-7, 610.0),
    (2260.0, 1.62e-7, 470.0),
    (2330.0, 2.40e-7, 380.0),
    (2400.0, 1.90e-7, 430.0),
    (2470.0, 1.10e-7, 550.0),
    (2540.0, 0.56e-7, 640.0),
    (2600.0, 0.26e-7, 700.0),
    (2650.0, 0.11e-7, 740.0),
    (2690.0, 0.00e-7, 760.0),
];

/// O2-O2 collision-induced fundamental (1360-1790 cm^-1).
const O2_CIA: [CiaNode; 9] = [
    (1360.0, 0.00e-7, 870.0),
    (1440.0, 0.25e-7, 800.0),
    (1500.0, 0.66e-7, 690.0),
    (1556.0, 1.30e-7, 560.0),
    (1610.0, 0.95e-7, 620.0),
    (1670.0, 0.55e-7, 710.0),
    (1720.0, 0.27e-7, 780.0),
    (1760.0, 0.11e-7, 830.0),
    (1790.0, 0.00e-7, 870.0),
];

fn cia(nodes: &[CiaNode], nu: f64, t: f64) -> f64 {
    let first = nodes[0].0;
    let last = nodes[nodes.len() - 1].0;
    if nu <= first || nu >= last {
        return 0.0;
    }
    let mut i = 0;
    while i + 2 < nodes.len() && nu >= nodes[i + 1].0 {
        i += 1;
    }
    let b296 = lin(nodes[i].0, nodes[i].1, nodes[i + 1].0, nodes[i + 1].1, nu);
    let beta = lin(nodes[i].0, nodes[i].2, nodes[i + 1].0, nodes[i + 1].2, nu);
    b296 * (beta * (1.0 / 296.0 - 1.0 / t)).exp()
}

/// N2 collision-induced continuum.
pub fn ctm_n2(nu: f64, p: f64, t: f64) -> f64 {
    let rho = VMR_N2 * amagat(p, t);
    cia(&N2_CIA, nu, t) * rho * rho * 1e5
}

/// O2 collision-induced continuum.
pub fn ctm_o2(nu: f64, p: f64, t: f64) -> f64 {
    let rho = VMR_O2 * amagat(p, t);
    cia(&O2_CIA, nu, t) * rho * rho * 1e5
}

#[cfg(test)]
mod continua_test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn air_density_loschmidt() {
        // Standard conditions recover Loschmidt's number.
        assert_relative_eq!(
            air_density(1013.25, 273.15),
            2.6868e19,
            max_relative = 1e-3
        );
    }

    #[test]
    fn co2_wing_positive_and_local() {
        let beta = ctm_co2(792.0, 1013.25, 288.0, 3.7e-4);
        assert!(beta > 0.0);
        // A window channel far from both band systems sees nothing.
        assert_eq!(ctm_co2(1300.0, 1013.25, 288.0, 3.7e-4), 0.0);
    }

    #[test]
    fn co2_wing_grows_with_pressure() {
        let lo = ctm_co2(700.0, 100.0, 250.0, 3.7e-4);
        let hi = ctm_co2(700.0, 1000.0, 250.0, 3.7e-4);
        assert!(hi > lo * 10.0);
    }

    #[test]
    fn h2o_self_term_dominates_when_moist() {
        let dry = ctm_h2o(800.0, 1013.25, 288.0, 1e-6);
        let moist = ctm_h2o(800.0, 1013.25, 288.0, 1e-2);
        assert!(moist > dry * 1e3);
        // Boundary-layer magnitude in the window region [km^-1].
        assert!(moist > 1e-3 && moist < 1.0, "beta = {moist}");
    }

    #[test]
    fn h2o_self_term_decreases_with_temperature() {
        let cold = ctm_h2o(800.0, 1013.25, 260.0, 1e-2);
        let warm = ctm_h2o(800.0, 1013.25, 300.0, 1e-2);
        assert!(cold > warm);
    }

    #[test]
    fn n2_cia_band_shape() {
        // Peak near 2330, zero outside the band.
        let peak = ctm_n2(2330.0, 1013.25, 296.0);
        assert!(peak > ctm_n2(2150.0, 1013.25, 296.0));
        assert_eq!(ctm_n2(2000.0, 1013.25, 296.0), 0.0);
        assert_eq!(ctm_n2(2800.0, 1013.25, 296.0), 0.0);
        // Roughly 1e-2 km^-1 at the surface.
        assert!(peak > 1e-3 && peak < 1e-1, "beta = {peak}");
    }

    #[test]
    fn o2_cia_band_shape() {
        let peak = ctm_o2(1556.0, 1013.25, 296.0);
        assert!(peak > 0.0);
        assert_eq!(ctm_o2(1200.0, 1013.25, 296.0), 0.0);
        // O2 is rarer than N2, its continuum correspondingly weaker.
        assert!(peak < ctm_n2(2330.0, 1013.25, 296.0));
    }

    #[test]
    fn cia_quadratic_in_density() {
        let lo = ctm_n2(2330.0, 500.0, 296.0);
        let hi = ctm_n2(2330.0, 1000.0, 296.0);
        assert_relative_eq!(hi / lo, 4.0, max_relative = 1e-10);
    }
}
