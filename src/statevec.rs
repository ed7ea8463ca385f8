//! Mapping between the atmospheric state and the retrieval state vector.
//!
//! The packing order is canonical: per profile level (increasing altitude)
//! pressure, temperature, the mixing ratios and the window extinctions, each
//! gated by its retrieval altitude window; then the scalar quantities gated
//! by their retrieval flags. Both directions walk the identical layout, so
//! the vector length is stable across iterations.

use nalgebra::DVector;

use crate::atmosphere::Atmosphere;
use crate::config::Config;
use crate::observations::Observations;

/// A retrievable quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Pressure,
    Temperature,
    Vmr(usize),
    Extinction(usize),
    CloudTop,
    CloudDepth,
    CloudExt(usize),
    SurfaceTemp,
    SurfaceEps(usize),
}

impl Quantity {
    /// Display name, using the configured emitter names for mixing ratios.
    pub fn name(&self, cfg: &Config) -> String {
        match self {
            Quantity::Pressure => "PRESSURE".to_string(),
            Quantity::Temperature => "TEMPERATURE".to_string(),
            Quantity::Vmr(ig) => cfg.emitter[*ig].clone(),
            Quantity::Extinction(iw) => format!("EXTINCT_WINDOW{iw}"),
            Quantity::CloudTop => "CLOUD_HEIGHT".to_string(),
            Quantity::CloudDepth => "CLOUD_DEPTH".to_string(),
            Quantity::CloudExt(icl) => format!("CLOUD_EXTINCT{icl}"),
            Quantity::SurfaceTemp => "SURFACE_TEMP".to_string(),
            Quantity::SurfaceEps(isf) => format!("SURFACE_EPS{isf}"),
        }
    }
}

/// One state-vector element: the quantity and its profile level (`None` for
/// the scalar quantities).
pub type StateSlot = (Quantity, Option<usize>);

/// The state-vector layout for a configuration and profile grid.
pub fn layout(cfg: &Config, atm: &Atmosphere) -> Vec<StateSlot> {
    let mut slots = Vec::new();
    let in_window = |z: f64, zmin: f64, zmax: f64| z >= zmin && z <= zmax;

    for ip in 0..atm.np() {
        let z = atm.z[ip];
        if in_window(z, cfg.retp_zmin, cfg.retp_zmax) {
            slots.push((Quantity::Pressure, Some(ip)));
        }
        if in_window(z, cfg.rett_zmin, cfg.rett_zmax) {
            slots.push((Quantity::Temperature, Some(ip)));
        }
        for ig in 0..cfg.ng() {
            if in_window(z, cfg.retq_zmin[ig], cfg.retq_zmax[ig]) {
                slots.push((Quantity::Vmr(ig), Some(ip)));
            }
        }
        for iw in 0..cfg.nw {
            if in_window(z, cfg.retk_zmin[iw], cfg.retk_zmax[iw]) {
                slots.push((Quantity::Extinction(iw), Some(ip)));
            }
        }
    }

    if cfg.ret_clz {
        slots.push((Quantity::CloudTop, None));
    }
    if cfg.ret_cldz {
        slots.push((Quantity::CloudDepth, None));
    }
    if cfg.ret_clk {
        for icl in 0..cfg.ncl() {
            slots.push((Quantity::CloudExt(icl), None));
        }
    }
    if cfg.ret_sft {
        slots.push((Quantity::SurfaceTemp, None));
    }
    if cfg.ret_sfeps {
        for isf in 0..cfg.nsf() {
            slots.push((Quantity::SurfaceEps(isf), None));
        }
    }
    slots
}

fn state_value(atm: &Atmosphere, slot: &StateSlot) -> f64 {
    match (slot.0, slot.1) {
        (Quantity::Pressure, Some(ip)) => atm.p[ip],
        (Quantity::Temperature, Some(ip)) => atm.t[ip],
        (Quantity::Vmr(ig), Some(ip)) => atm.q[ig][ip],
        (Quantity::Extinction(iw), Some(ip)) => atm.k[iw][ip],
        (Quantity::CloudTop, None) => atm.clz,
        (Quantity::CloudDepth, None) => atm.cldz,
        (Quantity::CloudExt(icl), None) => atm.clk[icl],
        (Quantity::SurfaceTemp, None) => atm.sft,
        (Quantity::SurfaceEps(isf), None) => atm.sfeps[isf],
        _ => unreachable!("profile quantity without level index"),
    }
}

fn set_state_value(atm: &mut Atmosphere, slot: &StateSlot, value: f64) {
    match (slot.0, slot.1) {
        (Quantity::Pressure, Some(ip)) => atm.p[ip] = value,
        (Quantity::Temperature, Some(ip)) => atm.t[ip] = value,
        (Quantity::Vmr(ig), Some(ip)) => atm.q[ig][ip] = value,
        (Quantity::Extinction(iw), Some(ip)) => atm.k[iw][ip] = value,
        (Quantity::CloudTop, None) => atm.clz = value,
        (Quantity::CloudDepth, None) => atm.cldz = value,
        (Quantity::CloudExt(icl), None) => atm.clk[icl] = value,
        (Quantity::SurfaceTemp, None) => atm.sft = value,
        (Quantity::SurfaceEps(isf), None) => atm.sfeps[isf] = value,
        _ => unreachable!("profile quantity without level index"),
    }
}

/// Pack the retrieved fields of an atmosphere into a state vector.
pub fn atm2x(atm: &Atmosphere, slots: &[StateSlot]) -> DVector<f64> {
    DVector::from_iterator(slots.len(), slots.iter().map(|s| state_value(atm, s)))
}

/// Unpack a state vector into an atmosphere.
///
/// `atm` must already hold the a priori state so that non-retrieved fields
/// keep their values.
pub fn x2atm(x: &DVector<f64>, slots: &[StateSlot], atm: &mut Atmosphere) {
    for (slot, &value) in slots.iter().zip(x.iter()) {
        set_state_value(atm, slot, value);
    }
}

/// Pack radiances into the measurement vector; returns the vector together
/// with the channel and ray index of every element.
pub fn obs2y(cfg: &Config, obs: &Observations) -> (DVector<f64>, Vec<usize>, Vec<usize>) {
    let m = obs.nr() * cfg.nd();
    let mut y = DVector::zeros(m);
    let mut ida = Vec::with_capacity(m);
    let mut ira = Vec::with_capacity(m);
    let mut i = 0;
    for ir in 0..obs.nr() {
        for id in 0..cfg.nd() {
            y[i] = obs.rad[id][ir];
            ida.push(id);
            ira.push(ir);
            i += 1;
        }
    }
    (y, ida, ira)
}

/// Unpack a measurement vector into the radiances of an observation set.
pub fn y2obs(cfg: &Config, y: &DVector<f64>, obs: &mut Observations) {
    let mut i = 0;
    for ir in 0..obs.nr() {
        for id in 0..cfg.nd() {
            obs.rad[id][ir] = y[i];
            i += 1;
        }
    }
}

#[cfg(test)]
mod statevec_test {
    use super::*;
    use crate::testutil::{config_with, standard_atmosphere};

    fn retrieval_config() -> Config {
        config_with(&[
            ("RETT_ZMIN", "10"),
            ("RETT_ZMAX", "40"),
            ("RETQ_ZMIN[0]", "0"),
            ("RETQ_ZMAX[0]", "20"),
            ("RET_SFT", "1"),
        ])
    }

    #[test]
    fn layout_respects_windows_and_flags() {
        let cfg = retrieval_config();
        let atm = standard_atmosphere(&cfg, 60.0, 5.0);

        let slots = layout(&cfg, &atm);
        // Temperature on 10..40 km (7 levels of the 5 km grid), vmr on
        // 0..20 km (5 levels), one surface scalar.
        let nt = slots
            .iter()
            .filter(|s| s.0 == Quantity::Temperature)
            .count();
        let nq = slots.iter().filter(|s| s.0 == Quantity::Vmr(0)).count();
        assert_eq!(nt, 7);
        assert_eq!(nq, 5);
        assert_eq!(slots.last().unwrap(), &(Quantity::SurfaceTemp, None));
        assert_eq!(slots.len(), nt + nq + 1);
    }

    #[test]
    fn state_round_trip_preserves_everything() {
        let cfg = retrieval_config();
        let atm = standard_atmosphere(&cfg, 60.0, 5.0);
        let slots = layout(&cfg, &atm);

        let x = atm2x(&atm, &slots);
        assert_eq!(x.len(), slots.len());

        // Perturb the vector, decode, re-encode: x2atm(atm2x) is identity on
        // the retrieved fields and leaves the rest alone.
        let mut x2 = x.clone();
        for v in x2.iter_mut() {
            *v *= 1.1;
        }
        let mut atm2 = atm.clone();
        x2atm(&x2, &slots, &mut atm2);
        let back = atm2x(&atm2, &slots);
        assert_eq!(back, x2);

        // Non-retrieved fields are untouched.
        assert_eq!(atm2.p, atm.p);
        assert_eq!(atm2.t[0], atm.t[0]);
        assert_eq!(atm2.clz, atm.clz);
        // Retrieved surface temperature did change.
        assert_ne!(atm2.sft, atm.sft);
    }

    #[test]
    fn measurement_round_trip() {
        let cfg = config_with(&[]);
        let mut obs = Observations::new(&cfg);
        for i in 0..4 {
            obs.push_ray(0.0, 800.0, 0.0, 0.0, 10.0 + f64::from(i), 0.0, 0.0);
            obs.rad[0][i as usize] = f64::from(i) * 0.25;
        }

        let (y, ida, ira) = obs2y(&cfg, &obs);
        assert_eq!(y.len(), 4);
        assert_eq!(ida, vec![0, 0, 0, 0]);
        assert_eq!(ira, vec![0, 1, 2, 3]);

        let mut obs2 = obs.clone();
        for r in obs2.rad[0].iter_mut() {
            *r = -1.0;
        }
        y2obs(&cfg, &y, &mut obs2);
        assert_eq!(obs2.rad, obs.rad);
    }

    #[test]
    fn layout_is_stable_under_state_updates() {
        let cfg = retrieval_config();
        let atm = standard_atmosphere(&cfg, 60.0, 5.0);
        let slots = layout(&cfg, &atm);

        let mut atm2 = atm.clone();
        for t in atm2.t.iter_mut() {
            *t += 25.0;
        }
        assert_eq!(layout(&cfg, &atm2), slots);
    }
}
