//! Finite-difference kernel matrix.
//!
//! One-sided differences around a shared baseline forward calculation. A
//! perturbed profile level can only influence rays that pass through it, so
//! columns re-evaluate just the rays whose tangent altitude lies below the
//! level above the perturbation; scalar quantities re-evaluate every ray.

use log::debug;
use nalgebra::DMatrix;

use crate::atmosphere::Atmosphere;
use crate::config::Config;
use crate::errors::Result;
use crate::forward::{formod_with, ForwardEngine};
use crate::observations::Observations;
use crate::statevec::{atm2x, layout, obs2y, x2atm, Quantity, StateSlot};
use crate::tables::TableStore;

/// Finite-difference step for one state-vector element.
fn perturbation(slot: &StateSlot, value: f64) -> f64 {
    match slot.0 {
        Quantity::Pressure => 0.01 * value.abs().max(1e-6),
        Quantity::Temperature => 1.0,
        Quantity::Vmr(_) => (0.1 * value.abs()).max(1e-15),
        Quantity::Extinction(_) => 1e-4,
        Quantity::CloudTop => 0.1,
        Quantity::CloudDepth => 0.1,
        Quantity::CloudExt(_) => 1e-4,
        Quantity::SurfaceTemp => 1.0,
        Quantity::SurfaceEps(_) => 0.01,
    }
}

/// Rays influenced by a state-vector element.
///
/// For a profile quantity at level `ip`, rays whose tangent altitude lies
/// above the next profile level cannot see the perturbation; rays without a
/// limb tangent (NaN) are always re-evaluated.
fn affected_rays(atm: &Atmosphere, obs: &Observations, slot: &StateSlot) -> Vec<usize> {
    match slot.1 {
        None => (0..obs.nr()).collect(),
        Some(ip) => {
            let z_above = atm.z[(ip + 1).min(atm.np() - 1)];
            (0..obs.nr())
                .filter(|&ir| obs.tpz[ir].is_nan() || obs.tpz[ir] <= z_above)
                .collect()
        }
    }
}

/// Compute the kernel matrix K = dy/dx around the state of `atm`.
///
/// `obs` provides the measurement geometry; its radiances are overwritten
/// with the baseline forward calculation.
pub fn kernel(
    cfg: &Config,
    tbl: &TableStore,
    atm: &Atmosphere,
    obs: &mut Observations,
    engine: Option<&dyn ForwardEngine>,
) -> Result<DMatrix<f64>> {
    let slots = layout(cfg, atm);
    let n = slots.len();

    // Baseline forward model, shared by all columns.
    formod_with(cfg, tbl, atm, obs, engine)?;
    let (y0, _, _) = obs2y(cfg, obs);
    let m = y0.len();
    let x0 = atm2x(atm, &slots);

    let mut k = DMatrix::zeros(m, n);
    debug!("Computing kernel matrix ({m} x {n})");

    for (j, slot) in slots.iter().enumerate() {
        let dx = perturbation(slot, x0[j]);

        // Perturbed state.
        let mut x = x0.clone();
        x[j] += dx;
        let mut atm_pert = atm.clone();
        x2atm(&x, &slots, &mut atm_pert);

        // Forward model restricted to the rays that can see the change.
        let rays = affected_rays(atm, obs, slot);
        if rays.is_empty() {
            continue;
        }
        let mut sub = Observations::new(cfg);
        for &ir in &rays {
            sub.push_ray(
                obs.time[ir],
                obs.obsz[ir],
                obs.obslon[ir],
                obs.obslat[ir],
                obs.vpz[ir],
                obs.vplon[ir],
                obs.vplat[ir],
            );
        }
        formod_with(cfg, tbl, &atm_pert, &mut sub, engine)?;

        for (isub, &ir) in rays.iter().enumerate() {
            for id in 0..cfg.nd() {
                let i = ir * cfg.nd() + id;
                k[(i, j)] = (sub.rad[id][isub] - obs.rad[id][ir]) / dx;
            }
        }
    }
    Ok(k)
}
