//! Forward model: band radiative transfer along ray paths.
//!
//! Radiances are integrated front-to-back from the observer. Gas
//! transmittances come from the emissivity tables under either the
//! emissivity growth approximation (EGA) or the Curtis-Godson approximation
//! (CGA); continua, aerosol and cloud extinction enter the segment optical
//! depth directly. Rays are independent and computed in parallel.

use log::warn;
use rayon::prelude::*;
use smallvec::SmallVec;

use crate::atmosphere::Atmosphere;
use crate::config::{Config, ForwardKind, SurfaceType};
use crate::constants::{DEG2RAD, OMEGA_SUN, TSUN};
use crate::continua::{ctm_co2, ctm_h2o, ctm_n2, ctm_o2};
use crate::errors::{LimbraError, Result};
use crate::geo::{brightness, cart2geo, geo2cart, planck, sza};
use crate::interp::grid_interp;
use crate::observations::Observations;
use crate::raytrace::{raytrace, RayPath};
use crate::tables::TableStore;

/// Host-provided replacement for the internal band model.
///
/// Implementations fill `obs.rad` and `obs.tau` for every ray from the given
/// atmospheric state.
pub trait ForwardEngine: Sync {
    fn forward(&self, cfg: &Config, atm: &Atmosphere, obs: &mut Observations) -> Result<()>;
}

/// Radiance, transmittance and tangent point of one pencil beam.
struct PencilResult {
    rad: Vec<f64>,
    tau: Vec<f64>,
    tangent: (f64, f64, f64),
}

/// Run the forward model for every ray of an observation set.
///
/// Computes `obs.rad` and `obs.tau` per channel, applies the field-of-view
/// convolution when one is configured, and converts radiances to brightness
/// temperatures when `write_bbt` is set. Tangent points are updated from the
/// traced rays.
pub fn formod(cfg: &Config, tbl: &TableStore, atm: &Atmosphere, obs: &mut Observations) -> Result<()> {
    formod_with(cfg, tbl, atm, obs, None)
}

/// [`formod`] with an optional external engine taking over the whole
/// computation when the configuration selects it.
pub fn formod_with(
    cfg: &Config,
    tbl: &TableStore,
    atm: &Atmosphere,
    obs: &mut Observations,
    engine: Option<&dyn ForwardEngine>,
) -> Result<()> {
    if cfg.formod == ForwardKind::External {
        let engine = engine.ok_or_else(|| LimbraError::Config {
            key: "FORMOD".to_string(),
            reason: "external forward model selected but no engine provided".to_string(),
        })?;
        return engine.forward(cfg, atm, obs);
    }

    let results: Vec<Result<PencilResult>> = (0..obs.nr())
        .into_par_iter()
        .map(|ir| {
            if cfg.fov_dz.is_empty() {
                pencil(cfg, tbl, atm, obs, ir, true)
            } else {
                fov_convolved(cfg, tbl, atm, obs, ir)
            }
        })
        .collect();

    for (ir, result) in results.into_iter().enumerate() {
        let result = result?;
        for id in 0..cfg.nd() {
            obs.rad[id][ir] = result.rad[id];
            obs.tau[id][ir] = result.tau[id];
        }
        (obs.tpz[ir], obs.tplon[ir], obs.tplat[ir]) = result.tangent;
    }

    if cfg.write_bbt {
        for id in 0..cfg.nd() {
            for ir in 0..obs.nr() {
                obs.rad[id][ir] = brightness(obs.rad[id][ir], cfg.nu[id]);
            }
        }
    }
    Ok(())
}

/// Compute one pencil beam.
///
/// `with_surface` suppresses the surface term for the secondary downward ray
/// so the reflection cannot recurse.
fn pencil(
    cfg: &Config,
    tbl: &TableStore,
    atm: &Atmosphere,
    obs: &Observations,
    ir: usize,
    with_surface: bool,
) -> Result<PencilResult> {
    let los = raytrace(cfg, atm, obs, ir)?;

    let nd = cfg.nd();
    let ng = cfg.ng();
    let mut rad = vec![0.0; nd];
    let mut tau = vec![1.0; nd];
    let tangent = los.tangent_point();

    // Accumulated path transmittance per channel and gas.
    let mut tau_path: Vec<SmallVec<[f64; 8]>> = vec![SmallVec::from_elem(1.0, ng); nd];
    let mut src = vec![0.0; nd];

    for ip in 0..los.np() {
        tbl.source(los.t[ip], &mut src);
        let ds = los.ds[ip];

        for id in 0..nd {
            // Gas transmittance of this segment: product over emitters.
            let mut tau_gas = 1.0;
            for ig in 0..ng {
                let old = tau_path[id][ig];
                let new = match cfg.formod {
                    ForwardKind::Ega => {
                        // Grow the path emissivity by the segment column at
                        // the local (p, T).
                        1.0 - tbl.ega_growth(
                            ig,
                            id,
                            los.p[ip],
                            los.t[ip],
                            1.0 - old,
                            los.u[ip][ig],
                        )
                    }
                    _ => {
                        // Curtis-Godson: full-column transmittance at the
                        // u-weighted mean state.
                        1.0 - tbl.emissivity(
                            ig,
                            id,
                            los.cgp[ip][ig],
                            los.cgt[ip][ig],
                            los.cgu[ip][ig],
                        )
                    }
                };
                let new = new.clamp(0.0, 1.0).min(old);
                tau_gas *= if old > 0.0 { new / old } else { 0.0 };
                tau_path[id][ig] = new;
            }

            // Continuum and particle extinction of this segment.
            let beta = (continua(cfg, &los, ip, cfg.nu[id]) + los.k[ip][id]).max(0.0);
            let eps_seg = 1.0 - tau_gas * (-ds * beta).exp();
            debug_assert!((0.0..=1.0).contains(&eps_seg));

            rad[id] += tau[id] * eps_seg * src[id];
            tau[id] *= 1.0 - eps_seg;
        }
    }

    // Surface contribution at the far end of the ray.
    if let Some(surface) = &los.surface {
        if with_surface && cfg.sftype != SurfaceType::None {
            let mut src_sf = vec![0.0; nd];
            tbl.source(surface.sft, &mut src_sf);

            for id in 0..nd {
                rad[id] += tau[id] * surface.eps[id] * src_sf[id];
            }

            match cfg.sftype {
                SurfaceType::Downward => {
                    let l_down = downward_radiance(cfg, tbl, atm, obs, ir, &los)?;
                    for id in 0..nd {
                        rad[id] += (1.0 - surface.eps[id]) * tau[id] * l_down[id];
                    }
                }
                SurfaceType::Solar => {
                    let last = los.np() - 1;
                    let sfsza = if cfg.sfsza >= -90.0 {
                        cfg.sfsza
                    } else {
                        sza(obs.time[ir], los.lon[last], los.lat[last])
                    };
                    let mu_sun = (sfsza * DEG2RAD).cos().max(0.0);
                    for id in 0..nd {
                        rad[id] += (1.0 - surface.eps[id])
                            * tau[id]
                            * planck(TSUN, cfg.nu[id])
                            * mu_sun
                            * OMEGA_SUN;
                    }
                }
                _ => {}
            }

            for id in 0..nd {
                tau[id] *= 1.0 - surface.eps[id];
            }
        }
    }

    Ok(PencilResult { rad, tau, tangent })
}

/// Continuum absorption coefficient [km^-1] at one path point and wavenumber.
fn continua(cfg: &Config, los: &RayPath, ip: usize, nu: f64) -> f64 {
    let (p, t) = (los.p[ip], los.t[ip]);
    let mut beta = 0.0;
    if cfg.ctm_co2 {
        if let Some(ig) = cfg.ig_co2 {
            beta += ctm_co2(nu, p, t, los.q[ip][ig]);
        }
    }
    if cfg.ctm_h2o {
        if let Some(ig) = cfg.ig_h2o {
            beta += ctm_h2o(nu, p, t, los.q[ip][ig]);
        }
    }
    if cfg.ctm_n2 {
        beta += ctm_n2(nu, p, t);
    }
    if cfg.ctm_o2 {
        beta += ctm_o2(nu, p, t);
    }
    beta
}

/// Downward radiance arriving at the surface hit point of `los`, from a
/// secondary ray mirrored specularly at the surface.
fn downward_radiance(
    cfg: &Config,
    tbl: &TableStore,
    atm: &Atmosphere,
    obs: &Observations,
    ir: usize,
    los: &RayPath,
) -> Result<Vec<f64>> {
    let last = los.np() - 1;
    let (sfz, sflon, sflat) = (0.0, los.lon[last], los.lat[last]);

    // Incoming direction at the surface, mirrored at the local vertical.
    let x_sf = geo2cart(sfz, sflon, sflat);
    let x_obs = geo2cart(obs.obsz[ir], obs.obslon[ir], obs.obslat[ir]);
    let dir = (x_sf - x_obs).normalize();
    let rhat = x_sf.normalize();
    let mirrored = dir - rhat * (2.0 * dir.dot(&rhat));

    // View point far outside the atmosphere along the mirrored direction.
    let x_vp = x_sf + mirrored * (4.0 * atm.top().max(100.0));
    let (vpz, vplon, vplat) = cart2geo(&x_vp);

    let mut down = Observations::new(cfg);
    down.push_ray(obs.time[ir], sfz, sflon, sflat, vpz, vplon, vplat);
    let result = pencil(cfg, tbl, atm, &down, 0, false)?;
    Ok(result.rad)
}

/// Field-of-view convolution: sub-rays with view-point altitude offsets
/// spanning the shape support, weighted by the shape function.
fn fov_convolved(
    cfg: &Config,
    tbl: &TableStore,
    atm: &Atmosphere,
    obs: &Observations,
    ir: usize,
) -> Result<PencilResult> {
    let dz_min = cfg.fov_dz.iter().cloned().fold(f64::INFINITY, f64::min);
    let dz_max = cfg.fov_dz.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let mut weights = Vec::with_capacity(cfg.nfov);
    let mut results = Vec::with_capacity(cfg.nfov);
    for i in 0..cfg.nfov {
        let dz = dz_min + (dz_max - dz_min) * i as f64 / (cfg.nfov - 1) as f64;
        let w = grid_interp(&cfg.fov_dz, &cfg.fov_w, dz).max(0.0);

        let mut sub = Observations::new(cfg);
        sub.push_ray(
            obs.time[ir],
            obs.obsz[ir],
            obs.obslon[ir],
            obs.obslat[ir],
            obs.vpz[ir] + dz,
            obs.vplon[ir],
            obs.vplat[ir],
        );
        weights.push(w);
        results.push(pencil(cfg, tbl, atm, &sub, 0, true)?);
    }

    let wsum: f64 = weights.iter().sum();
    if wsum <= 0.0 {
        warn!("Field-of-view weights sum to zero, falling back to pencil beam");
        return pencil(cfg, tbl, atm, obs, ir, true);
    }

    let nd = cfg.nd();
    let mut rad = vec![0.0; nd];
    let mut tau = vec![0.0; nd];
    for (w, r) in weights.iter().zip(&results) {
        for id in 0..nd {
            rad[id] += w / wsum * r.rad[id];
            tau[id] += w / wsum * r.tau[id];
        }
    }

    // Geometry of the central sub-ray.
    let tangent = results[cfg.nfov / 2].tangent;
    Ok(PencilResult { rad, tau, tangent })
}
