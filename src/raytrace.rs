//! Refraction-aware ray paths through the spherical atmosphere.
//!
//! A ray is advanced from the observer towards the view point in steps bounded
//! by the maximum segment length and the maximum vertical excursion. Each
//! step contributes its midpoint state, the segment column densities and the
//! cumulative Curtis-Godson averages consumed by the band integrator.

use nalgebra::Vector3;
use smallvec::SmallVec;

use crate::atmosphere::Atmosphere;
use crate::config::Config;
use crate::constants::{NLOS_MAX, RE};
use crate::continua::air_density;
use crate::errors::{LimbraError, Result};
use crate::geo::{cart2geo, geo2cart, refractivity};
use crate::interp::grid_interp;
use crate::observations::Observations;

/// Per-gas accumulator sized for the usual emitter count.
pub type GasVec = SmallVec<[f64; 8]>;

/// Surface state captured when a ray intersects the ground.
#[derive(Debug, Clone)]
pub struct Surface {
    /// Surface temperature [K].
    pub sft: f64,
    /// Surface emissivity per channel.
    pub eps: Vec<f64>,
}

/// Line-of-sight data of one ray.
///
/// Points are ordered from the observer towards the far end; each entry is a
/// segment midpoint.
#[derive(Debug, Clone, Default)]
pub struct RayPath {
    /// Altitude [km].
    pub z: Vec<f64>,
    /// Longitude [deg].
    pub lon: Vec<f64>,
    /// Latitude [deg].
    pub lat: Vec<f64>,
    /// Pressure [hPa].
    pub p: Vec<f64>,
    /// Temperature [K].
    pub t: Vec<f64>,
    /// Volume mixing ratio per gas.
    pub q: Vec<GasVec>,
    /// Aerosol plus cloud extinction per channel [km^-1].
    pub k: Vec<Vec<f64>>,
    /// Segment length [km].
    pub ds: Vec<f64>,
    /// Segment column density per gas [molec/cm^2].
    pub u: Vec<GasVec>,
    /// Cumulative Curtis-Godson pressure [hPa].
    pub cgp: Vec<GasVec>,
    /// Cumulative Curtis-Godson temperature [K].
    pub cgt: Vec<GasVec>,
    /// Cumulative column density [molec/cm^2].
    pub cgu: Vec<GasVec>,
    /// Surface state for rays hitting the ground.
    pub surface: Option<Surface>,
}

impl RayPath {
    /// Number of LOS points.
    pub fn np(&self) -> usize {
        self.z.len()
    }

    /// Tangent point (altitude, longitude, latitude) of a limb ray.
    ///
    /// The minimum-altitude LOS point; a NaN triple when the minimum sits at
    /// either end of the path (nadir-like or ground-hitting rays).
    pub fn tangent_point(&self) -> (f64, f64, f64) {
        if self.np() < 3 {
            return (f64::NAN, f64::NAN, f64::NAN);
        }
        let mut ipmin = 0;
        for ip in 1..self.np() {
            if self.z[ip] < self.z[ipmin] {
                ipmin = ip;
            }
        }
        if ipmin == 0 || ipmin == self.np() - 1 {
            return (f64::NAN, f64::NAN, f64::NAN);
        }
        (self.z[ipmin], self.lon[ipmin], self.lat[ipmin])
    }
}

/// Surface emissivity per channel, from the surface spectral grid (blackbody
/// when no grid is configured).
fn surface_emissivity(cfg: &Config, atm: &Atmosphere) -> Vec<f64> {
    cfg.nu
        .iter()
        .map(|&nu| {
            if cfg.nsf() == 0 {
                1.0
            } else {
                grid_interp(&cfg.sfnu, &atm.sfeps, nu).clamp(0.0, 1.0)
            }
        })
        .collect()
}

/// Trace one ray of an observation set.
///
/// Arguments
/// ---------
/// * `cfg`: forward-model configuration (step bounds, refraction switch).
/// * `atm`: atmospheric column.
/// * `obs`: observation geometry.
/// * `ir`: ray index.
///
/// Return
/// ------
/// * The line-of-sight data; empty when the ray misses the atmosphere.
pub fn raytrace(cfg: &Config, atm: &Atmosphere, obs: &Observations, ir: usize) -> Result<RayPath> {
    let mut los = RayPath::default();

    let obs_x = geo2cart(obs.obsz[ir], obs.obslon[ir], obs.obslat[ir]);
    let vp_x = geo2cart(obs.vpz[ir], obs.vplon[ir], obs.vplat[ir]);
    let sep = vp_x - obs_x;
    if sep.norm() <= 0.0 {
        return Err(LimbraError::numerical(
            "raytrace",
            format!("observer and view point of ray {ir} coincide"),
        ));
    }
    let mut dir: Vector3<f64> = sep.normalize();
    let mut x = obs_x;
    let ztop = atm.top();

    // Fast-forward an observer outside the atmosphere to the entry point.
    let (z0, _, _) = cart2geo(&x);
    if z0 > ztop {
        match sphere_entry(&x, &dir, RE + ztop) {
            Some(s) => x += dir * s,
            None => return Ok(los),
        }
    }

    loop {
        let (z, _, _) = cart2geo(&x);
        let rhat = x.normalize();
        let mu = dir.dot(&rhat);

        // Outgoing ray leaving the top of the atmosphere.
        if z >= ztop && mu > 0.0 {
            break;
        }
        if los.np() >= NLOS_MAX {
            return Err(LimbraError::numerical(
                "raytrace",
                format!("ray {ir} exceeds {NLOS_MAX} path points"),
            ));
        }

        // Segment length: bounded by the maximum step and by the vertical
        // excursion; purely horizontal propagation falls back to the step
        // bound, purely vertical rays to the vertical bound.
        let mut ds = if mu.abs() > 0.0 {
            (cfg.raydz / mu.abs()).min(cfg.rayds)
        } else {
            cfg.rayds
        };

        // Clip the final segment to the ground.
        let mut hit_surface = false;
        let xe = x + dir * ds;
        let (ze, _, _) = cart2geo(&xe);
        if ze <= 0.0 {
            let f = z / (z - ze);
            ds *= f.clamp(0.0, 1.0);
            hit_surface = true;
        }

        // Midpoint state.
        let xm = x + dir * (0.5 * ds);
        let (zm, lonm, latm) = cart2geo(&xm);
        let state = atm.interpolate(zm);

        // Segment column densities [molec/cm^2]: mixing ratio times air
        // density times path length (km -> cm).
        let nair = air_density(state.p, state.t);
        let u: GasVec = state.q.iter().map(|&q| q * nair * ds * 1e5).collect();

        // Cumulative Curtis-Godson averages: for the first segment the
        // weighted means are just the local state.
        let (cgp, cgt, cgu): (GasVec, GasVec, GasVec) = match los.np() {
            0 => (
                state.q.iter().map(|_| state.p).collect(),
                state.q.iter().map(|_| state.t).collect(),
                u.clone(),
            ),
            ip => {
                let prev = ip - 1;
                let mut cgp = GasVec::new();
                let mut cgt = GasVec::new();
                let mut cgu = GasVec::new();
                for ig in 0..u.len() {
                    let utot = los.cgu[prev][ig] + u[ig];
                    if utot > 0.0 {
                        cgp.push((los.cgp[prev][ig] * los.cgu[prev][ig] + state.p * u[ig]) / utot);
                        cgt.push((los.cgt[prev][ig] * los.cgu[prev][ig] + state.t * u[ig]) / utot);
                    } else {
                        cgp.push(state.p);
                        cgt.push(state.t);
                    }
                    cgu.push(utot);
                }
                (cgp, cgt, cgu)
            }
        };

        // Aerosol plus cloud extinction per channel.
        let in_cloud = cfg.ncl() > 0 && zm >= atm.clz - atm.cldz && zm <= atm.clz;
        let k: Vec<f64> = cfg
            .nu
            .iter()
            .enumerate()
            .map(|(id, &nu)| {
                let mut kd = state.k[cfg.window[id]];
                if in_cloud {
                    kd += grid_interp(&cfg.clnu, &atm.clk, nu).max(0.0);
                }
                kd
            })
            .collect();

        los.z.push(zm);
        los.lon.push(lonm);
        los.lat.push(latm);
        los.p.push(state.p);
        los.t.push(state.t);
        los.q.push(state.q);
        los.k.push(k);
        los.ds.push(ds);
        los.u.push(u);
        los.cgp.push(cgp);
        los.cgt.push(cgt);
        los.cgu.push(cgu);

        if hit_surface {
            los.surface = Some(Surface {
                sft: atm.sft,
                eps: surface_emissivity(cfg, atm),
            });
            break;
        }

        // Refractive bending: d(n t) / ds = grad n, with the refractivity
        // gradient taken radially from a central difference.
        if cfg.refrac {
            let n = 1.0 + refractivity(state.p, state.t);
            let above = atm.interpolate(zm + cfg.raydz);
            let below = atm.interpolate(zm - cfg.raydz);
            let dndz = (refractivity(above.p, above.t) - refractivity(below.p, below.t))
                / (2.0 * cfg.raydz);
            let grad = xm.normalize() * dndz;
            dir = (dir * n + grad * ds).normalize();
        }

        x += dir * ds;
    }

    Ok(los)
}

/// Distance along `dir` from `x` to the sphere of radius `r`, if the ray
/// intersects it in the forward direction.
fn sphere_entry(x: &Vector3<f64>, dir: &Vector3<f64>, r: f64) -> Option<f64> {
    let b = x.dot(dir);
    let c = x.dot(x) - r * r;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let s = -b - disc.sqrt();
    (s > 0.0).then_some(s)
}

/// Trace every ray and write the tangent points back into the observations.
pub fn raytrace_all(cfg: &Config, atm: &Atmosphere, obs: &mut Observations) -> Result<Vec<RayPath>> {
    let mut paths = Vec::with_capacity(obs.nr());
    for ir in 0..obs.nr() {
        let los = raytrace(cfg, atm, obs, ir)?;
        let (tpz, tplon, tplat) = los.tangent_point();
        obs.tpz[ir] = tpz;
        obs.tplon[ir] = tplon;
        obs.tplat[ir] = tplat;
        paths.push(los);
    }
    Ok(paths)
}

#[cfg(test)]
mod raytrace_test {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::testutil::{config_with, standard_atmosphere};

    fn limb_obs(cfg: &Config, tangent_z: f64) -> Observations {
        let mut obs = Observations::new(cfg);
        obs.push_ray(0.0, 800.0, 0.0, -30.0, tangent_z, 0.0, 0.0);
        obs
    }

    #[test]
    fn limb_ray_descends_then_ascends() {
        let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "0.5")]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let obs = limb_obs(&cfg, 20.0);
        let los = raytrace(&cfg, &atm, &obs, 0).unwrap();
        assert!(los.np() > 10);

        let ipmin = (0..los.np())
            .min_by(|&a, &b| los.z[a].total_cmp(&los.z[b]))
            .unwrap();
        assert!(ipmin > 0 && ipmin < los.np() - 1);
        // Monotone down to the tangent, monotone up afterwards.
        for ip in 1..=ipmin {
            assert!(los.z[ip] <= los.z[ip - 1] + 1e-9);
        }
        for ip in ipmin + 1..los.np() {
            assert!(los.z[ip] >= los.z[ip - 1] - 1e-9);
        }

        // The tangent altitude tracks the geometric view-point altitude to
        // within the vertical step (no refraction configured here).
        let (tpz, _, tplat) = los.tangent_point();
        assert_abs_diff_eq!(tpz, 20.0, epsilon = 0.5);
        assert!(tplat.abs() < 35.0);
    }

    #[test]
    fn step_bounds_hold() {
        let cfg = config_with(&[("RAYDS", "5"), ("RAYDZ", "0.25")]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let obs = limb_obs(&cfg, 12.0);
        let los = raytrace(&cfg, &atm, &obs, 0).unwrap();
        for ip in 0..los.np() {
            assert!(los.ds[ip] <= 5.0 + 1e-9);
        }
        for ip in 1..los.np() {
            assert!((los.z[ip] - los.z[ip - 1]).abs() <= 2.0 * 0.25 + 1e-6);
        }
    }

    #[test]
    fn nadir_ray_hits_surface() {
        let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "1")]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let mut obs = Observations::new(&cfg);
        obs.push_ray(0.0, 705.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let los = raytrace(&cfg, &atm, &obs, 0).unwrap();

        let surface = los.surface.as_ref().expect("nadir ray must hit the ground");
        assert_eq!(surface.eps.len(), cfg.nd());
        let (tpz, _, _) = los.tangent_point();
        assert!(tpz.is_nan());
        // Path length through the column is close to the top altitude.
        let total: f64 = los.ds.iter().sum();
        assert_abs_diff_eq!(total, 80.0, epsilon = 1.5);
        // Final point sits just above the ground.
        assert!(*los.z.last().unwrap() < 1.0);
    }

    #[test]
    fn ray_missing_atmosphere_is_empty() {
        let cfg = config_with(&[]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let mut obs = Observations::new(&cfg);
        // View point above the atmosphere on the same side.
        obs.push_ray(0.0, 800.0, 0.0, 0.0, 400.0, 20.0, 0.0);
        let los = raytrace(&cfg, &atm, &obs, 0).unwrap();
        assert_eq!(los.np(), 0);
    }

    #[test]
    fn column_density_accumulates() {
        let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "0.5")]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let obs = limb_obs(&cfg, 15.0);
        let los = raytrace(&cfg, &atm, &obs, 0).unwrap();

        let last = los.np() - 1;
        let total: f64 = (0..los.np()).map(|ip| los.u[ip][0]).sum();
        assert_abs_diff_eq!(los.cgu[last][0], total, epsilon = total * 1e-12);
        // Curtis-Godson pressure lies between the path extremes.
        let pmax = los.p.iter().cloned().fold(0.0, f64::max);
        assert!(los.cgp[last][0] > 0.0 && los.cgp[last][0] < pmax);
    }

    #[test]
    fn raytrace_all_fills_tangent_points() {
        let cfg = config_with(&[("RAYDS", "10"), ("RAYDZ", "0.5")]);
        let atm = standard_atmosphere(&cfg, 80.0, 2.0);
        let mut obs = Observations::new(&cfg);
        obs.push_ray(0.0, 800.0, 0.0, -30.0, 25.0, 0.0, 0.0);
        obs.push_ray(0.0, 705.0, 0.0, 0.0, 0.0, 0.0, 0.0);

        let paths = raytrace_all(&cfg, &atm, &mut obs).unwrap();
        assert_eq!(paths.len(), 2);
        assert_abs_diff_eq!(obs.tpz[0], 25.0, epsilon = 0.5);
        assert!(obs.tpz[1].is_nan());
    }

    #[test]
    fn refraction_lowers_the_apparent_tangent() {
        let cfg_straight = config_with(&[("RAYDS", "5"), ("RAYDZ", "0.2")]);
        let cfg_refrac = config_with(&[("RAYDS", "5"), ("RAYDZ", "0.2"), ("REFRAC", "1")]);
        let atm = standard_atmosphere(&cfg_straight, 80.0, 2.0);
        let obs = limb_obs(&cfg_straight, 5.0);

        let straight = raytrace(&cfg_straight, &atm, &obs, 0).unwrap();
        let refrac = raytrace(&cfg_refrac, &atm, &obs, 0).unwrap();
        let (tz_s, _, _) = straight.tangent_point();
        let (tz_r, _, _) = refrac.tangent_point();
        // Refraction bends the ray towards the surface.
        assert!(tz_r < tz_s);
    }
}
